//! Wires the Agent Invoker into the Task Runner's `TaskExecutor` seam.

use async_trait::async_trait;
use relay_core::agent_invoker::{AgentInvoker, InvokeRequest};
use relay_core::error::RelayResult;
use relay_core::model::CircuitBreaker;
use relay_core::tasks::TaskExecutor;
use relay_core::types::ConversationKey;
use tokio::sync::Mutex;

pub struct AgentTaskExecutor {
    invoker: AgentInvoker,
    breaker: Mutex<CircuitBreaker>,
    timeout_ms: u64,
    sandbox: Option<String>,
    approval_policy: Option<String>,
}

impl AgentTaskExecutor {
    pub fn new(invoker: AgentInvoker, timeout_ms: u64, sandbox: Option<String>, approval_policy: Option<String>) -> Self {
        AgentTaskExecutor {
            invoker,
            breaker: Mutex::new(CircuitBreaker::default()),
            timeout_ms,
            sandbox,
            approval_policy,
        }
    }
}

#[async_trait]
impl TaskExecutor for AgentTaskExecutor {
    async fn run_task(&self, key: &ConversationKey, workdir: &str, prompt: String) -> RelayResult<String> {
        let req = InvokeRequest {
            prompt,
            workdir: workdir.to_string(),
            thread_id: None,
            sandbox: self.sandbox.clone(),
            approval_policy: self.approval_policy.clone(),
            timeout_ms: self.timeout_ms,
        };
        let outcome = self.invoker.invoke(&key.to_string(), &self.breaker, req).await?;
        Ok(outcome.text)
    }
}
