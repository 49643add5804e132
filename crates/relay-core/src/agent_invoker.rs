//! Spawns the agent CLI, streams its line-delimited JSON events, and
//! produces a final `{thread_id?, text, model?}`. Supports resume,
//! stale-session retry, model-tier fallback, and cooperative cancellation.

use crate::error::{RelayError, RelayResult};
use crate::model::{classify_prompt, CircuitBreaker, ModelTier};
use serde::Deserialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentProvider {
    Codex,
    Claude,
}

impl AgentProvider {
    pub fn display_name(&self) -> &'static str {
        match self {
            AgentProvider::Codex => "Codex",
            AgentProvider::Claude => "Claude",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub prompt: String,
    pub workdir: String,
    pub thread_id: Option<String>,
    pub sandbox: Option<String>,
    pub approval_policy: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub thread_id: Option<String>,
    pub text: String,
    pub model: Option<String>,
    pub stale_session_recovered: bool,
    pub quota_fallback: bool,
}

/// Fragments that indicate the agent could not resume a saved session. Kept
/// as a configurable set per the relay's documented open question about
/// substring-based stale-session detection.
pub fn default_stale_session_fragments() -> Vec<String> {
    vec![
        "No conversation found with session ID".to_string(),
        "session not found".to_string(),
        "could not resume session".to_string(),
        "Unknown thread_id".to_string(),
    ]
}

pub fn default_quota_fragments() -> Vec<String> {
    vec![
        "rate limit".to_string(),
        "quota exceeded".to_string(),
        "usage limit reached".to_string(),
        "429".to_string(),
    ]
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    let lower = haystack.to_lowercase();
    needles.iter().any(|n| lower.contains(&n.to_lowercase()))
}

#[derive(Debug, Deserialize)]
struct CodexEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    item: Option<CodexItem>,
}

#[derive(Debug, Deserialize)]
struct CodexItem {
    #[serde(rename = "type")]
    item_type: Option<String>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClaudeEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    content: Option<Vec<ClaudeContentBlock>>,
    #[serde(default)]
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClaudeContentBlock {
    #[serde(rename = "type")]
    block_type: Option<String>,
    text: Option<String>,
}

/// Registry of cancellation handles for in-flight agent children, keyed by
/// conversation so `/task stop` or a job cancellation can reach them.
#[derive(Default, Clone)]
pub struct ActiveChildRegistry {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl ActiveChildRegistry {
    pub fn new() -> Self {
        ActiveChildRegistry::default()
    }

    async fn register(&self, key: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().await.insert(key.to_string(), tx);
        rx
    }

    async fn unregister(&self, key: &str) {
        self.inner.lock().await.remove(key);
    }

    pub async fn cancel(&self, key: &str) -> bool {
        if let Some(tx) = self.inner.lock().await.remove(key) {
            tx.send(()).is_ok()
        } else {
            false
        }
    }
}

pub struct AgentInvoker {
    pub binary: String,
    pub provider: AgentProvider,
    pub stale_session_fragments: Vec<String>,
    pub quota_fragments: Vec<String>,
    pub registry: ActiveChildRegistry,
}

impl AgentInvoker {
    pub fn new(binary: impl Into<String>, provider: AgentProvider) -> Self {
        AgentInvoker {
            binary: binary.into(),
            provider,
            stale_session_fragments: default_stale_session_fragments(),
            quota_fragments: default_quota_fragments(),
            registry: ActiveChildRegistry::new(),
        }
    }

    pub async fn invoke(&self, conversation_key: &str, breaker: &Mutex<CircuitBreaker>, req: InvokeRequest) -> RelayResult<InvokeOutcome> {
        match self.provider {
            AgentProvider::Codex => self.invoke_codex(conversation_key, req).await,
            AgentProvider::Claude => self.invoke_claude(conversation_key, breaker, req).await,
        }
    }

    async fn invoke_codex(&self, conversation_key: &str, req: InvokeRequest) -> RelayResult<InvokeOutcome> {
        match self.run_codex_once(conversation_key, &req, req.thread_id.clone()).await {
            Ok(outcome) => Ok(outcome),
            Err(RelayError::StaleSession { agent, session_id, .. }) if req.thread_id.is_some() => {
                warn!(conversation_key, "agent session stale, retrying fresh");
                let mut fresh = self.run_codex_once(conversation_key, &req, None).await?;
                fresh.stale_session_recovered = true;
                fresh.text = format!(
                    "Note: previous {agent} session `{session_id}` could not be resumed, so I started a new session.\n\n{}",
                    fresh.text
                );
                Ok(fresh)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_codex_once(&self, conversation_key: &str, req: &InvokeRequest, resume: Option<String>) -> RelayResult<InvokeOutcome> {
        let mut args: Vec<String> = vec!["exec".to_string()];
        if let Some(id) = &resume {
            args.push("resume".to_string());
            args.push(id.clone());
        }
        args.push("--cd".to_string());
        args.push(req.workdir.clone());
        if let Some(sandbox) = &req.sandbox {
            args.push("--sandbox".to_string());
            args.push(sandbox.clone());
        }
        args.push("--json".to_string());
        args.push("--skip-git-repo-check".to_string());
        args.push(req.prompt.clone());

        let (lines, stderr_tail) = self.spawn_and_stream(conversation_key, &args, req.timeout_ms).await?;

        let mut thread_id = resume;
        let mut final_text: Option<String> = None;
        for line in &lines {
            if let Ok(event) = serde_json::from_str::<CodexEvent>(line) {
                if event.kind == "thread.started" {
                    thread_id = event.thread_id.or(thread_id);
                }
                if event.kind == "item.completed" {
                    if let Some(item) = event.item {
                        if item.item_type.as_deref() == Some("agent_message") {
                            final_text = item.text;
                        }
                    }
                }
            }
        }

        match final_text {
            Some(text) => Ok(InvokeOutcome { thread_id, text, model: None, stale_session_recovered: false, quota_fallback: false }),
            None if contains_any(&stderr_tail, &self.stale_session_fragments) => {
                Err(RelayError::stale_session(self.provider.display_name(), resume_label(&thread_id), stderr_tail))
            }
            None => Err(RelayError::transient_with_stderr("agent produced no final message", stderr_tail)),
        }
    }

    async fn invoke_claude(&self, conversation_key: &str, breaker: &Mutex<CircuitBreaker>, req: InvokeRequest) -> RelayResult<InvokeOutcome> {
        let mut tier = classify_prompt(&req.prompt);
        {
            let guard = breaker.lock().await;
            if !guard.is_available(tier) && tier == ModelTier::Heavy {
                tier = ModelTier::Light;
            }
        }

        match self.run_claude_once(conversation_key, &req, tier).await {
            Ok(outcome) => {
                breaker.lock().await.record_success(tier);
                Ok(outcome)
            }
            Err(RelayError::ModelQuota { .. }) if tier == ModelTier::Heavy => {
                breaker.lock().await.record_rate_limit(tier);
                warn!(conversation_key, "heavy model over quota, falling back to light");
                let mut fallback = self.run_claude_once(conversation_key, &req, ModelTier::Light).await?;
                fallback.quota_fallback = true;
                fallback.text = format!("Note: the usual model was over quota, so I used a lighter model instead.\n\n{}", fallback.text);
                breaker.lock().await.record_success(ModelTier::Light);
                Ok(fallback)
            }
            Err(e) => {
                breaker.lock().await.record_failure(tier);
                Err(e)
            }
        }
    }

    async fn run_claude_once(&self, conversation_key: &str, req: &InvokeRequest, tier: ModelTier) -> RelayResult<InvokeOutcome> {
        let mut args: Vec<String> = vec!["-p".to_string(), "--output-format".to_string(), "stream-json".to_string(), "--verbose".to_string()];
        args.push("--model".to_string());
        args.push(tier.as_str().to_string());
        if let Some(policy) = &req.approval_policy {
            args.push("--permission-mode".to_string());
            args.push(policy.clone());
        }
        if let Some(id) = &req.thread_id {
            args.push("--resume".to_string());
            args.push(id.clone());
        }
        args.push("--".to_string());
        args.push(req.prompt.clone());

        let (lines, stderr_tail) = self.spawn_and_stream(conversation_key, &args, req.timeout_ms).await?;

        let mut session_id = req.thread_id.clone();
        let mut final_text: Option<String> = None;
        for line in &lines {
            if let Ok(event) = serde_json::from_str::<ClaudeEvent>(line) {
                match event.kind.as_str() {
                    "system" => session_id = event.session_id.or(session_id),
                    "assistant" => {
                        if let Some(blocks) = event.content {
                            let joined: String = blocks
                                .into_iter()
                                .filter(|b| b.block_type.as_deref() == Some("text"))
                                .filter_map(|b| b.text)
                                .collect::<Vec<_>>()
                                .join("\n");
                            if !joined.is_empty() {
                                final_text = Some(joined);
                            }
                        }
                    }
                    "result" => {
                        if let Some(r) = event.result {
                            final_text = Some(r);
                        }
                    }
                    _ => {}
                }
            }
        }

        match final_text {
            Some(text) => Ok(InvokeOutcome {
                thread_id: session_id,
                text,
                model: Some(tier.as_str().to_string()),
                stale_session_recovered: false,
                quota_fallback: false,
            }),
            None if contains_any(&stderr_tail, &self.quota_fragments) => {
                Err(RelayError::model_quota(tier.as_str(), stderr_tail))
            }
            None => Err(RelayError::transient_with_stderr("agent produced no final message", stderr_tail)),
        }
    }

    async fn spawn_and_stream(&self, conversation_key: &str, args: &[String], timeout_ms: u64) -> RelayResult<(Vec<String>, String)> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::transient(format!("failed to spawn agent binary: {e}")))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let cancel_rx = self.registry.register(conversation_key).await;
        tokio::pin!(cancel_rx);

        let mut out_lines = Vec::new();
        let mut err_lines = Vec::new();

        let run = async {
            loop {
                tokio::select! {
                    line = stdout_lines.next_line() => {
                        match line {
                            Ok(Some(l)) => out_lines.push(l),
                            Ok(None) => break,
                            Err(_) => break,
                        }
                    }
                    line = stderr_lines.next_line() => {
                        if let Ok(Some(l)) = line {
                            err_lines.push(l);
                        }
                    }
                }
            }
        };

        let outcome = tokio::select! {
            _ = run => RunOutcome::Finished,
            _ = &mut cancel_rx => RunOutcome::Cancelled,
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => RunOutcome::TimedOut,
        };

        self.registry.unregister(conversation_key).await;

        match outcome {
            RunOutcome::Finished => {
                let _ = child.wait().await;
            }
            RunOutcome::Cancelled => {
                terminate_gracefully(&mut child).await;
                info!(conversation_key, "agent child cancelled");
            }
            RunOutcome::TimedOut => {
                terminate_gracefully(&mut child).await;
                return Err(RelayError::Timeout { timeout_ms });
            }
        }

        let stderr_tail: String = err_lines.iter().rev().take(40).cloned().collect::<Vec<_>>().join("\n");
        Ok((out_lines, stderr_tail))
    }
}

enum RunOutcome {
    Finished,
    Cancelled,
    TimedOut,
}

async fn terminate_gracefully(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = tokio::process::Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .output()
            .await;
    }
    let grace = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(grace);
    tokio::select! {
        _ = child.wait() => {}
        _ = &mut grace => {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

fn resume_label(thread_id: &Option<String>) -> String {
    thread_id.clone().unwrap_or_else(|| "<unknown>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_session_fragment_detection() {
        let fragments = default_stale_session_fragments();
        assert!(contains_any("Error: No conversation found with session ID xyz", &fragments));
        assert!(!contains_any("totally unrelated error", &fragments));
    }

    #[test]
    fn quota_fragment_detection() {
        let fragments = default_quota_fragments();
        assert!(contains_any("429 Too Many Requests: rate limit exceeded", &fragments));
    }

    #[tokio::test]
    async fn cancel_registry_round_trip() {
        let registry = ActiveChildRegistry::new();
        let rx = registry.register("conv-1").await;
        assert!(registry.cancel("conv-1").await);
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn cancel_on_unknown_key_is_noop() {
        let registry = ActiveChildRegistry::new();
        assert!(!registry.cancel("missing").await);
    }
}
