//! Error taxonomy for the relay kernel.
//!
//! Every fallible public function in this crate returns `Result<T, RelayError>`.
//! `anyhow` is reserved for the binary's `main`, which is the only place a
//! misconfiguration should be fatal to the whole process.

use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

/// One variant per error kind in the relay's error taxonomy.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Agent CLI exited non-zero, a network fetch failed, or a progress edit failed.
    #[error("agent run failed: {message}")]
    TransientChild { message: String, stderr_tail: String },

    /// The agent's saved session id could not be resumed.
    #[error("stale {agent} session {session_id}: {message}")]
    StaleSession { agent: String, session_id: String, message: String },

    /// The model is out of quota or rate limited.
    #[error("model quota exceeded for {model}: {message}")]
    ModelQuota { model: String, message: String },

    /// A child process exceeded its wall-clock budget.
    #[error("agent timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Malformed action block, research decision, unknown fields, or a budget violation.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// Research lease or in-flight step exceeded its TTL.
    #[error("stale research state for {project_root}: {message}")]
    StaleResearchState { project_root: String, message: String },

    /// I/O error reading or writing state/plan/job files.
    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    /// (De)serialization error for persisted JSON documents.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Missing required configuration; the process should not start.
    #[error("fatal configuration error: {message}")]
    Fatal { message: String },
}

impl RelayError {
    pub fn transient(message: impl Into<String>) -> Self {
        RelayError::TransientChild {
            message: message.into(),
            stderr_tail: String::new(),
        }
    }

    pub fn transient_with_stderr(message: impl Into<String>, stderr_tail: impl Into<String>) -> Self {
        RelayError::TransientChild {
            message: message.into(),
            stderr_tail: stderr_tail.into(),
        }
    }

    pub fn stale_session(agent: impl Into<String>, session_id: impl Into<String>, message: impl Into<String>) -> Self {
        RelayError::StaleSession {
            agent: agent.into(),
            session_id: session_id.into(),
            message: message.into(),
        }
    }

    pub fn model_quota(model: impl Into<String>, message: impl Into<String>) -> Self {
        RelayError::ModelQuota {
            model: model.into(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        RelayError::Validation {
            message: message.into(),
        }
    }

    pub fn stale_research(project_root: impl Into<String>, message: impl Into<String>) -> Self {
        RelayError::StaleResearchState {
            project_root: project_root.into(),
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        RelayError::Fatal {
            message: message.into(),
        }
    }

    /// Whether the caller should consider retrying the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::TransientChild { .. } => true,
            RelayError::StaleSession { .. } => true,
            RelayError::ModelQuota { .. } => true,
            RelayError::Timeout { .. } => false,
            RelayError::Validation { .. } => false,
            RelayError::StaleResearchState { .. } => false,
            RelayError::Filesystem(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut
            ),
            RelayError::Serialization(_) => false,
            RelayError::Fatal { .. } => false,
        }
    }

    /// Chat-facing rendering of the error. Callers truncate to 1800 chars per the
    /// propagation rule before editing the pending message.
    pub fn user_message(&self) -> String {
        match self {
            RelayError::TransientChild { message, stderr_tail } if !stderr_tail.is_empty() => {
                format!("Agent run failed: {message}\n```\n{stderr_tail}\n```")
            }
            RelayError::TransientChild { message, .. } => format!("Agent run failed: {message}"),
            RelayError::StaleSession { agent, session_id, .. } => {
                format!("Note: previous {agent} session `{session_id}` could not be resumed, so I started a new session.")
            }
            RelayError::ModelQuota { model, .. } => {
                format!("Model `{model}` is over quota; falling back.")
            }
            RelayError::Timeout { timeout_ms } => {
                format!("Agent timed out after {timeout_ms}ms.")
            }
            RelayError::Validation { message } => format!("Rejected: {message}"),
            RelayError::StaleResearchState { message, .. } => format!("Research state was stale and has been repaired: {message}"),
            RelayError::Filesystem(e) => format!("Filesystem error: {e}"),
            RelayError::Serialization(e) => format!("Could not parse stored state: {e}"),
            RelayError::Fatal { message } => format!("Fatal configuration error: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_child_is_retryable() {
        let e = RelayError::transient("boom");
        assert!(e.is_retryable());
    }

    #[test]
    fn timeout_is_not_retryable() {
        let e = RelayError::Timeout { timeout_ms: 1000 };
        assert!(!e.is_retryable());
    }

    #[test]
    fn validation_not_retryable() {
        let e = RelayError::validation("bad field");
        assert!(!e.is_retryable());
        assert!(e.user_message().contains("Rejected"));
    }

    #[test]
    fn stale_session_message_mentions_new_session() {
        let e = RelayError::stale_session("Codex", "abc", "No conversation found with session ID");
        let msg = e.user_message();
        assert!(msg.contains("started a new session"));
        assert!(msg.contains("Codex"));
        assert!(msg.contains("`abc`"));
    }
}
