//! Task Runner: a per-conversation state machine that dequeues pending
//! tasks and executes them sequentially through the agent, parsing
//! completion markers and optionally auto-committing via git.

use crate::error::RelayResult;
use crate::git_manager::GitManager;
use crate::state::StateStore;
use crate::types::{ConversationKey, TaskStatus};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Failed,
    Blocked,
    Canceled,
}

/// Parse the agent's final text for completion markers. `[[task:blocked]]`
/// takes priority; absent any marker, a task is considered done.
pub fn parse_task_marker(text: &str) -> TaskOutcome {
    let lower = text.to_lowercase();
    if lower.contains("[[task:blocked]]") {
        TaskOutcome::Blocked
    } else if lower.contains("[[task:failed]]") {
        TaskOutcome::Failed
    } else {
        TaskOutcome::Done
    }
}

pub fn build_task_prompt(task_id: &str, text: &str) -> String {
    format!(
        "[TASK {task_id}]\n{text}\n\nWhen finished, end your reply with exactly one of:\n\
         `[[task:done]]` if the task is complete,\n\
         `[[task:blocked]]` if you cannot proceed without more information."
    )
}

/// A minimal seam the Task Runner invokes per task; the caller supplies the
/// actual agent-invocation pipeline (with Progress Reporter, action
/// extraction, etc.) so this module stays agent-provider agnostic.
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn run_task(&self, key: &ConversationKey, workdir: &str, prompt: String) -> RelayResult<String>;
}

pub struct TaskRunnerConfig {
    pub git_auto_commit: bool,
    pub commit_prefix: String,
    pub post_summary: bool,
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        TaskRunnerConfig {
            git_auto_commit: true,
            commit_prefix: "relay:".to_string(),
            post_summary: true,
        }
    }
}

pub struct TaskRunner {
    cfg: TaskRunnerConfig,
}

impl TaskRunner {
    pub fn new(cfg: TaskRunnerConfig) -> Self {
        TaskRunner { cfg }
    }

    /// Returns true if the loop was (re)started, false if it was already running.
    pub async fn start(&self, state: &Arc<StateStore>, key: &ConversationKey, default_workdir: &str) -> bool {
        let already_running = state
            .mutate(key, default_workdir, |s| {
                if s.task_loop.running {
                    true
                } else {
                    s.task_loop.running = true;
                    s.task_loop.stop_requested = false;
                    false
                }
            })
            .await;
        !already_running
    }

    pub async fn request_stop(&self, state: &Arc<StateStore>, key: &ConversationKey, default_workdir: &str) {
        state.mutate(key, default_workdir, |s| s.task_loop.stop_requested = true).await;
    }

    /// Drive the loop to completion. Intended to run inside the Conversation
    /// Queue for `key` so at most one loop runs per conversation.
    pub async fn drive(&self, state: &Arc<StateStore>, executor: &dyn TaskExecutor, key: &ConversationKey, default_workdir: &str) -> RelayResult<()> {
        loop {
            let stop_requested = state.get(key).await.map(|s| s.task_loop.stop_requested).unwrap_or(false);
            if stop_requested {
                break;
            }

            let next = state
                .mutate(key, default_workdir, |s| {
                    if let Some(task) = s.next_pending_task_mut() {
                        task.status = TaskStatus::Running;
                        task.started_at = Some(chrono::Utc::now());
                        task.attempts += 1;
                        let picked = (task.id.clone(), task.text.clone());
                        s.task_loop.current_task_id = Some(picked.0.clone());
                        Some(picked)
                    } else {
                        None
                    }
                })
                .await;

            let Some((task_id, text)) = next else { break };

            let workdir = state.get(key).await.map(|s| s.workdir).unwrap_or_else(|| default_workdir.to_string());
            let prompt = build_task_prompt(&task_id, &text);
            let run_result = executor.run_task(key, &workdir, prompt).await;

            let (outcome, preview, error) = match &run_result {
                Ok(output) => (parse_task_marker(output), Some(truncate(output, 300)), None),
                Err(e) => (TaskOutcome::Failed, None, Some(e.user_message())),
            };

            let canceled = state.get(key).await.map(|s| s.task_loop.stop_requested).unwrap_or(false) && matches!(outcome, TaskOutcome::Done);
            let final_outcome = if canceled { TaskOutcome::Canceled } else { outcome };

            state
                .mutate(key, default_workdir, |s| {
                    if let Some(task) = s.tasks.iter_mut().find(|t| t.id == task_id) {
                        task.status = match final_outcome {
                            TaskOutcome::Done => TaskStatus::Done,
                            TaskOutcome::Failed => TaskStatus::Failed,
                            TaskOutcome::Blocked => TaskStatus::Blocked,
                            TaskOutcome::Canceled => TaskStatus::Canceled,
                        };
                        task.finished_at = Some(chrono::Utc::now());
                        task.last_result_preview = preview.clone();
                        task.last_error = error.clone();
                    }
                    s.task_loop.current_task_id = None;
                })
                .await;

            if matches!(final_outcome, TaskOutcome::Done) && self.cfg.git_auto_commit {
                if GitManager::is_repo(std::path::Path::new(&workdir)) {
                    let gm = GitManager::new(&workdir, self.cfg.commit_prefix.clone());
                    let title = truncate(&text, 60);
                    let _ = gm.create_checkpoint(&task_id, &title);
                }
            }

            info!(conversation_key = %key, task_id, outcome = ?final_outcome, "task finished");

            if matches!(final_outcome, TaskOutcome::Blocked | TaskOutcome::Canceled) {
                break;
            }
        }

        state
            .mutate(key, default_workdir, |s| {
                s.task_loop.running = false;
                s.task_loop.stop_requested = false;
                s.task_loop.current_task_id = None;
            })
            .await;
        Ok(())
    }

    pub fn summary(&self, session: &crate::types::Session) -> String {
        if !self.cfg.post_summary {
            return String::new();
        }
        let mut counts = std::collections::HashMap::new();
        for t in &session.tasks {
            *counts.entry(format!("{:?}", t.status)).or_insert(0) += 1;
        }
        let mut parts: Vec<String> = counts.into_iter().map(|(k, v)| format!("{k}: {v}")).collect();
        parts.sort();
        format!("Task summary — {}", parts.join(", "))
    }
}

fn truncate(s: &str, n: usize) -> String {
    if s.chars().count() <= n {
        s.to_string()
    } else {
        s.chars().take(n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_parsing_prefers_blocked() {
        assert_eq!(parse_task_marker("done! [[task:blocked]]"), TaskOutcome::Blocked);
        assert_eq!(parse_task_marker("all good [[task:done]]"), TaskOutcome::Done);
        assert_eq!(parse_task_marker("no marker at all"), TaskOutcome::Done);
    }

    #[test]
    fn prompt_contains_task_id_and_instructions() {
        let prompt = build_task_prompt("t-0001", "echo hi");
        assert!(prompt.contains("t-0001"));
        assert!(prompt.contains("[[task:done]]"));
    }

    struct EchoExecutor;
    #[async_trait::async_trait]
    impl TaskExecutor for EchoExecutor {
        async fn run_task(&self, _key: &ConversationKey, _workdir: &str, _prompt: String) -> RelayResult<String> {
            Ok("ok [[task:done]]".to_string())
        }
    }

    #[tokio::test]
    async fn drives_one_pending_task_to_done() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateStore::open(dir.path().join("s.json")).await.unwrap());
        let key = ConversationKey::dm("u1");
        state
            .mutate(&key, dir.path().to_str().unwrap(), |s| {
                let id = s.next_task_id();
                s.tasks.push(crate::types::Task::new(id, "echo hi"));
            })
            .await;

        let runner = TaskRunner::new(TaskRunnerConfig { git_auto_commit: false, ..TaskRunnerConfig::default() });
        assert!(runner.start(&state, &key, dir.path().to_str().unwrap()).await);
        runner.drive(&state, &EchoExecutor, &key, dir.path().to_str().unwrap()).await.unwrap();

        let session = state.get(&key).await.unwrap();
        assert_eq!(session.tasks[0].status, TaskStatus::Done);
        assert!(!session.task_loop.running);
    }

    #[tokio::test]
    async fn refuses_double_start() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateStore::open(dir.path().join("s.json")).await.unwrap());
        let key = ConversationKey::dm("u1");
        let runner = TaskRunner::new(TaskRunnerConfig::default());
        assert!(runner.start(&state, &key, dir.path().to_str().unwrap()).await);
        assert!(!runner.start(&state, &key, dir.path().to_str().unwrap()).await);
    }
}
