//! Throttled editor of a single "pending" chat message.
//!
//! This supersedes the ancestor harness's flat-file `ProgressTracker`
//! (`claude-progress.txt`-style append log): the mechanism changes from file
//! append to chat-message edit, but the idea of bounded recent history plus
//! convenience loggers for lifecycle events carries over directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// The chat adapter's pending-message handle. Implemented by the real chat
/// adapter and by test doubles.
#[async_trait]
pub trait EditablePendingMessage: Send + Sync {
    async fn edit(&self, text: &str) -> Result<(), String>;
}

#[derive(Debug, Clone)]
pub struct ProgressReporterConfig {
    pub keep_lines: usize,
    pub max_lines: usize,
    pub min_edit_ms: u64,
    pub heartbeat_ms: u64,
    pub stall_warn_ms: u64,
    pub edit_timeout_ms: u64,
    pub timeout_ms: u64,
}

impl Default for ProgressReporterConfig {
    fn default() -> Self {
        ProgressReporterConfig {
            keep_lines: 50,
            max_lines: 10,
            min_edit_ms: 900,
            heartbeat_ms: 15_000,
            stall_warn_ms: 45_000,
            edit_timeout_ms: 5_000,
            timeout_ms: 600_000,
        }
    }
}

enum Command {
    Note(String),
    Shutdown,
}

/// A live progress reporter bound to one pending message.
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<Command>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

struct ReporterState {
    lines: VecDeque<String>,
    dirty: bool,
    started_at: DateTime<Utc>,
    last_note_at: DateTime<Utc>,
    last_stall_note_at: Option<DateTime<Utc>>,
}

impl ReporterState {
    fn new() -> Self {
        let now = Utc::now();
        ReporterState {
            lines: VecDeque::new(),
            dirty: false,
            started_at: now,
            last_note_at: now,
            last_stall_note_at: None,
        }
    }

    fn push(&mut self, keep_lines: usize, text: String) {
        self.lines.push_back(text);
        while self.lines.len() > keep_lines {
            self.lines.pop_front();
        }
        self.dirty = true;
        self.last_note_at = Utc::now();
    }

    fn render(&self, cfg: &ProgressReporterConfig) -> String {
        let elapsed = (Utc::now() - self.started_at).num_seconds().max(0);
        let last_event_ago = (Utc::now() - self.last_note_at).num_seconds().max(0);
        let header = format!(
            "Working... elapsed {elapsed}s / timeout {}s, last event {last_event_ago}s ago",
            cfg.timeout_ms / 1000
        );
        let tail: Vec<&String> = self.lines.iter().rev().take(cfg.max_lines).collect();
        let mut body: Vec<&String> = tail.into_iter().collect();
        body.reverse();
        if body.is_empty() {
            header
        } else {
            let joined = body.into_iter().map(|s| s.as_str()).collect::<Vec<_>>().join("\n");
            format!("{header}\n{joined}")
        }
    }
}

impl ProgressReporter {
    pub fn start(message: std::sync::Arc<dyn EditablePendingMessage>, cfg: ProgressReporterConfig) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let handle = tokio::spawn(async move {
            let mut state = ReporterState::new();
            let mut heartbeat = tokio::time::interval(Duration::from_millis(cfg.heartbeat_ms.max(1)));
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_edit_at: Option<DateTime<Utc>> = None;

            loop {
                tokio::select! {
                    cmd = rx.recv() => {
                        match cmd {
                            Some(Command::Note(text)) => {
                                state.push(cfg.keep_lines, text);
                                let due = match last_edit_at {
                                    Some(t) => (Utc::now() - t).num_milliseconds() as u64 >= cfg.min_edit_ms,
                                    None => true,
                                };
                                if due {
                                    Self::do_edit(&message, &state, &cfg).await;
                                    last_edit_at = Some(Utc::now());
                                    state.dirty = false;
                                }
                            }
                            Some(Command::Shutdown) | None => {
                                if state.dirty {
                                    Self::do_edit(&message, &state, &cfg).await;
                                }
                                break;
                            }
                        }
                    }
                    _ = heartbeat.tick() => {
                        let since_last = (Utc::now() - state.last_note_at).num_milliseconds() as u64;
                        if since_last >= cfg.stall_warn_ms {
                            let emit_stall = match state.last_stall_note_at {
                                Some(t) => (Utc::now() - t).num_milliseconds() as u64 >= cfg.stall_warn_ms,
                                None => true,
                            };
                            if emit_stall {
                                state.push(cfg.keep_lines, "(still working, no recent activity)".to_string());
                                state.last_stall_note_at = Some(Utc::now());
                            }
                        }
                        Self::do_edit(&message, &state, &cfg).await;
                        last_edit_at = Some(Utc::now());
                        state.dirty = false;
                    }
                }
            }
        });
        ProgressReporter { tx, handle: Some(handle) }
    }

    async fn do_edit(message: &std::sync::Arc<dyn EditablePendingMessage>, state: &ReporterState, cfg: &ProgressReporterConfig) {
        let text = state.render(cfg);
        let fut = message.edit(&text);
        match tokio::time::timeout(Duration::from_millis(cfg.edit_timeout_ms), fut).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "progress edit failed"),
            Err(_) => warn!("progress edit timed out"),
        }
    }

    /// Non-blocking: queue a note for the next edit window.
    pub fn note(&self, text: impl Into<String>) {
        let _ = self.tx.send(Command::Note(text.into()));
    }

    /// Drain pending edits and stop the reporter.
    pub async fn stop(mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingMessage {
        edits: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EditablePendingMessage for RecordingMessage {
        async fn edit(&self, text: &str) -> Result<(), String> {
            self.edits.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn note_then_stop_produces_at_least_one_edit() {
        let edits = Arc::new(Mutex::new(Vec::new()));
        let handle = Arc::new(RecordingMessage { edits: edits.clone() });
        let cfg = ProgressReporterConfig {
            min_edit_ms: 0,
            heartbeat_ms: 60_000,
            ..Default::default()
        };
        let reporter = ProgressReporter::start(handle, cfg);
        reporter.note("step 1");
        tokio::time::sleep(Duration::from_millis(20)).await;
        reporter.stop().await;
        let recorded = edits.lock().unwrap();
        assert!(recorded.iter().any(|t| t.contains("step 1")));
    }

    #[test]
    fn render_with_max_lines_one_shows_only_latest() {
        let mut state = ReporterState::new();
        let cfg = ProgressReporterConfig { max_lines: 1, ..Default::default() };
        state.push(cfg.keep_lines, "first".to_string());
        state.push(cfg.keep_lines, "second".to_string());
        let rendered = state.render(&cfg);
        assert!(rendered.contains("second"));
        assert!(!rendered.contains("first"));
    }

    #[test]
    fn keep_lines_bounds_history() {
        let mut state = ReporterState::new();
        for i in 0..10 {
            state.push(3, format!("line {i}"));
        }
        assert_eq!(state.lines.len(), 3);
        assert_eq!(state.lines.front().unwrap(), "line 7");
    }
}
