//! Durable JSON-file persistence for the `sessions` map, keyed by
//! conversation key. Writes are atomic (tmp file + rename) and coalesced
//! through a single background writer task, adapted from the save/load
//! functions this relay's ancestor used for its own session checkpoints —
//! here generalized from a single-session file to a whole-map store and
//! given the atomicity and coalescing the ancestor's plain `fs::write` lacked.

use crate::error::{RelayError, RelayResult};
use crate::types::{ConversationKey, Session};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{error, info, warn};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct PersistedState {
    version: u32,
    #[serde(default)]
    sessions: HashMap<String, Session>,
}

impl Default for PersistedState {
    fn default() -> Self {
        PersistedState { version: 1, sessions: HashMap::new() }
    }
}

enum WriterMsg {
    Dirty,
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Durable, coalescing-writer-backed store of all conversation sessions.
pub struct StateStore {
    path: PathBuf,
    inner: Arc<Mutex<PersistedState>>,
    tx: mpsc::UnboundedSender<WriterMsg>,
    writer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StateStore {
    /// Load (or create) the store at `path` and spawn its writer task.
    pub async fn open(path: impl Into<PathBuf>) -> RelayResult<Self> {
        let path = path.into();
        let mut loaded = if path.exists() {
            let bytes = tokio::fs::read(&path).await?;
            serde_json::from_slice::<PersistedState>(&bytes).unwrap_or_else(|e| {
                warn!(error = %e, "sessions.json failed to parse; starting from an empty store");
                PersistedState::default()
            })
        } else {
            PersistedState::default()
        };

        let mut any_reset = false;
        for session in loaded.sessions.values_mut() {
            if session.apply_restart_reset() {
                any_reset = true;
            }
        }
        if any_reset {
            info!("restart reset applied to one or more sessions");
        }

        let inner = Arc::new(Mutex::new(loaded));
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = spawn_writer(path.clone(), inner.clone(), rx);

        let store = StateStore {
            path,
            inner,
            tx,
            writer: Mutex::new(Some(writer)),
        };
        if any_reset {
            store.queue_save();
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fetch a clone of a session, if it exists.
    pub async fn get(&self, key: &ConversationKey) -> Option<Session> {
        self.inner.lock().await.sessions.get(&key.to_string()).cloned()
    }

    /// Fetch a session, creating it (with the given default workdir) if absent.
    pub async fn get_or_create(&self, key: &ConversationKey, default_workdir: &str) -> Session {
        let mut guard = self.inner.lock().await;
        guard
            .sessions
            .entry(key.to_string())
            .or_insert_with(|| Session::new(default_workdir))
            .clone()
    }

    /// Replace a session wholesale and queue a save. Non-blocking.
    pub async fn put(&self, key: &ConversationKey, session: Session) {
        {
            let mut guard = self.inner.lock().await;
            guard.sessions.insert(key.to_string(), session);
        }
        self.queue_save();
    }

    /// Mutate a session in place via `f`, then queue a save.
    pub async fn mutate<F, T>(&self, key: &ConversationKey, default_workdir: &str, f: F) -> T
    where
        F: FnOnce(&mut Session) -> T,
    {
        let result = {
            let mut guard = self.inner.lock().await;
            let session = guard
                .sessions
                .entry(key.to_string())
                .or_insert_with(|| Session::new(default_workdir));
            f(session)
        };
        self.queue_save();
        result
    }

    pub async fn all_keys(&self) -> Vec<ConversationKey> {
        // Sessions are stored by their rendered string key; conversation keys are
        // reconstructed by callers that already track the typed key elsewhere
        // (the dispatcher, the job watcher registry, the research tick). Exposed
        // here only for diagnostics/testing.
        self.inner.lock().await.sessions.keys().cloned().collect::<Vec<_>>()
            .into_iter()
            .filter_map(|s| parse_conversation_key(&s))
            .collect()
    }

    /// Non-blocking request to persist. Coalesces with any pending request.
    pub fn queue_save(&self) {
        let _ = self.tx.send(WriterMsg::Dirty);
    }

    /// Block until all writes queued before this call have hit disk.
    pub async fn flush(&self) -> RelayResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WriterMsg::Flush(ack_tx))
            .map_err(|_| RelayError::fatal("state writer task has shut down"))?;
        ack_rx.await.map_err(|_| RelayError::fatal("state writer dropped without acknowledging"))?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        let _ = self.flush().await;
        let _ = self.tx.send(WriterMsg::Shutdown);
        if let Some(handle) = self.writer.lock().await.take() {
            let _ = handle.await;
        }
    }
}

fn spawn_writer(
    path: PathBuf,
    inner: Arc<Mutex<PersistedState>>,
    mut rx: mpsc::UnboundedReceiver<WriterMsg>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut dirty = false;
        let mut pending_acks: Vec<oneshot::Sender<()>> = Vec::new();
        loop {
            let msg = match rx.recv().await {
                Some(m) => m,
                None => break,
            };
            match msg {
                WriterMsg::Dirty => dirty = true,
                WriterMsg::Flush(ack) => {
                    dirty = true;
                    pending_acks.push(ack);
                }
                WriterMsg::Shutdown => {
                    if dirty {
                        write_snapshot(&path, &inner).await;
                    }
                    for ack in pending_acks.drain(..) {
                        let _ = ack.send(());
                    }
                    break;
                }
            }
            // Drain any further messages already queued so a burst of
            // mutations coalesces into a single write.
            while let Ok(more) = rx.try_recv() {
                match more {
                    WriterMsg::Dirty => dirty = true,
                    WriterMsg::Flush(ack) => {
                        dirty = true;
                        pending_acks.push(ack);
                    }
                    WriterMsg::Shutdown => {
                        if dirty {
                            write_snapshot(&path, &inner).await;
                        }
                        for ack in pending_acks.drain(..) {
                            let _ = ack.send(());
                        }
                        return;
                    }
                }
            }
            if dirty {
                write_snapshot(&path, &inner).await;
                dirty = false;
            }
            for ack in pending_acks.drain(..) {
                let _ = ack.send(());
            }
        }
    })
}

async fn write_snapshot(path: &Path, inner: &Arc<Mutex<PersistedState>>) {
    let snapshot = inner.lock().await.clone();
    let bytes = match serde_json::to_vec_pretty(&snapshot) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to serialize state snapshot");
            return;
        }
    };
    let tmp_path = path.with_extension("json.tmp");
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            error!(error = %e, "failed to create state directory");
            return;
        }
    }
    if let Err(e) = tokio::fs::write(&tmp_path, &bytes).await {
        error!(error = %e, "failed to write state tmp file");
        return;
    }
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        error!(error = %e, "failed to rename state tmp file into place");
    }
}

impl std::fmt::Clone for PersistedState {
    fn clone(&self) -> Self {
        PersistedState {
            version: self.version,
            sessions: self.sessions.clone(),
        }
    }
}

fn parse_conversation_key(s: &str) -> Option<ConversationKey> {
    let mut parts = s.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("dm"), Some(user_id), None) => Some(ConversationKey::Dm { user_id: user_id.to_string() }),
        (Some("channel"), Some(guild_id), Some(channel_id)) => Some(ConversationKey::Channel {
            guild_id: guild_id.to_string(),
            channel_id: channel_id.to_string(),
        }),
        (Some("thread"), Some(guild_id), Some(thread_id)) => Some(ConversationKey::Thread {
            guild_id: guild_id.to_string(),
            thread_id: thread_id.to_string(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Task, TaskStatus};

    #[tokio::test]
    async fn round_trip_persists_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = StateStore::open(&path).await.unwrap();
        let key = ConversationKey::dm("u1");

        store
            .mutate(&key, "/work", |s| {
                s.tasks.push(Task::new("t-0001", "echo hi"));
            })
            .await;
        store.flush().await.unwrap();

        let reopened = StateStore::open(&path).await.unwrap();
        let session = reopened.get(&key).await.unwrap();
        assert_eq!(session.tasks.len(), 1);
        assert_eq!(session.tasks[0].text, "echo hi");
    }

    #[tokio::test]
    async fn restart_reset_demotes_running_task_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        {
            let store = StateStore::open(&path).await.unwrap();
            let key = ConversationKey::dm("u1");
            store
                .mutate(&key, "/work", |s| {
                    let mut t = Task::new("t-0001", "sleep 1");
                    t.status = TaskStatus::Running;
                    s.tasks.push(t);
                    s.task_loop.running = true;
                })
                .await;
            store.flush().await.unwrap();
        }

        let reopened = StateStore::open(&path).await.unwrap();
        let session = reopened.get(&ConversationKey::dm("u1")).await.unwrap();
        assert_eq!(session.tasks[0].status, TaskStatus::Pending);
        assert!(!session.task_loop.running);
    }

    #[tokio::test]
    async fn coalesces_bursts_of_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = StateStore::open(&path).await.unwrap();
        let key = ConversationKey::dm("u1");
        for i in 0..20 {
            store
                .mutate(&key, "/work", |s| {
                    s.tasks.push(Task::new(format!("t-{i:04}"), "noop"));
                })
                .await;
        }
        store.flush().await.unwrap();
        let session = store.get(&key).await.unwrap();
        assert_eq!(session.tasks.len(), 20);
    }
}
