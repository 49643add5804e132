//! Per-conversation FIFO serialization.
//!
//! JavaScript-style implementations chain a "tail promise" per key; Rust
//! futures aren't directly chainable that way, so this is realized as a
//! per-key async mutex whose liveness is tracked by `Arc` reference count —
//! the entry is pruned once nothing else is waiting on it, reproducing the
//! "removed once it becomes the active tail" property without leaking
//! memory for long-lived conversations.

use crate::types::ConversationKey;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::error;

#[derive(Default)]
pub struct ConversationQueue {
    tails: StdMutex<HashMap<ConversationKey, Arc<AsyncMutex<()>>>>,
}

impl ConversationQueue {
    pub fn new() -> Self {
        ConversationQueue::default()
    }

    fn tail_for(&self, key: &ConversationKey) -> Arc<AsyncMutex<()>> {
        let mut tails = self.tails.lock().unwrap();
        tails.entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    fn prune_if_idle(&self, key: &ConversationKey, tail: &Arc<AsyncMutex<()>>) {
        let mut tails = self.tails.lock().unwrap();
        if let Some(current) = tails.get(key) {
            // strong_count == 2: one held by the map, one held by this local
            // variable. Anything else means another waiter arrived.
            if Arc::ptr_eq(current, tail) && Arc::strong_count(current) <= 2 {
                tails.remove(key);
            }
        }
    }

    /// Run `f` serialized against any other work enqueued for `key`. A
    /// failure inside `f` does not poison the chain: subsequent calls for the
    /// same key still run.
    pub async fn enqueue<F, Fut, T>(&self, key: &ConversationKey, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let tail = self.tail_for(key);
        let _permit = tail.lock().await;
        let result = f().await;
        drop(_permit);
        self.prune_if_idle(key, &tail);
        result
    }

    /// Run `f` immediately, bypassing serialization, for responsiveness-
    /// critical paths (`/status`, `/task stop`). Callers that mutate state
    /// must still queue a save themselves.
    pub async fn bypass<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        f().await
    }

    #[cfg(test)]
    fn tracked_key_count(&self) -> usize {
        self.tails.lock().unwrap().len()
    }
}

/// Catches a panic inside an enqueued future's synchronous portion so one
/// failing task can't take down the whole queue. Used by callers that invoke
/// third-party or agent-invocation code inside `enqueue`.
pub fn log_and_swallow<T, E: std::fmt::Display>(label: &str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            error!(label, error = %e, "enqueued operation failed");
            None
        }
    }
}
