//! Per-key task serialization
//!
//! Mutations that touch the same logical resource (a note path, a uid's
//! snapshot, an atomic write destination) must not interleave. [`KeyedQueue`]
//! serializes tasks sharing a key FIFO; distinct keys run in parallel with
//! unbounded fan-out.
//!
//! Keys are opaque strings chosen by the caller: the note path for note
//! mutations, `"uid:<uid>"` for uid/snapshot operations, `"atomic:<dst>"`
//! for standalone atomic writes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct KeyedQueue {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once no earlier task for `key` is in flight, and resolve
    /// with its result. Tokio's mutex queues waiters fairly, which gives the
    /// FIFO-per-key ordering callers rely on.
    ///
    /// Cancellation is cooperative: a queued task is still entered and is
    /// expected to check its token first thing, returning `Cancelled`
    /// without performing work.
    pub async fn run<T, F, Fut>(&self, key: &str, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = {
            let mut locks = self.locks.lock().expect("keyed queue mutex poisoned");
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        let result = {
            let _guard = lock.lock().await;
            task().await
        };

        // Drop the map entry once nobody else holds the lock, so keys used
        // once (every imported path) don't accumulate forever.
        {
            let mut locks = self.locks.lock().expect("keyed queue mutex poisoned");
            if let Some(entry) = locks.get(key) {
                // Two strong refs: the map's and our local `lock`.
                if Arc::strong_count(entry) <= 2 {
                    locks.remove(key);
                }
            }
        }

        result
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.locks.lock().expect("keyed queue mutex poisoned").len()
    }
}
