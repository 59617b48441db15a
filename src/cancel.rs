//! Cooperative cancellation
//!
//! A single token propagates from the shell (Ctrl-C handler, UI cancel
//! button) to every async operation. Loops check it on each iteration and
//! before every write; in-flight atomic write/snapshot pairs complete before
//! the cancellation is honored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::AppError;

/// Cheap clonable cancellation flag. Runtime-agnostic: checking it never
/// suspends.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent; observable by every clone.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Convenience for `?`-style early exit at loop heads and write sites.
    pub fn check(&self) -> Result<(), AppError> {
        if self.is_cancelled() {
            Err(AppError::Cancelled)
        } else {
            Ok(())
        }
    }
}
