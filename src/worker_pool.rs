//! Bounded-concurrency fan-out
//!
//! Runs independent work items with a concurrency cap and yields per-item
//! results over a channel as they complete, in no particular order. One
//! failed item never stops the rest; cancellation drains in-flight work and
//! reports the remainder as cancelled.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use crate::cancel::CancelToken;
use crate::error::AppError;

/// Per-item failure: the item is handed back alongside the error so the
/// caller can report it without tracking indices.
#[derive(Debug)]
pub struct WorkerError<T> {
    pub item: T,
    pub error: AppError,
}

#[derive(Clone)]
pub struct PoolOptions {
    pub concurrency: usize,
    pub cancel: CancelToken,
}

impl PoolOptions {
    pub fn new(concurrency: usize, cancel: CancelToken) -> Self {
        Self {
            concurrency,
            cancel,
        }
    }
}

fn effective_concurrency(requested: usize) -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    requested.min(cpus).max(1)
}

/// Fan `items` out over `work` with bounded parallelism.
///
/// The returned receiver yields one `Result` per input item and closes when
/// all items are accounted for. Items that never start because cancellation
/// was observed first are yielded as `Err` with [`AppError::Cancelled`].
pub fn run_pool<T, R, F, Fut>(
    items: Vec<T>,
    work: F,
    opts: PoolOptions,
) -> mpsc::Receiver<Result<R, WorkerError<T>>>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, AppError>> + Send,
{
    let concurrency = effective_concurrency(opts.concurrency);
    let (tx, rx) = mpsc::channel(concurrency.max(1));
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let work = Arc::new(work);

    tokio::spawn(async move {
        let mut join_set = tokio::task::JoinSet::new();
        for item in items {
            if opts.cancel.is_cancelled() {
                // Drain: in-flight tasks finish; unstarted items are
                // reported as cancelled markers.
                let _ = tx
                    .send(Err(WorkerError {
                        item,
                        error: AppError::Cancelled,
                    }))
                    .await;
                continue;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break, // semaphore closed; pool is shutting down
            };
            let work = work.clone();
            let tx = tx.clone();
            join_set.spawn(async move {
                let item_for_err = item.clone();
                let result = work(item).await.map_err(|error| WorkerError {
                    item: item_for_err,
                    error,
                });
                drop(permit);
                // A dropped receiver means the consumer stopped caring.
                let _ = tx.send(result).await;
            });
        }
        while join_set.join_next().await.is_some() {}
    });

    rx
}
