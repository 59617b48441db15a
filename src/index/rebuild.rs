//! Background index rebuild
//!
//! When the persistent database cannot be opened the store falls back to an
//! in-memory index, and this scan repopulates it from the managed notes
//! folder: every note's front-matter yields a book row and an instance row,
//! streamed in as batched upserts. The scan is cancelable, idempotent on
//! restart (upserts), and never blocks writers.

use std::path::Path;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::codec;
use crate::error::AppError;
use crate::fs::AtomicFs;
use crate::model::{normalize_text, BookRow};

use super::IndexStore;

/// Upserts per transaction; bounds transaction cost on large vaults.
const BATCH_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildPhase {
    Idle,
    Rebuilding,
    Complete,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct RebuildProgress {
    pub current: usize,
    pub total: Option<usize>,
}

pub type ProgressObserver = Arc<dyn Fn(RebuildProgress) + Send + Sync>;

/// Derive the book row for a note from its front-matter. Notes without a
/// title fall back to the file stem; authors default to empty (which the
/// book key treats the same as URL-shaped authors).
fn book_row_for_note(path: &Path, text: &str) -> BookRow {
    let parsed = codec::parse(text);
    let title = parsed
        .front_matter
        .scalar("title")
        .map(str::to_string)
        .unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
    let authors = parsed
        .front_matter
        .scalar("authors")
        .unwrap_or_default()
        .to_string();
    let key = format!("{}::{}", normalize_text(&authors), normalize_text(&title));
    BookRow {
        key,
        title,
        authors,
    }
}

/// Scan `managed_root` and stream book/instance rows into the index.
pub async fn rebuild_from_notes(
    index: &IndexStore,
    fs: &AtomicFs,
    managed_root: &Path,
    cancel: &CancelToken,
    observer: Option<ProgressObserver>,
) -> Result<(), AppError> {
    index.set_rebuild_phase(RebuildPhase::Rebuilding);
    let result = scan(index, fs, managed_root, cancel, observer).await;
    match &result {
        Ok(()) => index.set_rebuild_phase(RebuildPhase::Complete),
        Err(e) if e.is_cancelled() => index.set_rebuild_phase(RebuildPhase::Cancelled),
        Err(_) => index.set_rebuild_phase(RebuildPhase::Failed),
    }
    result
}

async fn scan(
    index: &IndexStore,
    fs: &AtomicFs,
    managed_root: &Path,
    cancel: &CancelToken,
    observer: Option<ProgressObserver>,
) -> Result<(), AppError> {
    let paths = fs.walk(managed_root, &["md"], true, cancel).await?;
    let total = paths.len();
    tracing::info!(root = %managed_root.display(), total, "index rebuild started");

    let mut batch: Vec<(BookRow, String)> = Vec::with_capacity(BATCH_SIZE);
    for (i, path) in paths.iter().enumerate() {
        cancel.check()?;
        let text = match fs.read_text(path).await {
            Ok(t) => t,
            Err(e) => {
                // One unreadable note must not sink the rebuild.
                tracing::debug!(path = %path.display(), error = %e, "skipping unreadable note");
                continue;
            }
        };
        let row = book_row_for_note(path, &text);
        batch.push((row, path.to_string_lossy().into_owned()));

        if batch.len() >= BATCH_SIZE {
            index.upsert_instances(&batch).await?;
            batch.clear();
        }
        if let Some(observer) = &observer {
            observer(RebuildProgress {
                current: i + 1,
                total: Some(total),
            });
        }
    }
    if !batch.is_empty() {
        index.upsert_instances(&batch).await?;
    }

    tracing::info!(total, "index rebuild complete");
    Ok(())
}
