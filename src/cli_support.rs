//! Shell-side port implementations for the bundled CLI
//!
//! The engine proper never parses device formats or talks to a terminal;
//! these adapters are the thin shell that does. `JsonMetadataSource` reads
//! a pre-parsed dump of books (device parsing itself stays an external
//! collaborator), and `HeadlessPrompt` resolves every interactive decision
//! non-interactively so unattended runs never block.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::cancel::CancelToken;
use crate::error::{AppError, FsError, ParseKind};
use crate::model::{Annotation, BookMetadata, Candidate, DuplicateChoice, DuplicateRequest};
use crate::ports::{MetadataSource, SourceBook, UserPrompt};

/// One entry in the books dump.
#[derive(Debug, Deserialize)]
struct DumpBook {
    source_path: PathBuf,
    metadata: BookMetadata,
    #[serde(default)]
    annotations: Vec<Annotation>,
}

/// Reads already-parsed books from a `books.json` dump in the source
/// directory.
pub struct JsonMetadataSource {
    dump_path: PathBuf,
}

impl JsonMetadataSource {
    /// `source_dir` is the resolved device/source directory containing
    /// `books.json`.
    pub fn new(source_dir: &Path) -> Self {
        Self {
            dump_path: source_dir.join("books.json"),
        }
    }

    pub fn from_file(dump_path: PathBuf) -> Self {
        Self { dump_path }
    }
}

#[async_trait]
impl MetadataSource for JsonMetadataSource {
    async fn iter_books(&self, cancel: &CancelToken) -> Result<Vec<SourceBook>, AppError> {
        cancel.check()?;
        let text = tokio::fs::read_to_string(&self.dump_path)
            .await
            .map_err(|e| AppError::from(FsError::from_io(&self.dump_path, &e, false)))?;
        let dump: Vec<DumpBook> =
            serde_json::from_str(&text).map_err(|e| AppError::ParseFailed {
                kind: ParseKind::Lua,
                message: format!("books dump is not valid JSON: {e}"),
                context: Some(self.dump_path.display().to_string()),
            })?;

        // Fall back to the dump file's own stat when a source path does not
        // exist on this machine (detached imports from a copied dump).
        let dump_stat = tokio::fs::metadata(&self.dump_path).await.ok();

        let mut books = Vec::with_capacity(dump.len());
        for entry in dump {
            cancel.check()?;
            let stat = match tokio::fs::metadata(&entry.source_path).await {
                Ok(meta) => Some(meta),
                Err(_) => dump_stat
                    .as_ref()
                    .map(|m| m.clone()),
            }
            .map(|meta| crate::model::SourceStat {
                mtime: meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0),
                size: meta.len(),
            });
            books.push(SourceBook {
                source_path: entry.source_path,
                metadata: entry.metadata,
                annotations: entry.annotations,
                stat,
            });
        }
        tracing::info!(path = %self.dump_path.display(), count = books.len(), "books loaded");
        Ok(books)
    }
}

/// Non-interactive prompt policy: duplicates are skipped, stale locations
/// are not reused. Unattended runs never block on a question.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessPrompt;

#[async_trait]
impl UserPrompt for HeadlessPrompt {
    async fn choose_duplicate(
        &self,
        request: &DuplicateRequest,
    ) -> Result<DuplicateChoice, AppError> {
        tracing::warn!(
            title = %request.title,
            "duplicate needs a decision; running unattended, skipping"
        );
        Ok(DuplicateChoice::Skip)
    }

    async fn confirm_stale_location(&self, candidate: &Candidate) -> Result<bool, AppError> {
        tracing::warn!(
            path = %candidate.path.display(),
            "matched note is outside the managed folder; creating fresh instead"
        );
        Ok(false)
    }
}
