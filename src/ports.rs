//! Ports consumed by the engine
//!
//! The shell (CLI, plugin host, tests) supplies these. Parsing of
//! reader-specific formats, template rendering, and user interaction all
//! live behind them; the engine itself stays free of device and UI
//! concerns.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::error::AppError;
use crate::model::{
    Annotation, BookMetadata, Candidate, CommentStyle, DuplicateChoice, DuplicateRequest,
    SourceStat,
};

/// One parsed book from the reader, ready for planning.
#[derive(Debug, Clone)]
pub struct SourceBook {
    pub source_path: PathBuf,
    pub metadata: BookMetadata,
    pub annotations: Vec<Annotation>,
    /// `(mtime, size)` of the source file; `None` when the source vanished
    /// between discovery and import.
    pub stat: Option<SourceStat>,
}

/// Supplies already-parsed books from a resolved source directory.
///
/// Device libraries are bounded, so the port hands back the full set; the
/// coordinator still fans out book-by-book with bounded concurrency.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn iter_books(&self, cancel: &CancelToken) -> Result<Vec<SourceBook>, AppError>;
}

/// Pure body renderer. Called inside closures by the executor and merge
/// engine; must be deterministic for identical inputs.
pub trait BodyRenderer: Send + Sync {
    fn render(
        &self,
        metadata: &BookMetadata,
        annotations: &[Annotation],
        comment_style: CommentStyle,
        max_highlight_gap: u32,
    ) -> String;
}

/// Interactive decisions the engine cannot make on its own.
#[async_trait]
pub trait UserPrompt: Send + Sync {
    /// Returns [`AppError::Cancelled`] when the user dismisses the prompt.
    async fn choose_duplicate(
        &self,
        request: &DuplicateRequest,
    ) -> Result<DuplicateChoice, AppError>;

    /// "The matched note lives outside the managed folder — use it anyway?"
    async fn confirm_stale_location(&self, candidate: &Candidate) -> Result<bool, AppError>;
}

/// Wall-clock source, injectable for tests.
pub trait Clock: Send + Sync {
    fn now_rfc3339(&self) -> String;
}

/// Uid generator, injectable for tests.
pub trait RandomId: Send + Sync {
    /// 16-character random string; collision probability is dominated by
    /// generator entropy.
    fn new_uid(&self) -> String;
}

/// Default clock: UTC now.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_rfc3339(&self) -> String {
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }
}

/// Default uid source: 16 random alphanumerics, lowercased.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomUid;

impl RandomId for RandomUid {
    fn new_uid(&self) -> String {
        use rand::distr::Alphanumeric;
        use rand::RngExt;
        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect::<String>()
            .to_lowercase()
    }
}
