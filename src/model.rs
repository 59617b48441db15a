//! Core data model
//!
//! Annotations and book metadata arrive already parsed from the reader (the
//! shell owns the device formats); the engine derives two stable identities
//! from them:
//!
//! - the *annotation id*, a 16-hex-char content hash used to deduplicate
//!   highlights across imports, and
//! - the *book key*, `normalize(authors) + "::" + normalize(title)`, the
//!   logical identity of a book across imports.
//!
//! IDs are content hashes so reordering or re-exporting on the device never
//! breaks references.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Warning;

/// One highlight gesture on the reader.
///
/// `datetime` is an RFC-3339 string; the source guarantees it is stable per
/// user gesture, and RFC-3339 strings order lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub page: u32,
    /// Start position; opaque to the engine (CFI fragment or "x,y" pair).
    pub pos0: String,
    /// End position, when the reader records one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos1: Option<String>,
    /// Highlighted text.
    pub text: String,
    /// Optional user note attached to the highlight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// RFC-3339 timestamp of the gesture.
    pub datetime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draw: Option<String>,
}

impl Annotation {
    /// Stable 16-hex-char content id over the normalized
    /// `(page, start, end, text, note)` tuple.
    ///
    /// The hash algorithm is frozen: changing it would reclassify every
    /// previously imported highlight as new.
    pub fn id(&self) -> String {
        let canonical = format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
            self.page,
            normalize_text(&self.pos0),
            normalize_text(self.pos1.as_deref().unwrap_or("")),
            normalize_text(&self.text),
            normalize_text(self.note.as_deref().unwrap_or("")),
        );
        let hash = blake3::hash(canonical.as_bytes());
        hash.to_hex()[..16].to_string()
    }

    /// Sort key for deterministic annotation ordering: page, then position,
    /// then gesture time.
    pub fn sort_key(&self) -> (u32, String, String) {
        (self.page, self.pos0.clone(), self.datetime.clone())
    }
}

/// Lowercase and collapse all whitespace runs to single spaces.
///
/// Shared by annotation ids and book keys so both survive cosmetic
/// re-exports (line-wrap changes, case-only edits on the device).
pub fn normalize_text(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Authors fields sometimes carry an opaque store URL instead of a name.
/// Those contribute nothing to identity and are treated as empty.
fn authors_for_key(authors: &str) -> &str {
    let t = authors.trim();
    if t.starts_with("http://") || t.starts_with("https://") {
        ""
    } else {
        authors
    }
}

/// Book metadata as parsed from the reader's sidecar files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookMetadata {
    pub title: String,
    /// May be empty or an opaque identifier.
    #[serde(default)]
    pub authors: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Content hash reported by the source, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    /// Structured identifiers as `scheme:value` pairs (isbn, asin, ...).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifiers: Vec<(String, String)>,
}

impl BookMetadata {
    /// Logical identity of the book across imports.
    pub fn book_key(&self) -> String {
        format!(
            "{}::{}",
            normalize_text(authors_for_key(&self.authors)),
            normalize_text(&self.title)
        )
    }
}

/// `(mtime, size)` of a source file, as observed by the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStat {
    /// Modification time, seconds since the Unix epoch.
    pub mtime: i64,
    pub size: u64,
}

/// Per-source-file import state row. Drives "should we re-process?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSourceRecord {
    pub source_path: String,
    pub last_processed_mtime: Option<i64>,
    pub last_processed_size: Option<i64>,
    /// Newest annotation timestamp seen on the last successful import.
    pub newest_annotation_ts: Option<String>,
    pub last_success_ts: Option<String>,
    pub last_error: Option<String>,
    pub book_key: Option<String>,
    pub md5: Option<String>,
}

/// Index row: one logical book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookRow {
    pub key: String,
    pub title: String,
    pub authors: String,
}

/// Index row: one note file mirroring a book. A book with zero instances is
/// garbage-collected by the index trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteInstance {
    pub book_key: String,
    pub vault_path: String,
}

/// How tracking markers are embedded in note bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentStyle {
    #[default]
    Html,
    Md,
    None,
}

impl std::fmt::Display for CommentStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CommentStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommentStyle::Html => "html",
            CommentStyle::Md => "md",
            CommentStyle::None => "none",
        }
    }
}

impl std::str::FromStr for CommentStyle {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "html" => Ok(CommentStyle::Html),
            "md" => Ok(CommentStyle::Md),
            "none" => Ok(CommentStyle::None),
            other => Err(format!("unknown comment style: {other:?}")),
        }
    }
}

/// Classification of a duplicate candidate relative to incoming annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    /// Identical annotation-id sets and identical canonical front-matter.
    Exact,
    /// The candidate's id set is a strict subset of the incoming set.
    SubsetExtension,
    Divergent,
}

/// A candidate note found for incoming metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub match_type: MatchType,
}

/// Resolver confidence: `Partial` only when the index was unavailable and
/// the fallback scan produced multiple candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    Full,
    Partial,
}

/// Resolver output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateFinding {
    pub candidate: Option<Candidate>,
    pub confidence: Confidence,
}

impl DuplicateFinding {
    pub fn none() -> Self {
        Self {
            candidate: None,
            confidence: Confidence::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoAnnotations,
    Unchanged,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SkipReason::NoAnnotations => "NO_ANNOTATIONS",
            SkipReason::Unchanged => "UNCHANGED",
        })
    }
}

/// Planner output: what to do for one book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportPlan {
    Skip {
        reason: SkipReason,
    },
    Create,
    Merge {
        candidate: Candidate,
    },
    /// The resolver could not decide; solicit a choice from the user.
    AwaitUserChoice {
        title: String,
        existing_path: Option<PathBuf>,
    },
    /// The matched note lives outside the currently configured managed
    /// folder; confirm before touching it.
    AwaitStaleLocationConfirm {
        candidate: Candidate,
    },
}

/// Plan plus side-effect notes for the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDecision {
    pub plan: ImportPlan,
    /// Known instance paths that no longer exist on disk; the executor
    /// deletes them from the index before acting on the plan.
    pub index_cleanup_paths: Vec<PathBuf>,
}

impl ImportDecision {
    pub fn plain(plan: ImportPlan) -> Self {
        Self {
            plan,
            index_cleanup_paths: Vec::new(),
        }
    }
}

/// User's answer to a duplicate prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateChoice {
    Skip,
    KeepBoth,
    Replace,
    MergeUseSnapshot,
}

/// Request payload for [`crate::ports::UserPrompt::choose_duplicate`].
#[derive(Debug, Clone)]
pub struct DuplicateRequest {
    pub title: String,
    pub existing_path: Option<PathBuf>,
    pub incoming_annotations_count: usize,
    pub candidate_annotations_count: usize,
    pub match_type: Option<MatchType>,
}

/// Session-scoped merge policy supplied by the shell.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Merge without prompting when the incoming set only adds highlights.
    pub auto_merge_on_addition: bool,
    /// Duplicate prompts time out after this long; a timed-out prompt is
    /// treated as "skip" with a `DuplicateTimeout` warning.
    pub prompt_timeout: Option<Duration>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            auto_merge_on_addition: true,
            prompt_timeout: None,
        }
    }
}

/// Result of a MergeEngine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Skipped,
    /// No mutation performed; the executor creates a sibling note.
    KeepBoth,
    Merged {
        path: PathBuf,
        had_conflict: bool,
    },
}

/// Final outcome recorded per book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookOutcome {
    Created { path: PathBuf },
    Merged { path: PathBuf, had_conflict: bool },
    /// Subset-extension merged without prompting.
    AutoMerged { path: PathBuf },
    Skipped { reason: SkipReason },
    Failed,
    Cancelled,
}

/// Per-book report in the import summary.
#[derive(Debug, Clone)]
pub struct BookReport {
    pub source_path: PathBuf,
    pub outcome: BookOutcome,
    pub warnings: Vec<Warning>,
    pub target_path: Option<PathBuf>,
    pub error: Option<String>,
}

/// Aggregated result of an import run.
#[derive(Debug, Clone, Default)]
pub struct ImportSummary {
    pub created: usize,
    pub merged: usize,
    pub auto_merged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub per_book: Vec<BookReport>,
}

impl ImportSummary {
    pub fn record(&mut self, report: BookReport) {
        match &report.outcome {
            BookOutcome::Created { .. } => self.created += 1,
            BookOutcome::Merged { .. } => self.merged += 1,
            BookOutcome::AutoMerged { .. } => self.auto_merged += 1,
            BookOutcome::Skipped { .. } | BookOutcome::Cancelled => self.skipped += 1,
            BookOutcome::Failed => self.failed += 1,
        }
        self.per_book.push(report);
    }
}
