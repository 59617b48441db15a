//! Error and warning types
//!
//! Predictable failures (missing files, permission denied, parse errors,
//! integrity failures) are always returned as `Err(AppError::..)` — they never
//! unwind. Panics are reserved for impossible branches.

use std::path::PathBuf;
use thiserror::Error;

/// Filesystem failure taxonomy used by [`crate::fs::AtomicFs`].
///
/// Split out from [`AppError`] so low-level file operations stay usable
/// without dragging in the full application error surface.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("not found: {path}")]
    NotFound { path: PathBuf },
    #[error("permission denied: {path}")]
    PermissionDenied { path: PathBuf },
    #[error("is a directory: {path}")]
    IsADirectory { path: PathBuf },
    #[error("not a directory: {path}")]
    NotADirectory { path: PathBuf },
    #[error("read failed: {path}: {cause}")]
    ReadFailed { path: PathBuf, cause: String },
    #[error("write failed: {path}: {cause}")]
    WriteFailed { path: PathBuf, cause: String },
}

impl FsError {
    /// Classify an `io::Error` for `path` into the typed taxonomy.
    ///
    /// `writing` selects the catch-all variant for unclassified kinds.
    pub fn from_io(path: &std::path::Path, err: &std::io::Error, writing: bool) -> Self {
        use std::io::ErrorKind;
        let path = path.to_path_buf();
        match err.kind() {
            ErrorKind::NotFound => FsError::NotFound { path },
            ErrorKind::PermissionDenied => FsError::PermissionDenied { path },
            ErrorKind::IsADirectory => FsError::IsADirectory { path },
            ErrorKind::NotADirectory => FsError::NotADirectory { path },
            _ if writing => FsError::WriteFailed {
                path,
                cause: err.to_string(),
            },
            _ => FsError::ReadFailed {
                path,
                cause: err.to_string(),
            },
        }
    }

    /// The path the failure refers to.
    pub fn path(&self) -> &std::path::Path {
        match self {
            FsError::NotFound { path }
            | FsError::PermissionDenied { path }
            | FsError::IsADirectory { path }
            | FsError::NotADirectory { path }
            | FsError::ReadFailed { path, .. }
            | FsError::WriteFailed { path, .. } => path,
        }
    }
}

/// Kind tag for [`AppError::ParseFailed`].
///
/// `Lua` and `Cfi` cover reader-side metadata formats parsed by the shell;
/// they are part of the closed union so shell adapters share the same error
/// surface as the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseKind {
    Lua,
    Yaml,
    Template,
    Date,
    Cfi,
}

impl std::fmt::Display for ParseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParseKind::Lua => "lua",
            ParseKind::Yaml => "yaml",
            ParseKind::Template => "template",
            ParseKind::Date => "date",
            ParseKind::Cfi => "cfi",
        };
        f.write_str(s)
    }
}

/// Closed error union returned by every public engine entry point.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("not found: {path}")]
    NotFound { path: PathBuf },
    #[error("permission denied: {path}")]
    PermissionDenied { path: PathBuf },
    #[error("not a directory: {path}")]
    NotADirectory { path: PathBuf },
    #[error("is a directory: {path}")]
    IsADirectory { path: PathBuf },
    #[error("read failed: {path}: {cause}")]
    ReadFailed { path: PathBuf, cause: String },
    #[error("write failed: {path}: {cause}")]
    WriteFailed { path: PathBuf, cause: String },
    #[error("{kind} parse failed: {message}")]
    ParseFailed {
        kind: ParseKind,
        message: String,
        context: Option<String>,
    },
    #[error("could not open index database {path}: {cause}")]
    DbOpenFailed { path: PathBuf, cause: String },
    #[error("index database {path} failed validation: {cause}")]
    DbValidateFailed { path: PathBuf, cause: String },
    #[error("could not persist index database {path}: {cause}")]
    DbPersistFailed { path: PathBuf, cause: String },
    #[error("capability denied: {capability}")]
    CapabilityDenied {
        capability: String,
        message: Option<String>,
    },
    #[error("snapshot missing for uid {uid}")]
    SnapshotMissing { uid: String },
    #[error("note has no uid: {path}")]
    UidMissing { path: PathBuf },
    #[error("uid mismatch at {path}: expected {expected}, found {found}")]
    UidMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
    #[error("backup failed for {path}: {cause}")]
    BackupFailed { path: PathBuf, cause: String },
    #[error("migration failed: {message}")]
    MigrationFailed {
        message: String,
        cause: Option<String>,
    },
    #[error("template not found: {path}")]
    TemplateNotFound { path: PathBuf },
    #[error("template {id} invalid: {errors:?}")]
    TemplateInvalid { id: String, errors: Vec<String> },
    #[error("missing config field: {field}")]
    ConfigMissing { field: String },
    #[error("invalid config field {field}: {}", .reason.as_deref().unwrap_or("unspecified"))]
    ConfigInvalid {
        field: String,
        reason: Option<String>,
    },
    /// Cooperative cancellation observed. Not a failure; callers translate it
    /// into a `Cancelled` outcome rather than an error report.
    #[error("cancelled")]
    Cancelled,
}

impl From<FsError> for AppError {
    fn from(e: FsError) -> Self {
        match e {
            FsError::NotFound { path } => AppError::NotFound { path },
            FsError::PermissionDenied { path } => AppError::PermissionDenied { path },
            FsError::IsADirectory { path } => AppError::IsADirectory { path },
            FsError::NotADirectory { path } => AppError::NotADirectory { path },
            FsError::ReadFailed { path, cause } => AppError::ReadFailed { path, cause },
            FsError::WriteFailed { path, cause } => AppError::WriteFailed { path, cause },
        }
    }
}

impl AppError {
    /// True when the error is the cancellation sentinel.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }

    /// One contextualized line suitable for user-facing failure reports.
    /// Internal diagnostics go to the tracing sink instead.
    pub fn user_message(&self) -> String {
        match self {
            AppError::DbOpenFailed { .. } | AppError::DbValidateFailed { .. } => format!(
                "{self}. Falling back to an in-memory index; lookups will be rebuilt in the background."
            ),
            AppError::BackupFailed { path, .. } => format!(
                "{self}. The note at {} was left untouched; the merge will be retried on the next import.",
                path.display()
            ),
            _ => self.to_string(),
        }
    }
}

/// Structured, non-fatal findings surfaced in per-book reports.
///
/// Warnings are returned as values, never thrown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// The requested filename stem exceeded the platform limit and was cut.
    FilenameTruncated { original: String, truncated: String },
    /// The pre-merge backup could not be written; the merge was aborted.
    BackupFailed { path: PathBuf, cause: String },
    /// The post-merge snapshot write failed; the note on disk is correct but
    /// the next import will merge against the previous snapshot.
    SnapshotFailed { uid: String, cause: String },
    /// A duplicate prompt timed out and was treated as "skip".
    DuplicateTimeout { title: String },
    /// Comment style "none" makes highlight-level dedup impossible; the body
    /// was replaced wholesale.
    WholesaleReplace { path: PathBuf },
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::FilenameTruncated {
                original,
                truncated,
            } => write!(f, "filename truncated: {original:?} -> {truncated:?}"),
            Warning::BackupFailed { path, cause } => {
                write!(f, "backup failed for {}: {cause}", path.display())
            }
            Warning::SnapshotFailed { uid, cause } => {
                write!(f, "snapshot write failed for uid {uid}: {cause}")
            }
            Warning::DuplicateTimeout { title } => {
                write!(f, "duplicate prompt for {title:?} timed out; skipped")
            }
            Warning::WholesaleReplace { path } => write!(
                f,
                "comment style is \"none\"; body of {} replaced wholesale",
                path.display()
            ),
        }
    }
}
