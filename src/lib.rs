//! # kohl - e-reader highlight sync
//!
//! Synchronizes reading highlights from a portable e-reader into a
//! user-owned folder of Markdown notes. Each book is mirrored as one note
//! with YAML front-matter and a rendered body of annotations; re-imports
//! preserve arbitrary user edits by merging three-way against a per-note
//! snapshot, and surface an explicit conflict when automatic reconciliation
//! is impossible.
//!
//! ## Architecture
//!
//! - **Pure cores**: [`codec`] (note text ↔ front-matter + body),
//!   [`merge`]'s diff3, and [`planner`] never touch I/O.
//! - **Stores**: [`index`] (SQLite books/instances/sources, with in-memory
//!   fallback and background rebuild) and [`identity`] (stable `kohl-uid`s
//!   and content snapshots).
//! - **Discipline**: every mutation of a note path or uid is serialized
//!   through [`keyed_queue`]; all file writes are atomic
//!   temp-then-rename ([`fs`]).
//! - **Shell ports** ([`ports`]): metadata source, body renderer, prompts,
//!   clock, and uid generation are injected; the engine stays free of
//!   device formats and UI.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use kohl::{CancelToken, Engine, EnginePorts, Settings};
//! use kohl::render::MarkdownRenderer;
//!
//! # async fn run(source: impl kohl::MetadataSource) -> anyhow::Result<()> {
//! let settings = Settings {
//!     managed_folder: "/vault/highlights".into(),
//!     data_dir: "/vault/.kohl".into(),
//!     ..Settings::default()
//! };
//! let engine = Engine::new(settings, EnginePorts {
//!     renderer: Arc::new(MarkdownRenderer),
//!     prompts: Arc::new(kohl::cli_support::HeadlessPrompt::default()),
//!     clock: Arc::new(kohl::SystemClock),
//!     ids: Arc::new(kohl::RandomUid),
//! }).await?;
//! let summary = engine.import_all(&source, &CancelToken::new(), None).await?;
//! println!("created {} merged {}", summary.created, summary.merged);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod fs;
pub mod identity;
pub mod index;
pub mod keyed_queue;
pub mod merge;
pub mod model;
pub mod planner;
pub mod ports;
pub mod render;
pub mod resolver;
pub mod worker_pool;

// Internal plumbing with narrower public surface.
pub mod cli_support;
pub mod executor;
pub mod persistence;

pub use cancel::CancelToken;
pub use config::Settings;
pub use engine::{ConvertReport, Engine, EnginePorts, EngineStatus, ImportProgress, ProgressSink};
pub use error::{AppError, FsError, Warning};
pub use model::{
    Annotation, BookMetadata, BookOutcome, BookReport, CommentStyle, DuplicateChoice,
    ImportSummary, SessionPolicy,
};
pub use ports::{
    BodyRenderer, Clock, MetadataSource, RandomId, RandomUid, SourceBook, SystemClock, UserPrompt,
};
