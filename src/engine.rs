//! Engine facade and import coordination
//!
//! [`Engine`] wires every component together around one [`CacheRegistry`]
//! root context and exposes the public surface: `import_all`, `import_one`,
//! `convert_comment_style`, `reset_import_status`,
//! `force_recheck_capabilities`, and the vault-event entry points that keep
//! caches and index rows fresh.
//!
//! Imports fan out across books with bounded concurrency; everything that
//! touches one note path is serialized through the keyed queue, so books
//! never interleave writes on a shared note.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::CacheRegistry;
use crate::cancel::CancelToken;
use crate::codec;
use crate::config::Settings;
use crate::error::AppError;
use crate::executor::ImportExecutor;
use crate::fs::AtomicFs;
use crate::identity::IdentityStore;
use crate::index::{self, IndexState, IndexStore, RebuildPhase};
use crate::keyed_queue::KeyedQueue;
use crate::merge::MergeEngine;
use crate::model::{BookOutcome, BookReport, CommentStyle, ImportSummary};
use crate::planner::{self, PlanInput};
use crate::ports::{BodyRenderer, Clock, MetadataSource, RandomId, SourceBook, UserPrompt};
use crate::resolver::DuplicateResolver;
use crate::worker_pool::{run_pool, PoolOptions};

/// Ports the shell supplies when constructing the engine.
pub struct EnginePorts {
    pub renderer: Arc<dyn BodyRenderer>,
    pub prompts: Arc<dyn UserPrompt>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn RandomId>,
}

/// Per-book progress reported to an optional observer.
#[derive(Debug, Clone)]
pub struct ImportProgress {
    pub current: usize,
    pub total: usize,
    pub title: String,
}

pub type ProgressSink = Arc<dyn Fn(ImportProgress) + Send + Sync>;

/// Result of a comment-style conversion sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertReport {
    pub converted: usize,
    pub skipped: usize,
}

/// Status snapshot for the shell.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub index_state: IndexState,
    pub rebuild_phase: RebuildPhase,
    pub books: u64,
    pub note_instances: u64,
    pub import_sources: u64,
    pub last_run_at: Option<String>,
}

#[derive(Clone)]
pub struct Engine {
    settings: Arc<Settings>,
    caches: Arc<CacheRegistry>,
    fs: Arc<AtomicFs>,
    queues: Arc<KeyedQueue>,
    index: Arc<IndexStore>,
    identity: Arc<IdentityStore>,
    resolver: Arc<DuplicateResolver>,
    executor: Arc<ImportExecutor>,
}

impl Engine {
    pub async fn new(settings: Settings, ports: EnginePorts) -> Result<Self, AppError> {
        settings.validate()?;
        let settings = Arc::new(settings);

        let caches = Arc::new(CacheRegistry::new());
        let fs = Arc::new(AtomicFs::new(&caches));
        let queues = Arc::new(KeyedQueue::new());
        let index = IndexStore::open(&settings.data_dir, fs.clone(), ports.clock.clone()).await;
        let identity = Arc::new(IdentityStore::new(
            fs.clone(),
            queues.clone(),
            &caches,
            &settings.data_dir,
            ports.ids.clone(),
        ));
        let resolver = Arc::new(DuplicateResolver::new(index.clone(), fs.clone()));
        let merge = Arc::new(MergeEngine::new(
            fs.clone(),
            identity.clone(),
            queues.clone(),
            settings.comment_style,
        ));
        let persistence = Arc::new(crate::persistence::NotePersistence::new(
            fs.clone(),
            identity.clone(),
            queues.clone(),
            ports.clock.clone(),
        ));
        let executor = Arc::new(ImportExecutor::new(
            fs.clone(),
            index.clone(),
            merge,
            persistence,
            ports.renderer,
            ports.prompts,
            settings.clone(),
        ));

        let engine = Self {
            settings,
            caches,
            fs,
            queues,
            index,
            identity,
            resolver,
            executor,
        };

        if engine.index.state() == IndexState::InMemory {
            engine.spawn_rebuild();
        }

        Ok(engine)
    }

    /// Kick off the background rebuild of the in-memory index.
    fn spawn_rebuild(&self) {
        let index = self.index.clone();
        let fs = self.fs.clone();
        let root = self.settings.managed_folder.clone();
        tokio::spawn(async move {
            let cancel = CancelToken::new();
            if let Err(e) = index::rebuild_from_notes(&index, &fs, &root, &cancel, None).await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "background index rebuild failed");
                }
            }
        });
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn caches(&self) -> &CacheRegistry {
        &self.caches
    }

    /// Import every book the source provides.
    pub async fn import_all(
        &self,
        source: &dyn MetadataSource,
        cancel: &CancelToken,
        progress: Option<ProgressSink>,
    ) -> Result<ImportSummary, AppError> {
        self.import_all_with(source, false, cancel, progress).await
    }

    /// `import_all` with an explicit force flag (bypasses the unchanged
    /// check per book).
    pub async fn import_all_with(
        &self,
        source: &dyn MetadataSource,
        force_reimport: bool,
        cancel: &CancelToken,
        progress: Option<ProgressSink>,
    ) -> Result<ImportSummary, AppError> {
        let books = source.iter_books(cancel).await?;
        let summary = self
            .import_books(books, force_reimport, cancel, progress)
            .await;
        self.index.flush(true).await?;
        Ok(summary)
    }

    /// Import a single source file (used by per-book retries).
    pub async fn import_one(
        &self,
        source: &dyn MetadataSource,
        source_path: &Path,
        force_reimport: bool,
        cancel: &CancelToken,
    ) -> Result<BookReport, AppError> {
        let books = source.iter_books(cancel).await?;
        let book = books
            .into_iter()
            .find(|b| b.source_path == source_path)
            .ok_or_else(|| AppError::NotFound {
                path: source_path.to_path_buf(),
            })?;
        let report = self.process_book(book, force_reimport, cancel.clone()).await;
        self.index.flush(true).await?;
        Ok(report)
    }

    async fn import_books(
        &self,
        books: Vec<SourceBook>,
        force_reimport: bool,
        cancel: &CancelToken,
        progress: Option<ProgressSink>,
    ) -> ImportSummary {
        let total = books.len();
        let engine = self.clone();
        let token = cancel.clone();
        let mut rx = run_pool(
            books,
            move |book| {
                let engine = engine.clone();
                let token = token.clone();
                async move { Ok(engine.process_book(book, force_reimport, token).await) }
            },
            PoolOptions::new(self.settings.concurrency, cancel.clone()),
        );

        let mut summary = ImportSummary::default();
        let mut done = 0usize;
        while let Some(result) = rx.recv().await {
            done += 1;
            let report = match result {
                Ok(report) => report,
                Err(worker_err) => BookReport {
                    source_path: worker_err.item.source_path.clone(),
                    outcome: if worker_err.error.is_cancelled() {
                        BookOutcome::Cancelled
                    } else {
                        BookOutcome::Failed
                    },
                    warnings: Vec::new(),
                    target_path: None,
                    error: (!worker_err.error.is_cancelled())
                        .then(|| worker_err.error.user_message()),
                },
            };
            if let Some(sink) = &progress {
                sink(ImportProgress {
                    current: done,
                    total,
                    title: report
                        .target_path
                        .as_ref()
                        .and_then(|p| p.file_stem())
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| report.source_path.display().to_string()),
                });
            }
            summary.record(report);
        }

        tracing::info!(
            created = summary.created,
            merged = summary.merged,
            auto_merged = summary.auto_merged,
            skipped = summary.skipped,
            failed = summary.failed,
            "import run complete"
        );
        summary
    }

    /// Assemble planner inputs, plan, execute, and record the outcome.
    async fn process_book(
        &self,
        book: SourceBook,
        force_reimport: bool,
        cancel: CancelToken,
    ) -> BookReport {
        if cancel.is_cancelled() {
            return BookReport {
                source_path: book.source_path.clone(),
                outcome: BookOutcome::Cancelled,
                warnings: Vec::new(),
                target_path: None,
                error: None,
            };
        }

        let source_path_str = book.source_path.to_string_lossy().into_owned();
        let book_key = book.metadata.book_key();

        let input = match self.build_plan_input(&book, force_reimport, &cancel).await {
            Ok(input) => input,
            Err(e) => {
                let report = BookReport {
                    source_path: book.source_path.clone(),
                    outcome: if e.is_cancelled() {
                        BookOutcome::Cancelled
                    } else {
                        BookOutcome::Failed
                    },
                    warnings: Vec::new(),
                    target_path: None,
                    error: (!e.is_cancelled()).then(|| e.user_message()),
                };
                if matches!(report.outcome, BookOutcome::Failed) {
                    let _ = self
                        .index
                        .record_import_failure(&source_path_str, report.error.as_deref().unwrap_or("unknown"))
                        .await;
                }
                return report;
            }
        };

        let newest_ts = input.newest_annotation_ts.clone();
        let decision = planner::plan(&input);
        tracing::debug!(
            source = %book.source_path.display(),
            plan = ?decision.plan,
            "book planned"
        );
        let report = self.executor.execute(&book, decision, &cancel).await;

        // Record the source outcome regardless of what happened — except
        // for cancelled books, which keep their previous state.
        match &report.outcome {
            BookOutcome::Cancelled => {}
            BookOutcome::Failed => {
                let _ = self
                    .index
                    .record_import_failure(
                        &source_path_str,
                        report.error.as_deref().unwrap_or("unknown"),
                    )
                    .await;
            }
            _ => {
                let _ = self
                    .index
                    .record_import_success(
                        &source_path_str,
                        Some(&book_key),
                        book.metadata.md5.as_deref(),
                        book.stat.as_ref(),
                        newest_ts.as_deref(),
                    )
                    .await;
            }
        }
        let _ = self.index.flush(false).await;
        report
    }

    async fn build_plan_input(
        &self,
        book: &SourceBook,
        force_reimport: bool,
        cancel: &CancelToken,
    ) -> Result<PlanInput, AppError> {
        let source_path_str = book.source_path.to_string_lossy().into_owned();
        let existing_source_record = self.index.get_source_record(&source_path_str).await?;

        let duplicate = self
            .resolver
            .resolve(
                &book.metadata,
                &book.annotations,
                &self.settings.managed_folder,
                self.settings.comment_style,
                cancel,
            )
            .await?;

        let mut missing_target_paths = Vec::new();
        for instance in self.index.find_instances(&book.metadata.book_key()).await? {
            let path = PathBuf::from(&instance.vault_path);
            if !self.fs.exists(&path).await {
                missing_target_paths.push(path);
            }
        }

        Ok(PlanInput {
            newest_annotation_ts: planner::newest_annotation_ts(&book.annotations),
            metadata: book.metadata.clone(),
            annotations: book.annotations.clone(),
            source_stat: book.stat,
            existing_source_record,
            duplicate,
            missing_target_paths,
            force_reimport,
            managed_folder: self.settings.managed_folder.clone(),
            force_note: None,
        })
    }

    /// Rewrite tracking markers across the managed folder.
    pub async fn convert_comment_style(
        &self,
        target: CommentStyle,
        cancel: &CancelToken,
    ) -> Result<ConvertReport, AppError> {
        let paths = self
            .fs
            .walk(&self.settings.managed_folder, &["md"], true, cancel)
            .await?;
        let mut report = ConvertReport::default();

        for path in paths.iter() {
            cancel.check()?;
            let converted = self
                .queues
                .run(&path.to_string_lossy(), || async {
                    let text = self.fs.read_text(path).await?;
                    let parsed = codec::parse(&text);
                    let extraction =
                        codec::extract_highlights(&parsed.body, CommentStyle::Html);
                    let Some(found) = extraction.used_style else {
                        return Ok::<bool, AppError>(false);
                    };
                    if found == target {
                        return Ok(false);
                    }
                    let body = codec::convert_comment_style(&parsed.body, found, target);
                    let content = codec::reconstruct(&parsed.front_matter, &body);
                    self.fs.write_text_atomic(path, &content).await?;
                    Ok(true)
                })
                .await?;

            if converted {
                // Keep the snapshot in step with the rewritten note so the
                // conversion doesn't read as a user edit on the next merge.
                if let Err(e) = self.identity.create_snapshot_from_note_path(path).await {
                    tracing::warn!(path = %path.display(), error = %e, "snapshot refresh failed");
                }
                report.converted += 1;
            } else {
                report.skipped += 1;
            }
        }

        tracing::info!(?target, converted = report.converted, skipped = report.skipped, "comment style conversion complete");
        Ok(report)
    }

    /// Forget all import-source state.
    pub async fn reset_import_status(&self) -> Result<(), AppError> {
        self.index.reset_import_status().await?;
        self.index.flush(true).await
    }

    /// Re-probe the persistent index after a startup fallback.
    pub async fn force_recheck_capabilities(&self) -> bool {
        let recovered = self.index.force_recheck_capabilities().await;
        if recovered && self.index.rebuild_phase() == RebuildPhase::Idle {
            // The recovered file may predate this session's notes.
            self.spawn_rebuild();
        }
        recovered
    }

    pub async fn status(&self) -> Result<EngineStatus, AppError> {
        let (books, note_instances, import_sources) = self.index.counts().await?;
        let last_run_at =
            crate::index::read_state(&self.fs, &self.settings.data_dir)
                .await
                .map(|s| s.last_run_at);
        Ok(EngineStatus {
            index_state: self.index.state(),
            rebuild_phase: self.index.rebuild_phase(),
            books,
            note_instances,
            import_sources,
            last_run_at,
        })
    }

    // ------------------------------------------------------------------
    // Vault events (wired by the embedder's change notifications)
    // ------------------------------------------------------------------

    pub fn on_vault_create(&self, path: &Path) {
        self.fs.on_path_changed(path);
    }

    pub async fn on_vault_delete(&self, path: &Path) {
        self.fs.on_path_changed(path);
        let _ = self
            .index
            .delete_instances(&[path.to_string_lossy().into_owned()])
            .await;
        // Drop the snapshot only once the note is confirmed gone.
        if let Some(uid) = self.identity.uid_for_path(path) {
            if !self.fs.exists(path).await {
                if let Err(e) = self.identity.delete_snapshot(&uid).await {
                    tracing::warn!(%uid, error = %e, "snapshot cleanup failed");
                }
            }
        }
    }

    pub async fn on_vault_rename(&self, old_path: &Path, new_path: &Path) {
        self.fs.on_path_changed(old_path);
        self.fs.on_path_changed(new_path);
        let _ = self
            .index
            .rename_instance(
                &old_path.to_string_lossy(),
                &new_path.to_string_lossy(),
            )
            .await;
        if let Some(uid) = self.identity.uid_for_path(old_path) {
            self.identity.remember(&uid, new_path);
        }
    }

    /// Shutdown hook: force a flush so the debounce cannot drop the last
    /// transaction's checkpoint.
    pub async fn shutdown(&self) -> Result<(), AppError> {
        self.index.flush(true).await
    }
}
