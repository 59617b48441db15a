//! Plan execution
//!
//! Takes an [`ImportDecision`] for one book and carries it out: create,
//! merge, skip, or escalate to the user through the prompt port. Every
//! error becomes a `Failed` entry in the book report — one broken book
//! never stops the run.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::codec::FrontMatter;
use crate::config::Settings;
use crate::error::{AppError, Warning};
use crate::fs::AtomicFs;
use crate::index::IndexStore;
use crate::merge::MergeEngine;
use crate::model::{
    BookMetadata, BookOutcome, BookReport, Candidate, DuplicateChoice, DuplicateRequest,
    ImportDecision, ImportPlan, MatchType, MergeOutcome, SkipReason,
};
use crate::persistence::NotePersistence;
use crate::ports::{BodyRenderer, SourceBook, UserPrompt};

/// Front-matter the import owns, derived from book metadata.
pub fn metadata_front_matter(metadata: &BookMetadata) -> FrontMatter {
    let mut fm = FrontMatter::new();
    fm.set_scalar("title", metadata.title.clone());
    fm.set_scalar("authors", metadata.authors.clone());
    if let Some(series) = &metadata.series {
        fm.set_scalar("series", series.clone());
    }
    if let Some(language) = &metadata.language {
        fm.set_scalar("language", language.clone());
    }
    fm
}

pub struct ImportExecutor {
    fs: Arc<AtomicFs>,
    index: Arc<IndexStore>,
    merge: Arc<MergeEngine>,
    persistence: Arc<NotePersistence>,
    renderer: Arc<dyn BodyRenderer>,
    prompts: Arc<dyn UserPrompt>,
    settings: Arc<Settings>,
}

impl ImportExecutor {
    pub fn new(
        fs: Arc<AtomicFs>,
        index: Arc<IndexStore>,
        merge: Arc<MergeEngine>,
        persistence: Arc<NotePersistence>,
        renderer: Arc<dyn BodyRenderer>,
        prompts: Arc<dyn UserPrompt>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            fs,
            index,
            merge,
            persistence,
            renderer,
            prompts,
            settings,
        }
    }

    /// Execute one decision, translating every failure into a report entry.
    pub async fn execute(
        &self,
        book: &SourceBook,
        decision: ImportDecision,
        cancel: &CancelToken,
    ) -> BookReport {
        let mut warnings = Vec::new();

        if !decision.index_cleanup_paths.is_empty() {
            let stale: Vec<String> = decision
                .index_cleanup_paths
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            if let Err(e) = self.index.delete_instances(&stale).await {
                tracing::warn!(error = %e, "stale instance cleanup failed");
            }
        }

        match self.run_plan(book, decision.plan, &mut warnings, cancel).await {
            Ok(outcome) => {
                let target_path = match &outcome {
                    BookOutcome::Created { path }
                    | BookOutcome::Merged { path, .. }
                    | BookOutcome::AutoMerged { path } => Some(path.clone()),
                    _ => None,
                };
                BookReport {
                    source_path: book.source_path.clone(),
                    outcome,
                    warnings,
                    target_path,
                    error: None,
                }
            }
            Err(e) if e.is_cancelled() => BookReport {
                source_path: book.source_path.clone(),
                outcome: BookOutcome::Cancelled,
                warnings,
                target_path: None,
                error: None,
            },
            Err(e) => {
                if let AppError::BackupFailed { path, cause } = &e {
                    // The note was left untouched; the next import retries.
                    warnings.push(Warning::BackupFailed {
                        path: path.clone(),
                        cause: cause.clone(),
                    });
                }
                tracing::warn!(
                    source = %book.source_path.display(),
                    error = %e,
                    "book import failed"
                );
                BookReport {
                    source_path: book.source_path.clone(),
                    outcome: BookOutcome::Failed,
                    warnings,
                    target_path: None,
                    error: Some(e.user_message()),
                }
            }
        }
    }

    async fn run_plan(
        &self,
        book: &SourceBook,
        plan: ImportPlan,
        warnings: &mut Vec<Warning>,
        cancel: &CancelToken,
    ) -> Result<BookOutcome, AppError> {
        cancel.check()?;
        match plan {
            ImportPlan::Skip { reason } => Ok(BookOutcome::Skipped { reason }),
            ImportPlan::Create => self.create(book, warnings, cancel).await,
            ImportPlan::Merge { candidate } => {
                self.merge_into(book, &candidate, None, warnings, cancel).await
            }
            ImportPlan::AwaitUserChoice {
                title,
                existing_path,
            } => {
                self.escalate_choice(book, title, existing_path, warnings, cancel)
                    .await
            }
            ImportPlan::AwaitStaleLocationConfirm { candidate } => {
                self.escalate_stale(book, candidate, warnings, cancel).await
            }
        }
    }

    fn render_body(&self, book: &SourceBook) -> String {
        let mut annotations = book.annotations.clone();
        annotations.sort_by_key(|a| a.sort_key());
        self.renderer.render(
            &book.metadata,
            &annotations,
            self.settings.comment_style,
            self.settings.max_highlight_gap,
        )
    }

    async fn create(
        &self,
        book: &SourceBook,
        warnings: &mut Vec<Warning>,
        cancel: &CancelToken,
    ) -> Result<BookOutcome, AppError> {
        let body = self.render_body(book);
        let fm = metadata_front_matter(&book.metadata);
        let content = crate::codec::reconstruct(&fm, &body);
        let stem = self.settings.filename_stem(&book.metadata);

        let created = self
            .persistence
            .create_note(&self.settings.managed_folder, &stem, &content, cancel)
            .await?;
        warnings.extend(created.warnings.iter().cloned());

        self.register_instance(book, &created.path).await;
        Ok(BookOutcome::Created { path: created.path })
    }

    async fn merge_into(
        &self,
        book: &SourceBook,
        candidate: &Candidate,
        forced_choice: Option<DuplicateChoice>,
        warnings: &mut Vec<Warning>,
        cancel: &CancelToken,
    ) -> Result<BookOutcome, AppError> {
        let auto = forced_choice.is_none()
            && candidate.match_type == MatchType::SubsetExtension
            && self.settings.policy.auto_merge_on_addition;
        let choice = forced_choice.unwrap_or(DuplicateChoice::MergeUseSnapshot);

        let incoming_fm = metadata_front_matter(&book.metadata);
        let rendered = self.render_body(book);
        let result = self
            .merge
            .handle_duplicate(
                candidate,
                &incoming_fm,
                &book.annotations,
                || async move { Ok(rendered) },
                choice,
                cancel,
            )
            .await?;
        warnings.extend(result.warnings.iter().cloned());

        match result.outcome {
            MergeOutcome::Skipped => Ok(BookOutcome::Skipped {
                reason: SkipReason::Unchanged,
            }),
            MergeOutcome::KeepBoth => {
                // The existing note stays untouched; a sibling is created
                // (collision suffixes keep the filenames apart).
                self.create(book, warnings, cancel).await
            }
            MergeOutcome::Merged { path, had_conflict } => {
                self.register_instance(book, &path).await;
                if auto && !had_conflict {
                    Ok(BookOutcome::AutoMerged { path })
                } else {
                    Ok(BookOutcome::Merged { path, had_conflict })
                }
            }
        }
    }

    async fn escalate_choice(
        &self,
        book: &SourceBook,
        title: String,
        existing_path: Option<PathBuf>,
        warnings: &mut Vec<Warning>,
        cancel: &CancelToken,
    ) -> Result<BookOutcome, AppError> {
        let candidate = existing_path.clone().map(|path| Candidate {
            path,
            match_type: MatchType::Divergent,
        });
        let request = DuplicateRequest {
            title: title.clone(),
            existing_path,
            incoming_annotations_count: book.annotations.len(),
            candidate_annotations_count: 0,
            match_type: candidate.as_ref().map(|c| c.match_type),
        };

        let choice = match self.prompt_with_timeout(&request).await {
            Ok(choice) => choice,
            Err(PromptFailure::TimedOut) => {
                warnings.push(Warning::DuplicateTimeout { title });
                return Ok(BookOutcome::Skipped {
                    reason: SkipReason::Unchanged,
                });
            }
            Err(PromptFailure::Error(e)) => return Err(e),
        };

        // The resolved choice is re-plugged as Merge, Create, or Skip.
        match (choice, candidate) {
            (DuplicateChoice::Skip, _) => Ok(BookOutcome::Skipped {
                reason: SkipReason::Unchanged,
            }),
            (DuplicateChoice::KeepBoth, _) | (_, None) => {
                self.create(book, warnings, cancel).await
            }
            (choice, Some(candidate)) => {
                self.merge_into(book, &candidate, Some(choice), warnings, cancel)
                    .await
            }
        }
    }

    async fn escalate_stale(
        &self,
        book: &SourceBook,
        candidate: Candidate,
        warnings: &mut Vec<Warning>,
        cancel: &CancelToken,
    ) -> Result<BookOutcome, AppError> {
        let use_existing = self.prompts.confirm_stale_location(&candidate).await?;
        if use_existing {
            self.merge_into(book, &candidate, None, warnings, cancel).await
        } else {
            // Leave the old note untouched; start fresh in the managed
            // folder.
            self.create(book, warnings, cancel).await
        }
    }

    async fn prompt_with_timeout(
        &self,
        request: &DuplicateRequest,
    ) -> Result<DuplicateChoice, PromptFailure> {
        match self.settings.policy.prompt_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.prompts.choose_duplicate(request)).await {
                    Ok(result) => result.map_err(PromptFailure::Error),
                    Err(_elapsed) => Err(PromptFailure::TimedOut),
                }
            }
            None => self
                .prompts
                .choose_duplicate(request)
                .await
                .map_err(PromptFailure::Error),
        }
    }

    async fn register_instance(&self, book: &SourceBook, path: &std::path::Path) {
        let row = crate::model::BookRow {
            key: book.metadata.book_key(),
            title: book.metadata.title.clone(),
            authors: book.metadata.authors.clone(),
        };
        if let Err(e) = self
            .index
            .upsert_instance(&row, &path.to_string_lossy())
            .await
        {
            tracing::warn!(error = %e, "index registration failed");
        }
        self.fs.on_path_changed(path);
    }
}

enum PromptFailure {
    TimedOut,
    Error(AppError),
}
