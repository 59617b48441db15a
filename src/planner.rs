//! Import planning
//!
//! Pure decision logic: given everything the coordinator gathered for one
//! book, produce the plan. Rules evaluate top to bottom; the first one that
//! fires wins. No I/O here — the planner is trivially testable and the
//! executor owns every side effect.

use std::path::PathBuf;

use crate::index::should_process;
use crate::model::{
    Annotation, BookMetadata, Confidence, DuplicateFinding, ImportDecision, ImportPlan,
    ImportSourceRecord, MatchType, SkipReason, SourceStat,
};

/// Everything the planner looks at for one book.
#[derive(Debug, Clone)]
pub struct PlanInput {
    pub metadata: BookMetadata,
    pub annotations: Vec<Annotation>,
    pub source_stat: Option<SourceStat>,
    pub newest_annotation_ts: Option<String>,
    pub existing_source_record: Option<ImportSourceRecord>,
    pub duplicate: DuplicateFinding,
    /// Known instance paths that no longer exist on disk.
    pub missing_target_paths: Vec<PathBuf>,
    pub force_reimport: bool,
    pub managed_folder: PathBuf,
    /// Pin the import to a specific note, bypassing duplicate resolution.
    pub force_note: Option<PathBuf>,
}

/// Newest annotation timestamp in a set (RFC-3339 orders lexicographically).
pub fn newest_annotation_ts(annotations: &[Annotation]) -> Option<String> {
    annotations
        .iter()
        .map(|a| a.datetime.as_str())
        .max()
        .map(str::to_string)
}

/// Decide what to do for one book.
pub fn plan(input: &PlanInput) -> ImportDecision {
    // 1. Source vanished between discovery and import.
    let Some(source_stat) = &input.source_stat else {
        return ImportDecision::plain(ImportPlan::Skip {
            reason: SkipReason::NoAnnotations,
        });
    };

    // 2. Nothing changed since the last successful import.
    if !input.force_reimport
        && !should_process(
            input.existing_source_record.as_ref(),
            source_stat,
            input.newest_annotation_ts.as_deref(),
            input.metadata.md5.as_deref(),
        )
    {
        if !input.missing_target_paths.is_empty() {
            // The note vanished: recreate it and hand the stale index rows
            // to the executor for cleanup.
            return ImportDecision {
                plan: ImportPlan::Create,
                index_cleanup_paths: input.missing_target_paths.clone(),
            };
        }
        return ImportDecision::plain(ImportPlan::Skip {
            reason: SkipReason::Unchanged,
        });
    }

    // A pinned target skips resolution entirely.
    if let Some(forced) = &input.force_note {
        return ImportDecision::plain(ImportPlan::Merge {
            candidate: crate::model::Candidate {
                path: forced.clone(),
                match_type: MatchType::Divergent,
            },
        });
    }

    // 3. The resolver could not decide with confidence.
    if input.duplicate.confidence == Confidence::Partial {
        return ImportDecision::plain(ImportPlan::AwaitUserChoice {
            title: input.metadata.title.clone(),
            existing_path: input.duplicate.candidate.as_ref().map(|c| c.path.clone()),
        });
    }

    if let Some(candidate) = &input.duplicate.candidate {
        // 4. Matched note lives outside the managed folder.
        if !candidate.path.starts_with(&input.managed_folder) {
            return ImportDecision::plain(ImportPlan::AwaitStaleLocationConfirm {
                candidate: candidate.clone(),
            });
        }
        // 5. Known note: identical imports skip, everything else merges.
        if candidate.match_type == MatchType::Exact {
            return ImportDecision::plain(ImportPlan::Skip {
                reason: SkipReason::Unchanged,
            });
        }
        return ImportDecision::plain(ImportPlan::Merge {
            candidate: candidate.clone(),
        });
    }

    // 6. Nothing to write.
    if input.annotations.is_empty() {
        return ImportDecision::plain(ImportPlan::Skip {
            reason: SkipReason::NoAnnotations,
        });
    }

    // 7. Fresh book.
    ImportDecision::plain(ImportPlan::Create)
}
