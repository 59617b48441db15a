//! Duplicate resolution
//!
//! Finds a candidate note for incoming book metadata and classifies how the
//! candidate's tracked highlights relate to the incoming set. The index is
//! the fast path; when it is unavailable or knows nothing, a streaming walk
//! of the managed root matches notes by normalized title/authors instead.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::codec;
use crate::error::AppError;
use crate::fs::AtomicFs;
use crate::index::IndexStore;
use crate::merge::IMPORT_OWNED_KEYS;
use crate::model::{
    normalize_text, Annotation, BookMetadata, Candidate, CommentStyle, Confidence,
    DuplicateFinding, MatchType,
};

pub struct DuplicateResolver {
    index: Arc<IndexStore>,
    fs: Arc<AtomicFs>,
}

/// Non-user front-matter fields must agree for an `exact` classification.
fn front_matter_matches(fm: &codec::FrontMatter, metadata: &BookMetadata) -> bool {
    let wanted = |key: &str| -> String {
        match key {
            "title" => normalize_text(&metadata.title),
            "authors" => normalize_text(&metadata.authors),
            "series" => normalize_text(metadata.series.as_deref().unwrap_or("")),
            "language" => normalize_text(metadata.language.as_deref().unwrap_or("")),
            _ => String::new(),
        }
    };
    IMPORT_OWNED_KEYS.iter().all(|key| {
        let have = normalize_text(fm.scalar(key).unwrap_or(""));
        have == wanted(key)
    })
}

fn classify(
    fm: &codec::FrontMatter,
    candidate_ids: &HashSet<String>,
    incoming_ids: &HashSet<String>,
    metadata: &BookMetadata,
) -> MatchType {
    if candidate_ids == incoming_ids && front_matter_matches(fm, metadata) {
        MatchType::Exact
    } else if candidate_ids.is_subset(incoming_ids) && candidate_ids != incoming_ids {
        MatchType::SubsetExtension
    } else {
        MatchType::Divergent
    }
}

impl DuplicateResolver {
    pub fn new(index: Arc<IndexStore>, fs: Arc<AtomicFs>) -> Self {
        Self { index, fs }
    }

    /// Find and classify a candidate note for `metadata`.
    pub async fn resolve(
        &self,
        metadata: &BookMetadata,
        incoming: &[Annotation],
        managed_root: &Path,
        comment_style: CommentStyle,
        cancel: &CancelToken,
    ) -> Result<DuplicateFinding, AppError> {
        let book_key = metadata.book_key();
        let incoming_ids: HashSet<String> = incoming.iter().map(|a| a.id()).collect();

        let index_degraded = self.index.is_unavailable();
        let mut from_index: Vec<PathBuf> = Vec::new();
        if !index_degraded {
            from_index = self
                .index
                .find_instances(&book_key)
                .await?
                .into_iter()
                .map(|i| PathBuf::from(i.vault_path))
                .collect();
        }

        let (paths, used_fallback) = if from_index.is_empty() {
            (
                self.fallback_scan(metadata, managed_root, cancel).await?,
                true,
            )
        } else {
            (from_index, false)
        };

        let mut candidates: Vec<(Candidate, i64)> = Vec::new();
        for path in paths {
            cancel.check()?;
            let Ok(text) = self.fs.read_text(&path).await else {
                // Index rows can outlive their files; the planner's
                // missing-path cleanup handles those.
                continue;
            };
            let parsed = codec::parse(&text);
            let extraction = codec::extract_highlights(&parsed.body, comment_style);
            let candidate_ids: HashSet<String> =
                extraction.ids().map(str::to_string).collect();
            let match_type = classify(&parsed.front_matter, &candidate_ids, &incoming_ids, metadata);
            let mtime = self.fs.stat(&path).await.map(|s| s.mtime).unwrap_or(0);
            candidates.push((
                Candidate {
                    path,
                    match_type,
                },
                mtime,
            ));
        }

        let multiple = candidates.len() > 1;
        // Tie-breaks: prefer candidates inside the managed root, then the
        // most recently modified.
        candidates.sort_by_key(|(c, mtime)| (!c.path.starts_with(managed_root), -mtime));
        let candidate = candidates.into_iter().next().map(|(c, _)| c);

        let confidence = if index_degraded && used_fallback && multiple {
            Confidence::Partial
        } else {
            Confidence::Full
        };

        if let Some(c) = &candidate {
            tracing::debug!(
                %book_key,
                path = %c.path.display(),
                match_type = ?c.match_type,
                ?confidence,
                "duplicate candidate found"
            );
        }

        Ok(DuplicateFinding {
            candidate,
            confidence,
        })
    }

    /// Walk the managed root and match notes by normalized title/authors.
    async fn fallback_scan(
        &self,
        metadata: &BookMetadata,
        managed_root: &Path,
        cancel: &CancelToken,
    ) -> Result<Vec<PathBuf>, AppError> {
        let wanted_key = metadata.book_key();
        let paths = self.fs.walk(managed_root, &["md"], true, cancel).await?;
        let mut matches = Vec::new();
        for path in paths.iter() {
            cancel.check()?;
            let Ok(text) = self.fs.read_text(path).await else {
                continue;
            };
            let parsed = codec::parse(&text);
            let title = parsed.front_matter.scalar("title").unwrap_or("");
            if title.is_empty() {
                continue;
            }
            let authors = parsed.front_matter.scalar("authors").unwrap_or("");
            let key = format!("{}::{}", normalize_text(authors), normalize_text(title));
            if key == wanted_key {
                matches.push(path.clone());
            }
        }
        Ok(matches)
    }
}
