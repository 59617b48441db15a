//! Merge pipeline
//!
//! [`MergeEngine`] reconciles an existing note with a freshly rendered body.
//! With a base snapshot available it runs a three-way line merge
//! ([`diff3`]); without one it falls back to highlight-level union
//! ([`reconcile`]). Either way the sequence is fixed: ensure uid, read
//! current, read base, render incoming, back up, write atomically, snapshot.
//! The write/snapshot pair is the critical section — cancellation is
//! deferred across it so the snapshot chain of trust never breaks.

mod diff3;
mod reconcile;

pub use diff3::{
    contains_conflict_markers, default_conflict_formatter, merge3, render_regions,
    ConflictFormatter, Region, Rendered, OURS_MARKER, SEPARATOR_MARKER, THEIRS_MARKER,
};
pub use reconcile::{merge_front_matter, reconcile_bodies, union_theirs, IMPORT_OWNED_KEYS};

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::codec::{self, FrontMatter};
use crate::error::{AppError, Warning};
use crate::fs::AtomicFs;
use crate::identity::IdentityStore;
use crate::keyed_queue::KeyedQueue;
use crate::model::{Annotation, Candidate, CommentStyle, DuplicateChoice, MergeOutcome};

/// Front-matter flag set when a merge leaves conflict markers in the body,
/// cleared again by the next clean merge.
pub const CONFLICTS_KEY: &str = "conflicts";
pub const CONFLICTS_UNRESOLVED: &str = "unresolved";

/// Outcome plus the non-fatal findings gathered along the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub outcome: MergeOutcome,
    pub warnings: Vec<Warning>,
}

pub struct MergeEngine {
    fs: Arc<AtomicFs>,
    identity: Arc<IdentityStore>,
    queues: Arc<KeyedQueue>,
    comment_style: CommentStyle,
}

impl MergeEngine {
    pub fn new(
        fs: Arc<AtomicFs>,
        identity: Arc<IdentityStore>,
        queues: Arc<KeyedQueue>,
        comment_style: CommentStyle,
    ) -> Self {
        Self {
            fs,
            identity,
            queues,
            comment_style,
        }
    }

    /// Reconcile the note at `candidate.path` with the incoming import.
    ///
    /// `render_body` is the caller-provided pure renderer, invoked at most
    /// once. `choice` is the resolved action (session policy or user
    /// answer): `Skip` and `KeepBoth` perform no mutation here.
    pub async fn handle_duplicate<F, Fut>(
        &self,
        candidate: &Candidate,
        incoming_fm: &FrontMatter,
        incoming: &[Annotation],
        render_body: F,
        choice: DuplicateChoice,
        cancel: &CancelToken,
    ) -> Result<MergeResult, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, AppError>>,
    {
        match choice {
            DuplicateChoice::Skip => {
                return Ok(MergeResult {
                    outcome: MergeOutcome::Skipped,
                    warnings: Vec::new(),
                })
            }
            DuplicateChoice::KeepBoth => {
                return Ok(MergeResult {
                    outcome: MergeOutcome::KeepBoth,
                    warnings: Vec::new(),
                })
            }
            DuplicateChoice::Replace | DuplicateChoice::MergeUseSnapshot => {}
        }

        let path = candidate.path.clone();
        let key = path.to_string_lossy().into_owned();
        self.queues
            .run(&key, || async {
                cancel.check()?;
                self.merge_locked(&path, incoming_fm, incoming, render_body, choice, cancel)
                    .await
            })
            .await
    }

    /// Body of the merge; runs under `KeyedQueue(path)`.
    async fn merge_locked<F, Fut>(
        &self,
        path: &Path,
        incoming_fm: &FrontMatter,
        incoming: &[Annotation],
        render_body: F,
        choice: DuplicateChoice,
        cancel: &CancelToken,
    ) -> Result<MergeResult, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, AppError>>,
    {
        let mut warnings = Vec::new();

        let uid = self.identity.ensure_id(path).await?;
        let current_text = self.fs.read_text(path).await?;
        let current = codec::parse(&current_text);
        let snapshot = self.identity.read_snapshot(&uid).await?;
        let rendered_body = render_body().await?;
        cancel.check()?;

        let mut fm = merge_front_matter(&current.front_matter, incoming_fm);
        let (body, had_conflict) = match choice {
            DuplicateChoice::Replace => (rendered_body, false),
            DuplicateChoice::MergeUseSnapshot => {
                if self.comment_style == CommentStyle::None {
                    // Without tracking markers there is nothing to dedupe
                    // against; the body is replaced wholesale.
                    warnings.push(Warning::WholesaleReplace {
                        path: path.to_path_buf(),
                    });
                    (rendered_body, false)
                } else {
                    match snapshot {
                        Some(snapshot_text) => {
                            let base = codec::parse(&snapshot_text);
                            // The raw rendered body is the wrong "theirs":
                            // locally kept highlights the source rewrote
                            // would vanish. Union them in first.
                            let theirs = union_theirs(
                                &base.body,
                                &current.body,
                                &rendered_body,
                                self.comment_style,
                            );
                            let regions = merge3(&current.body, &base.body, &theirs);
                            let rendered = render_regions(&regions, None);
                            (rendered.merged_text, rendered.had_conflict)
                        }
                        None => {
                            warnings.push(Warning::SnapshotFailed {
                                uid: uid.clone(),
                                cause: "no base snapshot; two-way reconciliation used".into(),
                            });
                            let merged = reconcile_bodies(
                                &current.body,
                                &rendered_body,
                                incoming,
                                self.comment_style,
                            );
                            (merged, false)
                        }
                    }
                }
            }
            DuplicateChoice::Skip | DuplicateChoice::KeepBoth => unreachable!("handled by caller"),
        };

        if had_conflict {
            fm.set_scalar(CONFLICTS_KEY, CONFLICTS_UNRESOLVED);
        } else {
            fm.remove(CONFLICTS_KEY);
        }

        let new_content = codec::reconstruct(&fm, &body);
        if new_content == current_text {
            // Nothing to write; still make sure the snapshot matches so the
            // next merge has a base.
            if self.identity.read_snapshot(&uid).await?.as_deref() != Some(new_content.as_str()) {
                if let Err(e) = self.identity.write_snapshot(&uid, &new_content).await {
                    warnings.push(Warning::SnapshotFailed {
                        uid: uid.clone(),
                        cause: e.to_string(),
                    });
                }
            }
            return Ok(MergeResult {
                outcome: MergeOutcome::Merged {
                    path: path.to_path_buf(),
                    had_conflict: false,
                },
                warnings,
            });
        }

        // Durable backup before the primary write; abort on failure.
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bak = path.with_file_name(format!("{file_name}.bak"));
        if let Err(e) = self.fs.write_text_atomic(&bak, &current_text).await {
            return Err(AppError::BackupFailed {
                path: path.to_path_buf(),
                cause: e.to_string(),
            });
        }

        // Critical pair: note write then snapshot write. Cancellation is
        // deferred until both complete.
        self.fs.write_text_atomic(path, &new_content).await?;
        if let Err(e) = self.identity.write_snapshot(&uid, &new_content).await {
            // Note on disk is correct; next import merges against the prior
            // snapshot. Reported, not fatal.
            tracing::warn!(%uid, error = %e, "snapshot write failed after merge");
            warnings.push(Warning::SnapshotFailed {
                uid: uid.clone(),
                cause: e.to_string(),
            });
        }

        tracing::info!(
            path = %path.display(),
            %uid,
            had_conflict,
            "note merged"
        );
        Ok(MergeResult {
            outcome: MergeOutcome::Merged {
                path: path.to_path_buf(),
                had_conflict,
            },
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheRegistry;
    use crate::model::MatchType;
    use crate::ports::RandomUid;

    struct Fixture {
        engine: MergeEngine,
        identity: Arc<IdentityStore>,
        fs: Arc<AtomicFs>,
        dir: tempfile::TempDir,
    }

    fn fixture(style: CommentStyle) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let caches = CacheRegistry::new();
        let fs = Arc::new(AtomicFs::new(&caches));
        let queues = Arc::new(KeyedQueue::new());
        let identity = Arc::new(IdentityStore::new(
            fs.clone(),
            queues.clone(),
            &caches,
            &dir.path().join("data"),
            Arc::new(RandomUid),
        ));
        let engine = MergeEngine::new(fs.clone(), identity.clone(), queues, style);
        Fixture {
            engine,
            identity,
            fs,
            dir,
        }
    }

    fn ann(page: u32, text: &str) -> Annotation {
        Annotation {
            page,
            pos0: format!("{page}.0"),
            pos1: None,
            text: text.into(),
            note: None,
            datetime: "2024-01-01T00:00:00Z".into(),
            color: None,
            draw: None,
        }
    }

    fn incoming_fm() -> FrontMatter {
        let mut fm = FrontMatter::new();
        fm.set_scalar("title", "The Odyssey");
        fm.set_scalar("authors", "Homer");
        fm
    }

    fn candidate(path: &Path) -> Candidate {
        Candidate {
            path: path.to_path_buf(),
            match_type: MatchType::SubsetExtension,
        }
    }

    fn render_blocks(anns: &[&Annotation]) -> String {
        anns.iter()
            .map(|a| format!("<!-- kohl-id: {} -->\n> {}\n\n", a.id(), a.text))
            .collect()
    }

    async fn seed_note(fx: &Fixture, body: &str) -> std::path::PathBuf {
        let path = fx.dir.path().join("vault/The Odyssey - Homer.md");
        let text = format!("---\ntitle: The Odyssey\nauthors: Homer\n---\n\n{body}");
        fx.fs.write_text_atomic(&path, &text).await.unwrap();
        // Establish uid + snapshot, as NotePersistence would on creation.
        fx.identity.create_snapshot_from_note_path(&path).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_skip_and_keep_both_do_not_touch_the_note() {
        let fx = fixture(CommentStyle::Html);
        let path = seed_note(&fx, "body\n").await;
        let before = fx.fs.read_text(&path).await.unwrap();

        for choice in [DuplicateChoice::Skip, DuplicateChoice::KeepBoth] {
            let result = fx
                .engine
                .handle_duplicate(
                    &candidate(&path),
                    &incoming_fm(),
                    &[],
                    || async { Ok("ignored".to_string()) },
                    choice,
                    &CancelToken::new(),
                )
                .await
                .unwrap();
            match choice {
                DuplicateChoice::Skip => assert_eq!(result.outcome, MergeOutcome::Skipped),
                DuplicateChoice::KeepBoth => assert_eq!(result.outcome, MergeOutcome::KeepBoth),
                _ => unreachable!(),
            }
        }
        assert_eq!(fx.fs.read_text(&path).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_additive_merge_with_snapshot() {
        let fx = fixture(CommentStyle::Html);
        let a1 = ann(1, "first");
        let a2 = ann(2, "second");
        let path = seed_note(&fx, &render_blocks(&[&a1])).await;

        let rendered = render_blocks(&[&a1, &a2]);
        let result = fx
            .engine
            .handle_duplicate(
                &candidate(&path),
                &incoming_fm(),
                &[a1.clone(), a2.clone()],
                || async move { Ok(rendered) },
                DuplicateChoice::MergeUseSnapshot,
                &CancelToken::new(),
            )
            .await
            .unwrap();

        let MergeOutcome::Merged { had_conflict, .. } = result.outcome else {
            panic!("expected merge");
        };
        assert!(!had_conflict);

        let text = fx.fs.read_text(&path).await.unwrap();
        assert!(text.contains(&a1.id()));
        assert!(text.contains(&a2.id()));
        assert!(!text.contains(CONFLICTS_UNRESOLVED));

        // Snapshot advanced to the merged content.
        let uid = fx.identity.get_id(&path).await.unwrap().unwrap();
        assert_eq!(
            fx.identity.read_snapshot(&uid).await.unwrap().unwrap(),
            text
        );
    }

    #[tokio::test]
    async fn test_user_edits_preserved_in_three_way_merge() {
        let fx = fixture(CommentStyle::Html);
        let a1 = ann(1, "first");
        let a2 = ann(2, "second");
        let a3 = ann(3, "third");
        let a4 = ann(4, "fourth");
        let path = seed_note(&fx, &render_blocks(&[&a1, &a2, &a3])).await;

        // User adds a paragraph after the first highlight; the source later
        // appends a new highlight at the end. Stable lines separate the two
        // edits, so the merge must stay clean.
        let snapshot_text = fx.fs.read_text(&path).await.unwrap();
        let edited = snapshot_text.replace("> first", "> first\n\nMy thoughts on this passage.");
        fx.fs.write_text_atomic(&path, &edited).await.unwrap();

        let rendered = render_blocks(&[&a1, &a2, &a3, &a4]);
        let result = fx
            .engine
            .handle_duplicate(
                &candidate(&path),
                &incoming_fm(),
                &[a1.clone(), a2.clone(), a3.clone(), a4.clone()],
                || async move { Ok(rendered) },
                DuplicateChoice::MergeUseSnapshot,
                &CancelToken::new(),
            )
            .await
            .unwrap();

        let MergeOutcome::Merged { had_conflict, .. } = result.outcome else {
            panic!("expected merge");
        };
        assert!(!had_conflict, "non-overlapping edits merge cleanly");

        let text = fx.fs.read_text(&path).await.unwrap();
        assert!(text.contains("My thoughts on this passage."));
        assert!(text.contains(&a4.id()));
    }

    #[tokio::test]
    async fn test_source_rewritten_highlight_keeps_local_copy() {
        // The source rewrote the second highlight (new annotation id); the
        // user edited a paragraph next to it but not the tracked segment.
        // Both copies survive and nothing conflicts.
        let fx = fixture(CommentStyle::Html);
        let a1 = ann(1, "first");
        let a2 = ann(2, "second");
        let a2x = ann(2, "second, from the new edition");
        let a3 = ann(3, "third");
        let path = seed_note(&fx, &render_blocks(&[&a1, &a2, &a3])).await;

        let snapshot_text = fx.fs.read_text(&path).await.unwrap();
        let edited = snapshot_text.replace("> second\n", "> second\nA thought of mine.\n");
        fx.fs.write_text_atomic(&path, &edited).await.unwrap();

        let rendered = render_blocks(&[&a1, &a2x, &a3]);
        let result = fx
            .engine
            .handle_duplicate(
                &candidate(&path),
                &incoming_fm(),
                &[a1.clone(), a2x.clone(), a3.clone()],
                || async move { Ok(rendered) },
                DuplicateChoice::MergeUseSnapshot,
                &CancelToken::new(),
            )
            .await
            .unwrap();

        let MergeOutcome::Merged { had_conflict, .. } = result.outcome else {
            panic!("expected merge");
        };
        assert!(!had_conflict);

        let text = fx.fs.read_text(&path).await.unwrap();
        assert!(text.contains("A thought of mine."));
        assert!(text.contains(&a2.id()), "local copy of the highlight kept");
        assert!(text.contains(&a2x.id()), "incoming rewrite added");
        assert!(!text.contains(OURS_MARKER));
    }

    #[tokio::test]
    async fn test_conflicting_edits_produce_sentinels_and_flag() {
        let fx = fixture(CommentStyle::Html);
        let a1 = ann(1, "first");
        let path = seed_note(&fx, &render_blocks(&[&a1])).await;

        // User rewrites the tracked segment...
        let snapshot_text = fx.fs.read_text(&path).await.unwrap();
        let edited = snapshot_text.replace("> first", "> first, as I remember it");
        fx.fs.write_text_atomic(&path, &edited).await.unwrap();

        // ...and the source rewrites the same segment differently.
        let rendered = render_blocks(&[&a1]).replace("> first", "> first, per the new edition");
        let result = fx
            .engine
            .handle_duplicate(
                &candidate(&path),
                &incoming_fm(),
                &[a1.clone()],
                || async move { Ok(rendered) },
                DuplicateChoice::MergeUseSnapshot,
                &CancelToken::new(),
            )
            .await
            .unwrap();

        let MergeOutcome::Merged { had_conflict, .. } = result.outcome else {
            panic!("expected merge");
        };
        assert!(had_conflict);

        let text = fx.fs.read_text(&path).await.unwrap();
        assert!(text.contains(OURS_MARKER));
        assert!(text.contains("as I remember it"));
        assert!(text.contains("per the new edition"));
        assert!(text.contains("conflicts: unresolved"));

        // A backup of the pre-merge state exists.
        let bak = path.with_file_name("The Odyssey - Homer.md.bak");
        assert_eq!(fx.fs.read_text(&bak).await.unwrap(), edited);
    }

    #[tokio::test]
    async fn test_missing_snapshot_falls_back_to_two_way() {
        let fx = fixture(CommentStyle::Html);
        let a1 = ann(1, "first");
        let a2 = ann(2, "second");
        let path = seed_note(&fx, &render_blocks(&[&a1])).await;

        // Lose the snapshot.
        let uid = fx.identity.get_id(&path).await.unwrap().unwrap();
        fx.identity.delete_snapshot(&uid).await.unwrap();

        let rendered = render_blocks(&[&a1, &a2]);
        let result = fx
            .engine
            .handle_duplicate(
                &candidate(&path),
                &incoming_fm(),
                &[a1.clone(), a2.clone()],
                || async move { Ok(rendered) },
                DuplicateChoice::MergeUseSnapshot,
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(result.outcome, MergeOutcome::Merged { .. }));
        assert!(
            result
                .warnings
                .iter()
                .any(|w| matches!(w, Warning::SnapshotFailed { .. })),
            "informational warning about the missing base"
        );
        let text = fx.fs.read_text(&path).await.unwrap();
        assert!(text.contains(&a1.id()));
        assert!(text.contains(&a2.id()));
    }

    #[tokio::test]
    async fn test_comment_style_none_replaces_wholesale() {
        let fx = fixture(CommentStyle::None);
        let path = seed_note(&fx, "old body, user edited\n").await;

        let result = fx
            .engine
            .handle_duplicate(
                &candidate(&path),
                &incoming_fm(),
                &[],
                || async { Ok("brand new body\n".to_string()) },
                DuplicateChoice::MergeUseSnapshot,
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert!(result
            .warnings
            .iter()
            .any(|w| matches!(w, Warning::WholesaleReplace { .. })));
        let text = fx.fs.read_text(&path).await.unwrap();
        assert!(text.contains("brand new body"));
        assert!(!text.contains("user edited"));
    }

    #[tokio::test]
    async fn test_replace_uses_rendered_body() {
        let fx = fixture(CommentStyle::Html);
        let path = seed_note(&fx, "old\n").await;

        let result = fx
            .engine
            .handle_duplicate(
                &candidate(&path),
                &incoming_fm(),
                &[],
                || async { Ok("replacement\n".to_string()) },
                DuplicateChoice::Replace,
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(result.outcome, MergeOutcome::Merged { .. }));
        let text = fx.fs.read_text(&path).await.unwrap();
        assert!(text.ends_with("replacement\n"));
    }

    #[tokio::test]
    async fn test_clean_merge_clears_conflict_flag() {
        let fx = fixture(CommentStyle::Html);
        let a1 = ann(1, "first");
        let path = fx.dir.path().join("vault/n.md");
        let text = format!(
            "---\ntitle: The Odyssey\nauthors: Homer\nconflicts: unresolved\n---\n\n{}",
            render_blocks(&[&a1])
        );
        fx.fs.write_text_atomic(&path, &text).await.unwrap();
        fx.identity.create_snapshot_from_note_path(&path).await.unwrap();

        let rendered = render_blocks(&[&a1]);
        fx.engine
            .handle_duplicate(
                &candidate(&path),
                &incoming_fm(),
                &[a1.clone()],
                || async move { Ok(rendered) },
                DuplicateChoice::MergeUseSnapshot,
                &CancelToken::new(),
            )
            .await
            .unwrap();

        let after = fx.fs.read_text(&path).await.unwrap();
        assert!(!after.contains("conflicts:"));
    }
}
