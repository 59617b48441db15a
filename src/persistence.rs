//! Collision-safe note creation
//!
//! New notes are created with `create_new` semantics and numbered suffixes,
//! so two books with the same filename stem never clobber each other. The
//! freshly created note gets its uid and initial snapshot immediately —
//! from that point on, merges have a base.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::error::{AppError, Warning};
use crate::fs::AtomicFs;
use crate::identity::IdentityStore;
use crate::keyed_queue::KeyedQueue;
use crate::ports::Clock;

/// Conservative cross-platform stem limit (bytes of the stem, before the
/// extension and any collision suffix).
const MAX_STEM_LEN: usize = 120;

/// Numbered-suffix probes before falling back to a timestamped stem.
const MAX_SUFFIX_PROBES: usize = 1000;

#[derive(Debug, Clone)]
pub struct CreatedNote {
    pub path: PathBuf,
    pub uid: String,
    pub warnings: Vec<Warning>,
}

/// Strip characters that are unsafe in filenames on any supported platform.
pub fn sanitize_stem(stem: &str) -> String {
    let cleaned: String = stem
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => ' ',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches(['.', ' ']).to_string();
    if trimmed.is_empty() {
        "Untitled".to_string()
    } else {
        trimmed
    }
}

fn truncate_stem(stem: &str) -> (String, bool) {
    if stem.len() <= MAX_STEM_LEN {
        return (stem.to_string(), false);
    }
    let mut end = MAX_STEM_LEN;
    while !stem.is_char_boundary(end) {
        end -= 1;
    }
    (stem[..end].trim_end().to_string(), true)
}

pub struct NotePersistence {
    fs: Arc<AtomicFs>,
    identity: Arc<IdentityStore>,
    queues: Arc<KeyedQueue>,
    clock: Arc<dyn Clock>,
}

impl NotePersistence {
    pub fn new(
        fs: Arc<AtomicFs>,
        identity: Arc<IdentityStore>,
        queues: Arc<KeyedQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            fs,
            identity,
            queues,
            clock,
        }
    }

    /// Create a new note under `target_folder` from `base_stem`, avoiding
    /// collisions with numbered suffixes. Assigns a uid and writes the
    /// initial snapshot before returning.
    pub async fn create_note(
        &self,
        target_folder: &Path,
        base_stem: &str,
        content: &str,
        cancel: &CancelToken,
    ) -> Result<CreatedNote, AppError> {
        let key = format!("create:{}/{base_stem}", target_folder.display());
        self.queues
            .run(&key, || async {
                cancel.check()?;
                self.create_locked(target_folder, base_stem, content, cancel)
                    .await
            })
            .await
    }

    async fn create_locked(
        &self,
        target_folder: &Path,
        base_stem: &str,
        content: &str,
        cancel: &CancelToken,
    ) -> Result<CreatedNote, AppError> {
        let mut warnings = Vec::new();

        let sanitized = sanitize_stem(base_stem);
        let (stem, truncated) = truncate_stem(&sanitized);
        if truncated {
            warnings.push(Warning::FilenameTruncated {
                original: base_stem.to_string(),
                truncated: stem.clone(),
            });
        }

        let mut created: Option<PathBuf> = None;
        for i in 0..MAX_SUFFIX_PROBES {
            cancel.check()?;
            let name = if i == 0 {
                format!("{stem}.md")
            } else {
                format!("{stem} ({i}).md")
            };
            let path = target_folder.join(name);
            if self.fs.write_text_if_absent(&path, content).await? {
                created = Some(path);
                break;
            }
        }

        let path = match created {
            Some(p) => p,
            None => {
                // Deterministic fallback: stem plus a compact timestamp.
                let ts: String = self
                    .clock
                    .now_rfc3339()
                    .chars()
                    .filter(|c| c.is_ascii_digit())
                    .collect();
                let path = target_folder.join(format!("{stem} {ts}.md"));
                self.fs.write_text_atomic(&path, content).await?;
                tracing::warn!(
                    %stem,
                    path = %path.display(),
                    "suffix probes exhausted, used timestamped filename"
                );
                path
            }
        };

        // uid + initial snapshot; the note path is freshly created, so the
        // path queue is uncontended but still taken for discipline.
        let path_key = path.to_string_lossy().into_owned();
        let uid = self
            .queues
            .run(&path_key, || async { self.identity.ensure_id(&path).await })
            .await?;
        let final_text = self.fs.read_text(&path).await?;
        self.identity.write_snapshot(&uid, &final_text).await?;

        tracing::info!(path = %path.display(), %uid, "note created");
        Ok(CreatedNote {
            path,
            uid,
            warnings,
        })
    }
}
