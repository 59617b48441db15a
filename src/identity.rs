//! Stable note identities and content snapshots
//!
//! Every managed note carries a `kohl-uid` front-matter key: an opaque
//! string, at least 8 characters, unique across the managed root. Once
//! assigned it is never reused and never rewritten except during explicit
//! collision repair. The uid anchors the note's *snapshot* — the full note
//! text at the last point the engine successfully wrote it — stored as
//! `snapshots/<uid>` under the plugin-data root and used as the three-way
//! merge base.
//!
//! Uid rewrites happen snapshot-first, front-matter-second; if the second
//! step fails the superseded snapshot is retained so the next retry can
//! reconcile.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{Cache, CacheRegistry};
use crate::codec;
use crate::error::{AppError, FsError};
use crate::fs::AtomicFs;
use crate::keyed_queue::KeyedQueue;
use crate::ports::RandomId;

/// Front-matter key holding the stable note id.
pub const UID_KEY: &str = "kohl-uid";

/// Minimum accepted uid length; shorter values are treated as absent.
const MIN_UID_LEN: usize = 8;

fn uid_queue_key(uid: &str) -> String {
    format!("uid:{uid}")
}

/// True when `value` is usable as a uid.
pub fn is_valid_uid(value: &str) -> bool {
    value.len() >= MIN_UID_LEN && value.chars().all(|c| c.is_ascii_alphanumeric())
}

pub struct IdentityStore {
    fs: Arc<AtomicFs>,
    queues: Arc<KeyedQueue>,
    ids: Arc<dyn RandomId>,
    snapshots_dir: PathBuf,
    /// uid → most-recently-seen note path. Cache-only, never authoritative.
    last_seen: Arc<Cache<String, PathBuf>>,
}

impl IdentityStore {
    pub fn new(
        fs: Arc<AtomicFs>,
        queues: Arc<KeyedQueue>,
        caches: &CacheRegistry,
        data_dir: &Path,
        ids: Arc<dyn RandomId>,
    ) -> Self {
        Self {
            fs,
            queues,
            ids,
            snapshots_dir: data_dir.join("snapshots"),
            last_seen: caches.map("identity.last_seen"),
        }
    }

    pub fn snapshot_path(&self, uid: &str) -> PathBuf {
        self.snapshots_dir.join(uid)
    }

    /// Record that `uid` was last observed at `path`.
    pub fn remember(&self, uid: &str, path: &Path) {
        self.last_seen.insert(uid.to_string(), path.to_path_buf());
    }

    /// Most recently seen note path for `uid`, if any.
    pub fn note_path_for(&self, uid: &str) -> Option<PathBuf> {
        self.last_seen.get(&uid.to_string())
    }

    /// Reverse lookup over the memo: the uid last seen at `path`. Cache-only
    /// knowledge; `None` means "not observed this session", not "no uid".
    pub fn uid_for_path(&self, path: &Path) -> Option<String> {
        self.last_seen
            .entries()
            .into_iter()
            .find(|(_, p)| p == path)
            .map(|(uid, _)| uid)
    }

    /// Read the note's uid from front-matter, if present and well-formed.
    pub async fn get_id(&self, path: &Path) -> Result<Option<String>, FsError> {
        let text = self.fs.read_text(path).await?;
        let parsed = codec::parse(&text);
        Ok(parsed
            .front_matter
            .scalar(UID_KEY)
            .filter(|v| is_valid_uid(v))
            .map(|v| {
                self.remember(v, path);
                v.to_string()
            }))
    }

    /// Generate a uid that does not collide with any known snapshot.
    pub async fn generate_uid(&self) -> String {
        loop {
            let uid = self.ids.new_uid();
            if !self.fs.exists(&self.snapshot_path(&uid)).await
                && self.last_seen.get(&uid).is_none()
            {
                return uid;
            }
            tracing::warn!(%uid, "uid collision on generation, regenerating");
        }
    }

    /// Return the note's uid, minting and persisting one when absent.
    ///
    /// Must run under `KeyedQueue(path)`: with concurrent callers, the
    /// queue guarantees only one writer mints, and later entrants observe
    /// the winning uid on their read.
    pub async fn ensure_id(&self, path: &Path) -> Result<String, AppError> {
        let text = self.fs.read_text(path).await?;
        let parsed = codec::parse(&text);
        if let Some(uid) = parsed
            .front_matter
            .scalar(UID_KEY)
            .filter(|v| is_valid_uid(v))
        {
            self.remember(uid, path);
            return Ok(uid.to_string());
        }

        let uid = self.generate_uid().await;
        let mut fm = parsed.front_matter.clone();
        fm.set_scalar(UID_KEY, uid.clone());
        self.fs
            .write_text_atomic(path, &codec::reconstruct(&fm, &parsed.body))
            .await?;
        self.remember(&uid, path);
        tracing::debug!(path = %path.display(), %uid, "assigned new uid");
        Ok(uid)
    }

    /// Read the snapshot for `uid`. A missing snapshot is `Ok(None)`, not
    /// an error — callers fall back to two-way reconciliation.
    pub async fn read_snapshot(&self, uid: &str) -> Result<Option<String>, FsError> {
        match self.fs.read_text(&self.snapshot_path(uid)).await {
            Ok(text) => Ok(Some(text)),
            Err(FsError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Atomically replace the snapshot for `uid`. Serialized per uid so an
    /// import and a collision repair can never interleave writes.
    pub async fn write_snapshot(&self, uid: &str, content: &str) -> Result<(), AppError> {
        let path = self.snapshot_path(uid);
        self.queues
            .run(&uid_queue_key(uid), || async {
                self.fs.write_text_atomic(&path, content).await
            })
            .await?;
        Ok(())
    }

    /// Snapshot the current on-disk state of `path`, assigning a uid first
    /// when needed. The snapshot stores the canonical reconstruction so
    /// later merges diff against normalized front-matter.
    pub async fn create_snapshot_from_note_path(&self, path: &Path) -> Result<(), AppError> {
        let key = path.to_string_lossy().into_owned();
        let (uid, content) = self
            .queues
            .run(&key, || async {
                let uid = self.ensure_id(path).await?;
                let text = self.fs.read_text(path).await?;
                let parsed = codec::parse(&text);
                let content = codec::reconstruct(&parsed.front_matter, &parsed.body);
                Ok::<_, AppError>((uid, content))
            })
            .await?;
        self.write_snapshot(&uid, &content).await
    }

    /// Resolve a uid collision: `path` claims `wanted_uid`, but the uid is
    /// already owned by another known note. Mints a fresh uid for `path`,
    /// snapshots under it, then rewrites front-matter. The owner's snapshot
    /// is never touched; any snapshot previously held by `path` under a
    /// different uid is removed only after the new one exists.
    ///
    /// Must run under `KeyedQueue(path)`.
    pub async fn repair_collision(
        &self,
        path: &Path,
        wanted_uid: &str,
    ) -> Result<String, AppError> {
        let owner = self.note_path_for(wanted_uid);
        let collides = match &owner {
            Some(other) if other != path => self.fs.exists(other).await,
            _ => false,
        };
        if !collides {
            self.remember(wanted_uid, path);
            return Ok(wanted_uid.to_string());
        }

        tracing::warn!(
            path = %path.display(),
            wanted_uid,
            owner = %owner.as_deref().map(|p| p.display().to_string()).unwrap_or_default(),
            "uid collision, minting replacement"
        );

        let text = self.fs.read_text(path).await?;
        let parsed = codec::parse(&text);
        let found = parsed.front_matter.scalar(UID_KEY).unwrap_or_default();
        if found != wanted_uid {
            // The note changed under us; recovery is to proceed with a new
            // uid anyway (UidMismatch is not fatal during repair).
            tracing::debug!(
                path = %path.display(),
                expected = wanted_uid,
                found,
                "uid mismatch during collision repair"
            );
        }

        let new_uid = self.generate_uid().await;
        let mut fm = parsed.front_matter.clone();
        fm.set_scalar(UID_KEY, new_uid.clone());
        let content = codec::reconstruct(&fm, &parsed.body);

        // Snapshot first; only then touch the note.
        self.write_snapshot(&new_uid, &content).await?;
        self.fs.write_text_atomic(path, &content).await?;
        self.remember(&new_uid, path);
        Ok(new_uid)
    }

    /// Remove the snapshot for `uid`. Only callable after the engine has
    /// confirmed the owning note no longer exists.
    pub async fn delete_snapshot(&self, uid: &str) -> Result<(), FsError> {
        match self.fs.remove_file(&self.snapshot_path(uid)).await {
            Ok(()) | Err(FsError::NotFound { .. }) => {
                self.last_seen.remove(&uid.to_string());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
