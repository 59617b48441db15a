//! Atomic filesystem layer
//!
//! All filesystem side effects for note, snapshot, and index data go through
//! [`AtomicFs`]. Writes are temp-file-then-rename so a crash mid-write leaves
//! either the prior content or nothing, never a partial file. Transient
//! errors retry with jittered backoff; predictable failures come back as
//! typed [`FsError`] results, never panics.
//!
//! Directory walks are cached per `(root, extensions, recursive)` in the
//! engine's [`CacheRegistry`] and invalidated through [`AtomicFs::on_path_changed`],
//! which embedders call from whatever change notification their environment
//! provides.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{Cache, CacheRegistry};
use crate::cancel::CancelToken;
use crate::error::{AppError, FsError};
use crate::model::SourceStat;

/// Bounded retry for transient errors.
const MAX_ATTEMPTS: u32 = 6;
const BASE_DELAY_MS: u64 = 30;

type WalkKey = (PathBuf, String, bool);

/// Result of [`AtomicFs::list_dir`].
#[derive(Debug, Clone, Default)]
pub struct DirListing {
    pub files: Vec<PathBuf>,
    pub folders: Vec<PathBuf>,
}

pub struct AtomicFs {
    walk_cache: Arc<Cache<WalkKey, Arc<Vec<PathBuf>>>>,
    dir_cache: Arc<Cache<PathBuf, bool>>,
}

fn is_transient(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

async fn retrying<T, Fut>(
    path: &Path,
    writing: bool,
    mut op: impl FnMut() -> Fut,
) -> Result<T, FsError>
where
    Fut: std::future::Future<Output = std::io::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) && attempt + 1 < MAX_ATTEMPTS => {
                let jitter = rand::random::<u64>() % BASE_DELAY_MS;
                let delay = BASE_DELAY_MS << attempt;
                tracing::debug!(
                    path = %path.display(),
                    attempt,
                    delay_ms = delay + jitter,
                    error = %e,
                    "transient fs error, retrying"
                );
                tokio::time::sleep(std::time::Duration::from_millis(delay + jitter)).await;
                attempt += 1;
            }
            Err(e) => return Err(FsError::from_io(path, &e, writing)),
        }
    }
}

impl AtomicFs {
    pub fn new(caches: &CacheRegistry) -> Self {
        Self {
            walk_cache: caches.map("fs.walk"),
            dir_cache: caches.map("fs.dirs"),
        }
    }

    pub async fn read_text(&self, path: &Path) -> Result<String, FsError> {
        retrying(path, false, || tokio::fs::read_to_string(path)).await
    }

    pub async fn read_binary(&self, path: &Path) -> Result<Vec<u8>, FsError> {
        retrying(path, false, || tokio::fs::read(path)).await
    }

    /// Write `content` to `<path>.tmp-<rand>`, fsync where available, then
    /// rename over the destination. When rename-over-existing is unsupported
    /// on the filesystem, fall back to backup-remove-rename with the backup
    /// restored on failure.
    pub async fn write_text_atomic(&self, path: &Path, content: &str) -> Result<(), FsError> {
        self.write_binary_atomic(path, content.as_bytes()).await
    }

    pub async fn write_binary_atomic(&self, path: &Path, content: &[u8]) -> Result<(), FsError> {
        self.ensure_parent_dir(path).await?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if file_name.is_empty() {
            return Err(FsError::WriteFailed {
                path: path.to_path_buf(),
                cause: "path has no file name".into(),
            });
        }
        // Unpredictable suffix so stale tmp files never collide and symlink
        // pre-creation attacks don't land.
        let tmp = path.with_file_name(format!("{file_name}.tmp-{:08x}", rand::random::<u32>()));

        let write_result = async {
            use tokio::io::AsyncWriteExt;
            let mut f = tokio::fs::File::create(&tmp).await?;
            f.write_all(content).await?;
            match f.sync_all().await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Unsupported => Ok(()),
                Err(e) => Err(e),
            }
        }
        .await;
        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(FsError::from_io(&tmp, &e, true));
        }

        if let Err(first) = retrying(path, true, || tokio::fs::rename(&tmp, path)).await {
            // Some filesystems refuse to rename over an existing file. Take a
            // backup, clear the destination, and retry; restore on failure.
            if !self.exists(path).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(first);
            }
            let bak = path.with_file_name(format!("{file_name}.bak"));
            if let Err(e) = tokio::fs::copy(path, &bak).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(FsError::from_io(&bak, &e, true));
            }
            let _ = tokio::fs::remove_file(path).await;
            if let Err(e) = tokio::fs::rename(&tmp, path).await {
                let restored = tokio::fs::rename(&bak, path).await.is_ok();
                let _ = tokio::fs::remove_file(&tmp).await;
                tracing::warn!(
                    path = %path.display(),
                    restored,
                    error = %e,
                    "atomic rename fallback failed"
                );
                return Err(FsError::from_io(path, &e, true));
            }
            let _ = tokio::fs::remove_file(&bak).await;
        }

        self.on_path_changed(path);
        Ok(())
    }

    /// Create `path` with `content` only if it does not exist yet.
    /// Returns `Ok(false)` when the path already exists.
    pub async fn write_text_if_absent(&self, path: &Path, content: &str) -> Result<bool, FsError> {
        self.ensure_parent_dir(path).await?;
        let result = async {
            use tokio::io::AsyncWriteExt;
            let mut f = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await?;
            f.write_all(content.as_bytes()).await?;
            match f.sync_all().await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Unsupported => Ok(()),
                Err(e) => Err(e),
            }
        }
        .await;
        match result {
            Ok(()) => {
                self.on_path_changed(path);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(FsError::from_io(path, &e, true)),
        }
    }

    pub async fn append_text(&self, path: &Path, s: &str) -> Result<(), FsError> {
        self.ensure_parent_dir(path).await?;
        retrying(path, true, || async {
            use tokio::io::AsyncWriteExt;
            let mut f = tokio::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .await?;
            f.write_all(s.as_bytes()).await
        })
        .await
    }

    /// Create missing parent directories. Safe under races: concurrent
    /// creators both succeed.
    pub async fn ensure_parent_dir(&self, path: &Path) -> Result<(), FsError> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        if parent.as_os_str().is_empty() {
            return Ok(());
        }
        if self.dir_cache.get(&parent.to_path_buf()) == Some(true) {
            return Ok(());
        }
        retrying(parent, true, || tokio::fs::create_dir_all(parent)).await?;
        self.dir_cache.insert(parent.to_path_buf(), true);
        Ok(())
    }

    pub async fn stat(&self, path: &Path) -> Result<SourceStat, FsError> {
        let meta = retrying(path, false, || tokio::fs::metadata(path)).await?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(SourceStat {
            mtime,
            size: meta.len(),
        })
    }

    pub async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    pub async fn list_dir(&self, path: &Path) -> Result<DirListing, FsError> {
        let mut rd = retrying(path, false, || tokio::fs::read_dir(path)).await?;
        let mut listing = DirListing::default();
        loop {
            let entry = match rd.next_entry().await {
                Ok(Some(e)) => e,
                Ok(None) => break,
                Err(e) => return Err(FsError::from_io(path, &e, false)),
            };
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if is_dir {
                listing.folders.push(entry.path());
            } else {
                listing.files.push(entry.path());
            }
        }
        Ok(listing)
    }

    pub async fn rename(&self, src: &Path, dst: &Path) -> Result<(), FsError> {
        self.ensure_parent_dir(dst).await?;
        retrying(src, true, || tokio::fs::rename(src, dst)).await?;
        self.on_path_changed(src);
        self.on_path_changed(dst);
        Ok(())
    }

    pub async fn remove_file(&self, path: &Path) -> Result<(), FsError> {
        retrying(path, true, || tokio::fs::remove_file(path)).await?;
        self.on_path_changed(path);
        Ok(())
    }

    /// Enumerate files under `root` whose extension matches `exts`
    /// (lowercase, without dot). Results are cached per
    /// `(root, exts, recursive)` until a change notification arrives for a
    /// path under `root`. Dot-prefixed entries are skipped.
    pub async fn walk(
        &self,
        root: &Path,
        exts: &[&str],
        recursive: bool,
        cancel: &CancelToken,
    ) -> Result<Arc<Vec<PathBuf>>, AppError> {
        let key: WalkKey = (root.to_path_buf(), exts.join(","), recursive);
        let root = root.to_path_buf();
        let exts: Vec<String> = exts.iter().map(|e| e.to_lowercase()).collect();
        let cancel = cancel.clone();
        self.walk_cache
            .get_or_load(key, || async move {
                let mut out = Vec::new();
                let mut stack = vec![root.clone()];
                while let Some(dir) = stack.pop() {
                    cancel.check()?;
                    let mut rd = match tokio::fs::read_dir(&dir).await {
                        Ok(rd) => rd,
                        // A vanished (or not-yet-created) directory is an
                        // empty listing, not a failure.
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(AppError::from(FsError::from_io(&dir, &e, false))),
                    };
                    while let Ok(Some(entry)) = rd.next_entry().await {
                        cancel.check()?;
                        let name = entry.file_name();
                        if name.to_string_lossy().starts_with('.') {
                            continue;
                        }
                        let path = entry.path();
                        let is_dir = entry
                            .file_type()
                            .await
                            .map(|t| t.is_dir())
                            .unwrap_or(false);
                        if is_dir {
                            if recursive {
                                stack.push(path);
                            }
                        } else if path
                            .extension()
                            .and_then(|e| e.to_str())
                            .map(|e| exts.iter().any(|want| want == &e.to_lowercase()))
                            .unwrap_or(false)
                        {
                            out.push(path);
                        }
                    }
                }
                out.sort();
                tracing::debug!(root = %root.display(), count = out.len(), "walk complete");
                Ok(Arc::new(out))
            })
            .await
    }

    /// Invalidate cached listings affected by a create/delete/rename at
    /// `path`. Embedders wire their change notifications here.
    pub fn on_path_changed(&self, path: &Path) {
        self.walk_cache.retain(|(root, _, _)| !path.starts_with(root));
        self.dir_cache
            .retain(|dir| !(dir == path || path.starts_with(dir)));
    }
}
