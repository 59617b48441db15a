//! Persistent index of books, note instances, and import-source state
//!
//! SQLite via sqlx with WAL mode. The store runs a three-state machine:
//!
//! - `persistent` — the normal case, backed by `index.db`
//! - `in_memory` — persistent open or validation failed; schema applied to a
//!   memory database and a background rebuild repopulates it from the
//!   managed notes folder
//! - `unavailable` — even the memory fallback failed; queries return empty
//!   and writes are dropped, consumers degrade to full scans
//!
//! All writes go through a single write gate; reads run in parallel with
//! each other and with writes, observing the last committed transaction.
//! Persistence is debounced: writes mark the store dirty and `flush`
//! checkpoints the WAL (forced on shutdown).

mod legacy;
mod migrations;
mod rebuild;

pub use legacy::{read_state, StateEnvelope};
pub use rebuild::{rebuild_from_notes, ProgressObserver, RebuildPhase, RebuildProgress};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::error::AppError;
use crate::fs::AtomicFs;
use crate::model::{BookRow, ImportSourceRecord, NoteInstance, SourceStat};
use crate::ports::Clock;

/// Current schema version, stamped into `PRAGMA user_version`.
pub const CURRENT_USER_VERSION: i32 = 2;

/// Minimum interval between non-forced WAL checkpoints.
const FLUSH_DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Persistent,
    InMemory,
    Unavailable,
}

pub struct IndexStore {
    db_path: PathBuf,
    data_dir: PathBuf,
    fs: Arc<AtomicFs>,
    clock: Arc<dyn Clock>,
    pool: tokio::sync::RwLock<Option<SqlitePool>>,
    state: StdMutex<IndexState>,
    write_gate: tokio::sync::Mutex<()>,
    dirty: AtomicBool,
    last_flush: StdMutex<Option<Instant>>,
    rebuild_phase: StdMutex<RebuildPhase>,
}

/// Split schema text into executable statements, keeping trigger bodies
/// (which contain interior semicolons) intact.
fn schema_statements(schema: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut buf = String::new();
    for piece in schema.split(';') {
        if !buf.is_empty() {
            buf.push(';');
        }
        buf.push_str(piece);
        let upper = buf.to_uppercase();
        if upper.contains("CREATE TRIGGER") && !upper.trim_end().ends_with("END") {
            continue;
        }
        let cleaned: String = buf
            .lines()
            .filter(|line| {
                let t = line.trim();
                !t.is_empty() && !t.starts_with("--")
            })
            .collect::<Vec<_>>()
            .join("\n");
        if !cleaned.trim().is_empty() {
            statements.push(cleaned);
        }
        buf.clear();
    }
    statements
}

async fn apply_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in schema_statements(include_str!("schema.sql")) {
        sqlx::query(&statement).execute(pool).await?;
    }
    Ok(())
}

impl IndexStore {
    /// Open the index, falling back along the state machine. Never fails:
    /// the worst case is an unavailable store that answers queries with
    /// empty results.
    pub async fn open(data_dir: &Path, fs: Arc<AtomicFs>, clock: Arc<dyn Clock>) -> Arc<Self> {
        let db_path = data_dir.join("index.db");
        let store = Arc::new(Self {
            db_path: db_path.clone(),
            data_dir: data_dir.to_path_buf(),
            fs,
            clock,
            pool: tokio::sync::RwLock::new(None),
            state: StdMutex::new(IndexState::Unavailable),
            write_gate: tokio::sync::Mutex::new(()),
            dirty: AtomicBool::new(false),
            last_flush: StdMutex::new(None),
            rebuild_phase: StdMutex::new(RebuildPhase::Idle),
        });

        match store.open_persistent().await {
            Ok(pool) => {
                *store.pool.write().await = Some(pool);
                store.set_state(IndexState::Persistent);
                tracing::info!(path = %db_path.display(), "index database connected");
            }
            Err(e) => {
                tracing::warn!(error = %e, "{}", e.user_message());
                match Self::open_memory().await {
                    Ok(pool) => {
                        *store.pool.write().await = Some(pool);
                        store.set_state(IndexState::InMemory);
                        tracing::info!("index running in memory; background rebuild required");
                    }
                    Err(e2) => {
                        tracing::error!(error = %e2, "in-memory index failed; lookups disabled");
                        store.set_state(IndexState::Unavailable);
                    }
                }
            }
        }

        if store.state() != IndexState::Unavailable {
            match legacy::migrate_legacy_json(&store).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(migrated = n, "legacy JSON index migrated"),
                Err(e) => tracing::warn!(error = %e, "legacy JSON index migration failed"),
            }
        }

        store
    }

    async fn open_persistent(&self) -> Result<SqlitePool, AppError> {
        self.fs
            .ensure_parent_dir(&self.db_path)
            .await
            .map_err(|e| AppError::DbOpenFailed {
                path: self.db_path.clone(),
                cause: e.to_string(),
            })?;

        // Forward slashes for URL compatibility (backslashes break on Windows).
        let path_str = self.db_path.to_string_lossy().replace('\\', "/");
        let db_url = format!("sqlite://{path_str}?mode=rwc");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .idle_timeout(Duration::from_secs(300))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    // Foreign keys are off by default; the GC trigger and
                    // cascade need them on.
                    sqlx::query("PRAGMA foreign_keys = ON")
                        .execute(&mut *conn)
                        .await?;
                    // WAL: concurrent reads, single writer.
                    sqlx::query("PRAGMA journal_mode = WAL")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA busy_timeout = 5000")
                        .execute(&mut *conn)
                        .await?;
                    // NORMAL sync is safe with WAL.
                    sqlx::query("PRAGMA synchronous = NORMAL")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&db_url)
            .await
            .map_err(|e| AppError::DbOpenFailed {
                path: self.db_path.clone(),
                cause: e.to_string(),
            })?;

        // Quick integrity check before trusting the file.
        let check: (String,) = sqlx::query_as("PRAGMA quick_check")
            .fetch_one(&pool)
            .await
            .map_err(|e| AppError::DbValidateFailed {
                path: self.db_path.clone(),
                cause: e.to_string(),
            })?;
        if check.0 != "ok" {
            return Err(AppError::DbValidateFailed {
                path: self.db_path.clone(),
                cause: check.0,
            });
        }

        let (version,): (i64,) = sqlx::query_as("PRAGMA user_version")
            .fetch_one(&pool)
            .await
            .map_err(|e| AppError::DbValidateFailed {
                path: self.db_path.clone(),
                cause: e.to_string(),
            })?;
        let version = version as i32;

        if version > CURRENT_USER_VERSION {
            return Err(AppError::DbValidateFailed {
                path: self.db_path.clone(),
                cause: format!(
                    "schema v{version} is newer than supported v{CURRENT_USER_VERSION}"
                ),
            });
        }
        if version == 0 {
            // Fresh file (or pre-versioning): apply the full schema.
            apply_schema(&pool)
                .await
                .map_err(|e| AppError::DbOpenFailed {
                    path: self.db_path.clone(),
                    cause: e.to_string(),
                })?;
            sqlx::query(&format!("PRAGMA user_version = {CURRENT_USER_VERSION}"))
                .execute(&pool)
                .await
                .map_err(|e| AppError::DbOpenFailed {
                    path: self.db_path.clone(),
                    cause: e.to_string(),
                })?;
        } else if version < CURRENT_USER_VERSION {
            migrations::migrate(&pool, version, CURRENT_USER_VERSION).await?;
        }

        Ok(pool)
    }

    async fn open_memory() -> Result<SqlitePool, AppError> {
        // One connection: each SQLite memory connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| AppError::DbOpenFailed {
                path: PathBuf::from(":memory:"),
                cause: e.to_string(),
            })?;
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await
            .map_err(|e| AppError::DbOpenFailed {
                path: PathBuf::from(":memory:"),
                cause: e.to_string(),
            })?;
        apply_schema(&pool)
            .await
            .map_err(|e| AppError::DbOpenFailed {
                path: PathBuf::from(":memory:"),
                cause: e.to_string(),
            })?;
        Ok(pool)
    }

    fn set_state(&self, state: IndexState) {
        *self.state.lock().expect("index state mutex poisoned") = state;
    }

    pub fn state(&self) -> IndexState {
        *self.state.lock().expect("index state mutex poisoned")
    }

    pub fn is_unavailable(&self) -> bool {
        self.state() == IndexState::Unavailable
    }

    pub(crate) fn rebuild_phase(&self) -> RebuildPhase {
        *self
            .rebuild_phase
            .lock()
            .expect("rebuild phase mutex poisoned")
    }

    pub(crate) fn set_rebuild_phase(&self, phase: RebuildPhase) {
        *self
            .rebuild_phase
            .lock()
            .expect("rebuild phase mutex poisoned") = phase;
    }

    async fn read_pool(&self) -> Option<SqlitePool> {
        self.pool.read().await.clone()
    }

    fn persist_err(&self, e: sqlx::Error) -> AppError {
        AppError::DbPersistFailed {
            path: self.db_path.clone(),
            cause: e.to_string(),
        }
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Re-probe the persistent backend after a startup fallback. Returns
    /// true when the store is now persistent.
    pub async fn force_recheck_capabilities(&self) -> bool {
        if self.state() == IndexState::Persistent {
            return true;
        }
        match self.open_persistent().await {
            Ok(pool) => {
                *self.pool.write().await = Some(pool);
                self.set_state(IndexState::Persistent);
                self.set_rebuild_phase(RebuildPhase::Idle);
                tracing::info!("persistent index recovered");
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "persistent index still unavailable");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries (parallel; empty results when degraded)
    // ------------------------------------------------------------------

    /// Note instances registered for `book_key`.
    pub async fn find_instances(&self, book_key: &str) -> Result<Vec<NoteInstance>, AppError> {
        let Some(pool) = self.read_pool().await else {
            return Ok(Vec::new());
        };
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT vault_path FROM note_instances WHERE book_key = ?1")
                .bind(book_key)
                .fetch_all(&pool)
                .await
                .map_err(|e| self.persist_err(e))?;
        Ok(rows
            .into_iter()
            .map(|(vault_path,)| NoteInstance {
                book_key: book_key.to_string(),
                vault_path,
            })
            .collect())
    }

    pub async fn get_book(&self, key: &str) -> Result<Option<BookRow>, AppError> {
        let Some(pool) = self.read_pool().await else {
            return Ok(None);
        };
        let row: Option<(String, String, String)> =
            sqlx::query_as("SELECT key, title, authors FROM books WHERE key = ?1")
                .bind(key)
                .fetch_optional(&pool)
                .await
                .map_err(|e| self.persist_err(e))?;
        Ok(row.map(|(key, title, authors)| BookRow {
            key,
            title,
            authors,
        }))
    }

    pub async fn get_source_record(
        &self,
        source_path: &str,
    ) -> Result<Option<ImportSourceRecord>, AppError> {
        let Some(pool) = self.read_pool().await else {
            return Ok(None);
        };
        type Row = (
            String,
            Option<i64>,
            Option<i64>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
        );
        let row: Option<Row> = sqlx::query_as(
            "SELECT source_path, last_processed_mtime, last_processed_size,
                    newest_annotation_ts, last_success_ts, last_error, book_key, md5
             FROM import_sources WHERE source_path = ?1",
        )
        .bind(source_path)
        .fetch_optional(&pool)
        .await
        .map_err(|e| self.persist_err(e))?;
        Ok(row.map(
            |(source_path, mtime, size, newest, success, error, book_key, md5)| {
                ImportSourceRecord {
                    source_path,
                    last_processed_mtime: mtime,
                    last_processed_size: size,
                    newest_annotation_ts: newest,
                    last_success_ts: success,
                    last_error: error,
                    book_key,
                    md5,
                }
            },
        ))
    }

    /// `(books, note instances, import sources)` row counts, for status
    /// reporting.
    pub async fn counts(&self) -> Result<(u64, u64, u64), AppError> {
        let Some(pool) = self.read_pool().await else {
            return Ok((0, 0, 0));
        };
        let (books,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM books")
            .fetch_one(&pool)
            .await
            .map_err(|e| self.persist_err(e))?;
        let (instances,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM note_instances")
            .fetch_one(&pool)
            .await
            .map_err(|e| self.persist_err(e))?;
        let (sources,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM import_sources")
            .fetch_one(&pool)
            .await
            .map_err(|e| self.persist_err(e))?;
        Ok((books as u64, instances as u64, sources as u64))
    }

    // ------------------------------------------------------------------
    // Writes (serialized behind the write gate; one transaction per call)
    // ------------------------------------------------------------------

    /// Register `vault_path` as an instance of `book`, creating the book
    /// row as needed.
    pub async fn upsert_instance(&self, book: &BookRow, vault_path: &str) -> Result<(), AppError> {
        let row = (book.clone(), vault_path.to_string());
        self.upsert_instances(std::slice::from_ref(&row)).await
    }

    /// Batched upsert, one transaction. Used by the background rebuild.
    pub async fn upsert_instances(&self, rows: &[(BookRow, String)]) -> Result<(), AppError> {
        let Some(pool) = self.read_pool().await else {
            tracing::debug!("index unavailable; dropping instance upsert");
            return Ok(());
        };
        let _gate = self.write_gate.lock().await;
        let mut tx = pool.begin().await.map_err(|e| self.persist_err(e))?;
        for (book, vault_path) in rows {
            sqlx::query(
                "INSERT INTO books (key, title, authors) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET title = excluded.title, authors = excluded.authors",
            )
            .bind(&book.key)
            .bind(&book.title)
            .bind(&book.authors)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.persist_err(e))?;
            sqlx::query(
                "INSERT INTO note_instances (book_key, vault_path) VALUES (?1, ?2)
                 ON CONFLICT(vault_path) DO UPDATE SET book_key = excluded.book_key",
            )
            .bind(&book.key)
            .bind(vault_path)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.persist_err(e))?;
        }
        tx.commit().await.map_err(|e| self.persist_err(e))?;
        self.mark_dirty();
        Ok(())
    }

    /// A note was renamed: move its instance row.
    pub async fn rename_instance(&self, old_path: &str, new_path: &str) -> Result<(), AppError> {
        let Some(pool) = self.read_pool().await else {
            return Ok(());
        };
        let _gate = self.write_gate.lock().await;
        sqlx::query("UPDATE OR REPLACE note_instances SET vault_path = ?2 WHERE vault_path = ?1")
            .bind(old_path)
            .bind(new_path)
            .execute(&pool)
            .await
            .map_err(|e| self.persist_err(e))?;
        self.mark_dirty();
        Ok(())
    }

    /// Delete instance rows; books left with zero instances are collected
    /// by the schema trigger.
    pub async fn delete_instances(&self, vault_paths: &[String]) -> Result<(), AppError> {
        if vault_paths.is_empty() {
            return Ok(());
        }
        let Some(pool) = self.read_pool().await else {
            return Ok(());
        };
        let _gate = self.write_gate.lock().await;
        let mut tx = pool.begin().await.map_err(|e| self.persist_err(e))?;
        for path in vault_paths {
            sqlx::query("DELETE FROM note_instances WHERE vault_path = ?1")
                .bind(path)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.persist_err(e))?;
        }
        tx.commit().await.map_err(|e| self.persist_err(e))?;
        self.mark_dirty();
        Ok(())
    }

    /// Record a successful import of `source_path`.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_import_success(
        &self,
        source_path: &str,
        book_key: Option<&str>,
        md5: Option<&str>,
        stat: Option<&SourceStat>,
        newest_annotation_ts: Option<&str>,
    ) -> Result<(), AppError> {
        let Some(pool) = self.read_pool().await else {
            return Ok(());
        };
        let now = self.clock.now_rfc3339();
        let _gate = self.write_gate.lock().await;
        sqlx::query(
            "INSERT INTO import_sources
                 (source_path, last_processed_mtime, last_processed_size,
                  newest_annotation_ts, last_success_ts, last_error, book_key, md5)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7)
             ON CONFLICT(source_path) DO UPDATE SET
                 last_processed_mtime = excluded.last_processed_mtime,
                 last_processed_size = excluded.last_processed_size,
                 newest_annotation_ts = excluded.newest_annotation_ts,
                 last_success_ts = excluded.last_success_ts,
                 last_error = NULL,
                 book_key = excluded.book_key,
                 md5 = excluded.md5",
        )
        .bind(source_path)
        .bind(stat.map(|s| s.mtime))
        .bind(stat.map(|s| s.size as i64))
        .bind(newest_annotation_ts)
        .bind(&now)
        .bind(book_key)
        .bind(md5)
        .execute(&pool)
        .await
        .map_err(|e| self.persist_err(e))?;
        self.mark_dirty();
        Ok(())
    }

    /// Record a failed import; the error clears on the next success.
    pub async fn record_import_failure(
        &self,
        source_path: &str,
        error: &str,
    ) -> Result<(), AppError> {
        let Some(pool) = self.read_pool().await else {
            return Ok(());
        };
        let _gate = self.write_gate.lock().await;
        sqlx::query(
            "INSERT INTO import_sources (source_path, last_error) VALUES (?1, ?2)
             ON CONFLICT(source_path) DO UPDATE SET last_error = excluded.last_error",
        )
        .bind(source_path)
        .bind(error)
        .execute(&pool)
        .await
        .map_err(|e| self.persist_err(e))?;
        self.mark_dirty();
        Ok(())
    }

    /// Forget all import-source state; every source re-processes next run.
    pub async fn reset_import_status(&self) -> Result<(), AppError> {
        let Some(pool) = self.read_pool().await else {
            return Ok(());
        };
        let _gate = self.write_gate.lock().await;
        sqlx::query("DELETE FROM import_sources")
            .execute(&pool)
            .await
            .map_err(|e| self.persist_err(e))?;
        self.mark_dirty();
        Ok(())
    }

    /// Debounced persistence: checkpoint the WAL and refresh `state.json`.
    /// `force` bypasses the debounce (shutdown path).
    pub async fn flush(&self, force: bool) -> Result<(), AppError> {
        if !force {
            if !self.dirty.load(Ordering::Acquire) {
                return Ok(());
            }
            let last = *self.last_flush.lock().expect("flush mutex poisoned");
            if let Some(at) = last {
                if at.elapsed() < FLUSH_DEBOUNCE {
                    return Ok(());
                }
            }
        }

        if self.state() == IndexState::Persistent {
            if let Some(pool) = self.read_pool().await {
                sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                    .execute(&pool)
                    .await
                    .map_err(|e| self.persist_err(e))?;
                tracing::debug!("WAL checkpoint completed");
            }
        }
        legacy::write_state(&self.fs, &self.data_dir, self.clock.as_ref()).await?;

        self.dirty.store(false, Ordering::Release);
        *self.last_flush.lock().expect("flush mutex poisoned") = Some(Instant::now());
        Ok(())
    }

    pub(crate) fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub(crate) fn fs(&self) -> &AtomicFs {
        &self.fs
    }
}

/// Decide whether a source file needs re-processing.
pub fn should_process(
    existing: Option<&ImportSourceRecord>,
    new_stat: &SourceStat,
    new_newest_ts: Option<&str>,
    new_md5: Option<&str>,
) -> bool {
    fn newer(new_ts: Option<&str>, old_ts: Option<&str>) -> bool {
        match (new_ts, old_ts) {
            // RFC-3339 orders lexicographically.
            (Some(n), Some(o)) => n > o,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    let Some(record) = existing else {
        return true;
    };
    if record.last_error.is_some() || record.last_success_ts.is_none() {
        return true;
    }
    if let (Some(old_md5), Some(new_md5)) = (record.md5.as_deref(), new_md5) {
        if old_md5 != new_md5 {
            return true;
        }
        return newer(new_newest_ts, record.newest_annotation_ts.as_deref());
    }
    if record.last_processed_mtime != Some(new_stat.mtime)
        || record.last_processed_size != Some(new_stat.size as i64)
    {
        return true;
    }
    newer(new_newest_ts, record.newest_annotation_ts.as_deref())
}
