//! Legacy JSON index migration and the `state.json` envelope
//!
//! Early releases persisted the index as `import-index.json`. When that file
//! is present and non-empty it is migrated into the SQLite schema on
//! startup and then deleted. `state.json` is the minimal run envelope kept
//! alongside the database.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::fs::AtomicFs;
use crate::model::BookRow;
use crate::ports::Clock;

use super::{IndexStore, CURRENT_USER_VERSION};

const LEGACY_FILE: &str = "import-index.json";
const STATE_FILE: &str = "state.json";

/// Minimal persisted run state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEnvelope {
    pub schema_version: u32,
    pub last_run_at: String,
}

#[derive(Debug, Deserialize)]
struct LegacyBook {
    key: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    authors: String,
    #[serde(default)]
    paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LegacySource {
    #[serde(default)]
    mtime: Option<i64>,
    #[serde(default)]
    size: Option<i64>,
    #[serde(default)]
    newest_annotation_ts: Option<String>,
    /// Present in the legacy format; superseded by the migration timestamp.
    #[serde(default)]
    #[allow(dead_code)]
    last_success_ts: Option<String>,
    #[serde(default)]
    last_error: Option<String>,
    #[serde(default)]
    book_key: Option<String>,
    #[serde(default)]
    md5: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyIndex {
    #[serde(default)]
    books: Vec<LegacyBook>,
    #[serde(default)]
    sources: HashMap<String, LegacySource>,
}

/// Migrate `import-index.json` into the database, deleting the file on
/// success. Returns the number of migrated rows (0 when absent or empty).
pub async fn migrate_legacy_json(index: &IndexStore) -> Result<usize, AppError> {
    let path = index.data_dir().join(LEGACY_FILE);
    let text = match index.fs().read_text(&path).await {
        Ok(t) => t,
        Err(crate::error::FsError::NotFound { .. }) => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    if text.trim().is_empty() {
        let _ = index.fs().remove_file(&path).await;
        return Ok(0);
    }

    let legacy: LegacyIndex = serde_json::from_str(&text).map_err(|e| AppError::ParseFailed {
        kind: crate::error::ParseKind::Yaml,
        message: format!("legacy index is not valid JSON: {e}"),
        context: Some(path.display().to_string()),
    })?;

    let mut migrated = 0usize;

    let rows: Vec<(BookRow, String)> = legacy
        .books
        .iter()
        .flat_map(|b| {
            let row = BookRow {
                key: b.key.clone(),
                title: b.title.clone(),
                authors: b.authors.clone(),
            };
            b.paths
                .iter()
                .map(move |p| (row.clone(), p.clone()))
                .collect::<Vec<_>>()
        })
        .collect();
    if !rows.is_empty() {
        index.upsert_instances(&rows).await?;
        migrated += rows.len();
    }

    for (source_path, src) in &legacy.sources {
        // Preserve historical state as-is; a failure row keeps its error so
        // the next import re-processes it.
        if let Some(error) = &src.last_error {
            index.record_import_failure(source_path, error).await?;
        } else {
            // last_success_ts becomes the migration time; the mtime/size/md5
            // comparison still prevents spurious re-processing.
            index
                .record_import_success(
                    source_path,
                    src.book_key.as_deref(),
                    src.md5.as_deref(),
                    src.mtime
                        .map(|mtime| crate::model::SourceStat {
                            mtime,
                            size: src.size.unwrap_or(0) as u64,
                        })
                        .as_ref(),
                    src.newest_annotation_ts.as_deref(),
                )
                .await?;
        }
        migrated += 1;
    }

    index.fs().remove_file(&path).await?;
    tracing::info!(path = %path.display(), migrated, "legacy index migrated and removed");
    Ok(migrated)
}

/// Rewrite `state.json` with the current schema version and run timestamp.
pub async fn write_state(
    fs: &AtomicFs,
    data_dir: &Path,
    clock: &dyn Clock,
) -> Result<(), AppError> {
    let envelope = StateEnvelope {
        schema_version: CURRENT_USER_VERSION as u32,
        last_run_at: clock.now_rfc3339(),
    };
    let text = serde_json::to_string_pretty(&envelope).expect("envelope serializes");
    fs.write_text_atomic(&data_dir.join(STATE_FILE), &text)
        .await?;
    Ok(())
}

/// Read `state.json` if present.
pub async fn read_state(fs: &AtomicFs, data_dir: &Path) -> Option<StateEnvelope> {
    let text = fs.read_text(&data_dir.join(STATE_FILE)).await.ok()?;
    serde_json::from_str(&text).ok()
}
