//! Schema migrations for the kohl index database
//!
//! When the schema version changes, migrations upgrade existing indexes
//! without a full rebuild. Versions are stamped into `PRAGMA user_version`;
//! each step runs its DDL and the stamp inside one transaction.
//!
//! ## Adding a new migration
//!
//! 1. Increment `CURRENT_USER_VERSION` in `mod.rs`
//! 2. Add `async fn migrate_vN_to_vM(conn) -> Result<()>`
//! 3. Add the case to `run_migration()`
//! 4. Update `schema.sql` with the new schema

use sqlx::SqlitePool;

use crate::error::AppError;

/// Run all migrations from stored version to current version.
pub async fn migrate(pool: &SqlitePool, from: i32, to: i32) -> Result<(), AppError> {
    if from == to {
        return Ok(());
    }
    if from > to {
        return Err(AppError::MigrationFailed {
            message: format!("index schema v{from} is newer than this build supports (v{to})"),
            cause: None,
        });
    }

    tracing::info!(from_version = from, to_version = to, "starting index migration");

    for version in from..to {
        let mut tx = pool.begin().await.map_err(|e| AppError::MigrationFailed {
            message: format!("could not begin migration v{version} -> v{}", version + 1),
            cause: Some(e.to_string()),
        })?;
        run_migration(&mut tx, version, version + 1).await?;
        sqlx::query(&format!("PRAGMA user_version = {}", version + 1))
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::MigrationFailed {
                message: format!("could not stamp user_version {}", version + 1),
                cause: Some(e.to_string()),
            })?;
        tx.commit().await.map_err(|e| AppError::MigrationFailed {
            message: format!("could not commit migration v{version} -> v{}", version + 1),
            cause: Some(e.to_string()),
        })?;
        tracing::info!(from = version, to = version + 1, "migration step complete");
    }

    Ok(())
}

async fn run_migration(
    conn: &mut sqlx::SqliteConnection,
    from: i32,
    to: i32,
) -> Result<(), AppError> {
    match (from, to) {
        (1, 2) => migrate_v1_to_v2(conn).await,
        _ => Err(AppError::MigrationFailed {
            message: format!("no migration path from v{from} to v{to}"),
            cause: None,
        }),
    }
}

// ============================================================================
// Migration functions
// ============================================================================

/// v1 -> v2: add the source content hash column and its lookup index.
///
/// v1 decided re-processing on `(mtime, size)` alone; md5 comparison was
/// added so copied-but-identical sources skip cleanly.
async fn migrate_v1_to_v2(conn: &mut sqlx::SqliteConnection) -> Result<(), AppError> {
    let wrap = |e: sqlx::Error| AppError::MigrationFailed {
        message: "v1 -> v2 failed".into(),
        cause: Some(e.to_string()),
    };
    sqlx::query("ALTER TABLE import_sources ADD COLUMN md5 TEXT")
        .execute(&mut *conn)
        .await
        .map_err(wrap)?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_import_sources_md5 ON import_sources(md5)")
        .execute(&mut *conn)
        .await
        .map_err(wrap)?;
    Ok(())
}
