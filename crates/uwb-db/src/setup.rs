//! Database setup and forward-only schema evolution.
//!
//! On startup the existing `build_jobs` columns are inspected; any expected
//! column that is missing is appended with its declared default. Columns are
//! never dropped or renamed, so older rows keep working across upgrades. The
//! `build_signature` index is created together with that column.

use anyhow::Result;
use sqlx::{Row, SqlitePool, sqlite::SqliteConnectOptions};
use std::collections::HashSet;
use std::path::Path;

/// Open (creating if missing) the SQLite database and ensure the schema.
pub async fn setup_database(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let pool = SqlitePool::connect_with(
        SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true),
    )
    .await?;

    create_schema(&pool).await?;
    evolve_schema(&pool).await?;

    Ok(pool)
}

/// Fresh in-memory database with the full production schema, for tests.
#[cfg(any(test, feature = "test-utils"))]
pub async fn setup_test_database() -> Result<SqlitePool> {
    let pool = SqlitePool::connect("sqlite::memory:").await?;
    create_schema(&pool).await?;
    evolve_schema(&pool).await?;
    Ok(pool)
}

/// Expected `build_jobs` columns (beyond the base CREATE TABLE) with the
/// ALTER statement that introduces each. Order matters only for readability.
const JOB_COLUMN_MIGRATIONS: &[(&str, &str)] = &[
    (
        "source_commit",
        "ALTER TABLE build_jobs ADD COLUMN source_commit TEXT DEFAULT 'unknown'",
    ),
    ("source_firmware", "ALTER TABLE build_jobs ADD COLUMN source_firmware TEXT"),
    ("target_firmware", "ALTER TABLE build_jobs ADD COLUMN target_firmware TEXT"),
    ("version_major", "ALTER TABLE build_jobs ADD COLUMN version_major INTEGER"),
    ("version_minor", "ALTER TABLE build_jobs ADD COLUMN version_minor INTEGER"),
    ("version_patch", "ALTER TABLE build_jobs ADD COLUMN version_patch INTEGER"),
    ("version_suffix", "ALTER TABLE build_jobs ADD COLUMN version_suffix TEXT"),
    ("build_signature", "ALTER TABLE build_jobs ADD COLUMN build_signature TEXT"),
    ("process_pid", "ALTER TABLE build_jobs ADD COLUMN process_pid INTEGER"),
    (
        "job_kind",
        "ALTER TABLE build_jobs ADD COLUMN job_kind TEXT DEFAULT 'build'",
    ),
    ("operation_name", "ALTER TABLE build_jobs ADD COLUMN operation_name TEXT"),
    (
        "reused_from_job_id",
        "ALTER TABLE build_jobs ADD COLUMN reused_from_job_id TEXT",
    ),
    (
        "extra_mods_archive_path",
        "ALTER TABLE build_jobs ADD COLUMN extra_mods_archive_path TEXT",
    ),
    (
        "extra_mods_modules_json",
        "ALTER TABLE build_jobs ADD COLUMN extra_mods_modules_json TEXT",
    ),
    (
        "mods_disabled_json",
        "ALTER TABLE build_jobs ADD COLUMN mods_disabled_json TEXT",
    ),
    (
        "debloat_disabled_json",
        "ALTER TABLE build_jobs ADD COLUMN debloat_disabled_json TEXT",
    ),
    (
        "debloat_add_system_json",
        "ALTER TABLE build_jobs ADD COLUMN debloat_add_system_json TEXT",
    ),
    (
        "debloat_add_product_json",
        "ALTER TABLE build_jobs ADD COLUMN debloat_add_product_json TEXT",
    ),
    (
        "ff_overrides_json",
        "ALTER TABLE build_jobs ADD COLUMN ff_overrides_json TEXT",
    ),
];

/// Create the base tables. Safe to call repeatedly (IF NOT EXISTS).
async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS build_jobs (
            id TEXT PRIMARY KEY NOT NULL,
            target TEXT NOT NULL,
            force INTEGER NOT NULL DEFAULT 0,
            no_rom_zip INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'queued',
            queue_job_id TEXT,
            return_code INTEGER,
            error TEXT,
            log_path TEXT,
            artifact_path TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS ix_build_jobs_status ON build_jobs (status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS ix_build_jobs_created_at ON build_jobs (created_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS app_settings (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Append any expected column that the live table is missing.
async fn evolve_schema(pool: &SqlitePool) -> Result<()> {
    let rows = sqlx::query("SELECT name FROM pragma_table_info('build_jobs')")
        .fetch_all(pool)
        .await?;
    let existing: HashSet<String> = rows
        .iter()
        .filter_map(|row| row.try_get::<String, _>("name").ok())
        .collect();

    let mut added_signature = false;
    for (column, statement) in JOB_COLUMN_MIGRATIONS {
        if existing.contains(*column) {
            continue;
        }
        tracing::debug!(column, "adding missing build_jobs column");
        sqlx::query(statement).execute(pool).await?;
        if *column == "build_signature" {
            added_signature = true;
        }
    }

    if added_signature {
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_build_jobs_build_signature ON build_jobs (build_signature)",
        )
        .execute(pool)
        .await?;
    }

    Ok(())
}
