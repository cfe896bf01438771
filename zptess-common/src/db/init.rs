//! Database initialization
//!
//! Creates the database file on first run and the calibration tables.
//! All statements are idempotent, so opening an existing database is safe.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Foreign keys and busy timeout are per-connection settings, so they
    // go on the connect options rather than a one-off PRAGMA.
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(5000));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_config_table(&pool).await?;
    create_batch_table(&pool).await?;
    create_photometer_table(&pool).await?;
    create_summary_table(&pool).await?;
    create_rounds_table(&pool).await?;
    create_samples_table(&pool).await?;

    Ok(pool)
}

async fn create_config_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS config_t (
            section TEXT NOT NULL,
            property TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (section, property)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_batch_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS batch_t (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            opened_at TEXT NOT NULL,
            closed_at TEXT,
            status TEXT NOT NULL CHECK (status IN ('open', 'closed')),
            calibration_count INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 0,
            comment TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one open batch
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_batch_single_open ON batch_t(status) WHERE status = 'open'",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_photometer_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS photometer_t (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            mac TEXT NOT NULL,
            model TEXT NOT NULL,
            freq_offset REAL NOT NULL DEFAULT 0.0,
            UNIQUE (name, mac)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_summary_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS summary_t (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            photometer_id INTEGER NOT NULL REFERENCES photometer_t(id),
            reference_id INTEGER NOT NULL REFERENCES photometer_t(id),
            batch_id INTEGER REFERENCES batch_t(id) ON DELETE SET NULL,
            final_zero_point REAL,
            final_stddev REAL,
            best_zero_point REAL,
            published_zero_point REAL,
            zp_offset REAL NOT NULL DEFAULT 0.0,
            round_count INTEGER NOT NULL,
            convergence_flag INTEGER NOT NULL,
            author TEXT,
            annotation TEXT,
            UNIQUE (session_id, photometer_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_summary_batch ON summary_t(batch_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_rounds_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rounds_t (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            summary_id INTEGER NOT NULL REFERENCES summary_t(id) ON DELETE CASCADE,
            round_index INTEGER NOT NULL,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            ref_mean REAL NOT NULL,
            ref_stddev REAL NOT NULL,
            ref_n INTEGER NOT NULL,
            ref_freq REAL NOT NULL,
            test_mean REAL NOT NULL,
            test_stddev REAL NOT NULL,
            test_n INTEGER NOT NULL,
            test_freq REAL NOT NULL,
            round_zero_point REAL NOT NULL,
            accepted INTEGER NOT NULL,
            UNIQUE (summary_id, round_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_samples_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS samples_t (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            round_id INTEGER NOT NULL REFERENCES rounds_t(id) ON DELETE CASCADE,
            channel TEXT NOT NULL CHECK (channel IN ('ref', 'test')),
            sequence_no INTEGER NOT NULL,
            tstamp TEXT NOT NULL,
            frequency REAL NOT NULL,
            magnitude REAL,
            UNIQUE (round_id, channel, sequence_no)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Parse an RFC 3339 timestamp column
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Invalid timestamp '{}': {}", value, e)))
}
