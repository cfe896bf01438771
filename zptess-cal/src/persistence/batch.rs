//! SQLite Batch Lifecycle
//!
//! Operator bookkeeping for calibration batches. Every mutation of an open
//! batch bumps its `version`, which in-flight sessions check when they
//! append their summary.

use super::sqlite::{summary_from_row, ts, SUMMARY_SELECT};
use super::BatchLifecycle;
use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::info;
use zptess_common::db::{parse_timestamp, Batch, BatchStatus, Summary};

const BATCH_SELECT: &str =
    "SELECT id, opened_at, closed_at, status, calibration_count, version, comment FROM batch_t";

#[derive(Clone)]
pub struct SqliteBatchLifecycle {
    pool: SqlitePool,
}

impl SqliteBatchLifecycle {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a new batch; fails if one is already open
    pub async fn begin(&self, comment: Option<&str>) -> Result<Batch> {
        if let Some(open) = self.current_open_batch().await? {
            return Err(zptess_common::Error::InvalidInput(format!(
                "batch {} opened at {} is still open",
                open.id, open.opened_at
            ))
            .into());
        }

        let opened_at = Utc::now();
        let id = sqlx::query("INSERT INTO batch_t (opened_at, status, comment) VALUES (?, 'open', ?)")
            .bind(ts(&opened_at))
            .bind(comment)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();

        info!(batch_id = id, "Batch opened");
        self.get(id).await?.ok_or_else(|| {
            zptess_common::Error::Internal(format!("batch {} vanished after insert", id)).into()
        })
    }

    /// Close the open batch, recounting its converged summaries
    pub async fn end(&self) -> Result<Batch> {
        let mut tx = self.pool.begin().await?;

        // Closing first takes the write lock before the recount reads
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE batch_t SET status = 'closed', closed_at = ?, version = version + 1
            WHERE status = 'open'
            RETURNING id
            "#,
        )
        .bind(ts(&Utc::now()))
        .fetch_optional(&mut *tx)
        .await?;
        let Some(id) = id else {
            return Err(zptess_common::Error::NotFound("no open batch".to_string()).into());
        };

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM summary_t WHERE batch_id = ? AND convergence_flag = 1",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE batch_t SET calibration_count = ? WHERE id = ?")
            .bind(count)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(batch_id = id, calibration_count = count, "Batch closed");
        self.get(id).await?.ok_or_else(|| {
            zptess_common::Error::Internal(format!("batch {} vanished after close", id)).into()
        })
    }

    /// Delete closed batches with no converged calibrations
    ///
    /// Their remaining summaries become orphans. Returns the number of
    /// batches removed.
    pub async fn purge(&self) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM batch_t WHERE status = 'closed' AND calibration_count = 0")
            .execute(&self.pool)
            .await?
            .rows_affected();

        info!(removed, "Purged empty batches");
        Ok(removed)
    }

    /// Summaries that belong to no batch
    pub async fn orphans(&self) -> Result<Vec<Summary>> {
        let rows = sqlx::query(&format!(
            "{} WHERE batch_id IS NULL ORDER BY session_id, id",
            SUMMARY_SELECT
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(summary_from_row).collect()
    }

    /// All batches, newest first
    pub async fn view(&self) -> Result<Vec<Batch>> {
        let rows = sqlx::query(&format!("{} ORDER BY id DESC", BATCH_SELECT))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(batch_from_row).collect()
    }

    pub async fn get(&self, batch_id: i64) -> Result<Option<Batch>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", BATCH_SELECT))
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(batch_from_row).transpose()
    }
}

#[async_trait]
impl BatchLifecycle for SqliteBatchLifecycle {
    async fn current_open_batch(&self) -> Result<Option<Batch>> {
        let row = sqlx::query(&format!("{} WHERE status = 'open'", BATCH_SELECT))
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(batch_from_row).transpose()
    }

    async fn is_open(&self, batch_id: i64) -> Result<bool> {
        Ok(self.get(batch_id).await?.is_some_and(|b| b.is_open()))
    }
}

fn batch_from_row(row: &SqliteRow) -> Result<Batch> {
    let status: String = row.get("status");
    let closed_at: Option<String> = row.get("closed_at");

    Ok(Batch {
        id: row.get("id"),
        opened_at: parse_timestamp(&row.get::<String, _>("opened_at"))?,
        closed_at: closed_at.as_deref().map(parse_timestamp).transpose()?,
        status: BatchStatus::from_str(&status).ok_or_else(|| {
            zptess_common::Error::Internal(format!("unknown batch status '{}'", status))
        })?,
        calibration_count: row.get("calibration_count"),
        version: row.get("version"),
        comment: row.get("comment"),
    })
}
