//! SQLite Persistence Gateway
//!
//! A finalized session is written in one transaction: batch check, summary
//! row, round rows, sample rows. Either all of it lands or none of it does.

use super::PersistenceGateway;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info, warn};
use zptess_common::db::{
    parse_timestamp, CalibrationRecord, Channel, ChannelStats, Photometer, PhotometerInfo, Round,
    Sample, Summary, SummaryState,
};

/// Timestamp column encoding
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

#[derive(Clone)]
pub struct SqliteGateway {
    pool: SqlitePool,
}

impl SqliteGateway {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or refresh a photometer, keyed by (name, mac)
    pub async fn register_photometer(&self, info: &PhotometerInfo) -> Result<Photometer> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO photometer_t (name, mac, model, freq_offset)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (name, mac) DO UPDATE SET
                model = excluded.model,
                freq_offset = excluded.freq_offset
            RETURNING id
            "#,
        )
        .bind(&info.name)
        .bind(&info.mac)
        .bind(&info.model)
        .bind(info.freq_offset)
        .fetch_one(&self.pool)
        .await?;

        debug!(photometer_id = id, name = %info.name, mac = %info.mac, "Registered photometer");

        Ok(Photometer {
            id,
            name: info.name.clone(),
            mac: info.mac.clone(),
            model: info.model.clone(),
            freq_offset: info.freq_offset,
        })
    }

    /// Set or clear the operator annotation on a stored summary
    pub async fn annotate_summary(&self, summary_id: i64, annotation: Option<&str>) -> Result<()> {
        let result = sqlx::query("UPDATE summary_t SET annotation = ? WHERE id = ?")
            .bind(annotation)
            .bind(summary_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(zptess_common::Error::NotFound(format!("summary {}", summary_id)).into());
        }
        info!(summary_id, "Summary annotated");
        Ok(())
    }

    pub async fn load_summary(&self, summary_id: i64) -> Result<Option<Summary>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SUMMARY_SELECT))
            .bind(summary_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(summary_from_row).transpose()
    }

    /// Summaries stored for a batch, oldest first
    pub async fn summaries_for_batch(&self, batch_id: i64) -> Result<Vec<Summary>> {
        let rows = sqlx::query(&format!(
            "{} WHERE batch_id = ? ORDER BY session_id, id",
            SUMMARY_SELECT
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(summary_from_row).collect()
    }

    /// Rounds of a summary in index order, each with its samples
    pub async fn load_rounds(&self, summary_id: i64) -> Result<Vec<Round>> {
        let rows = sqlx::query(
            r#"
            SELECT id, round_index, window_start, window_end,
                   ref_mean, ref_stddev, ref_n, ref_freq,
                   test_mean, test_stddev, test_n, test_freq,
                   round_zero_point, accepted
            FROM rounds_t WHERE summary_id = ? ORDER BY round_index
            "#,
        )
        .bind(summary_id)
        .fetch_all(&self.pool)
        .await?;

        let mut rounds = Vec::with_capacity(rows.len());
        for row in rows {
            let round_id: i64 = row.get("id");
            let samples = self.load_samples(round_id).await?;
            rounds.push(Round {
                index: row.get::<i64, _>("round_index") as usize,
                window_start: parse_timestamp(&row.get::<String, _>("window_start"))?,
                window_end: parse_timestamp(&row.get::<String, _>("window_end"))?,
                ref_stats: ChannelStats {
                    mean: row.get("ref_mean"),
                    stddev: row.get("ref_stddev"),
                    n: row.get::<i64, _>("ref_n") as usize,
                    frequency: row.get("ref_freq"),
                },
                test_stats: ChannelStats {
                    mean: row.get("test_mean"),
                    stddev: row.get("test_stddev"),
                    n: row.get::<i64, _>("test_n") as usize,
                    frequency: row.get("test_freq"),
                },
                round_zero_point: row.get("round_zero_point"),
                accepted: row.get("accepted"),
                samples,
            });
        }
        Ok(rounds)
    }

    /// Summary with nested rounds and samples
    pub async fn load_record(&self, summary_id: i64) -> Result<Option<CalibrationRecord>> {
        let Some(summary) = self.load_summary(summary_id).await? else {
            return Ok(None);
        };
        let rounds = self.load_rounds(summary_id).await?;
        Ok(Some(CalibrationRecord { summary, rounds }))
    }

    async fn load_samples(&self, round_id: i64) -> Result<Vec<Sample>> {
        let rows = sqlx::query(
            r#"
            SELECT channel, sequence_no, tstamp, frequency, magnitude
            FROM samples_t WHERE round_id = ?
            ORDER BY CASE channel WHEN 'ref' THEN 0 ELSE 1 END, sequence_no
            "#,
        )
        .bind(round_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Sample> {
                let channel: String = row.get("channel");
                Ok(Sample {
                    channel: Channel::from_str(&channel).ok_or_else(|| {
                        zptess_common::Error::Internal(format!("unknown channel '{}'", channel))
                    })?,
                    sequence_no: row.get::<i64, _>("sequence_no") as u64,
                    timestamp: parse_timestamp(&row.get::<String, _>("tstamp"))?,
                    frequency: row.get("frequency"),
                    magnitude: row.get::<Option<f64>, _>("magnitude").unwrap_or(f64::NAN),
                })
            })
            .collect()
    }
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn append_summary(&self, record: &CalibrationRecord, batch_version: i64) -> Result<i64> {
        let summary = &record.summary;
        let batch_id = summary.batch_id.ok_or_else(|| {
            Error::PreconditionViolation("summary has no target batch".to_string())
        })?;
        if summary.state != SummaryState::Finalized {
            return Err(Error::PreconditionViolation(
                "only finalized summaries are persisted".to_string(),
            ));
        }

        // The first statement writes, so the transaction never upgrades a
        // stale WAL read snapshot
        let mut tx = self.pool.begin().await?;

        let bumped = sqlx::query(
            r#"
            UPDATE batch_t SET calibration_count = calibration_count + ?
            WHERE id = ? AND version = ? AND status = 'open'
            "#,
        )
        .bind(summary.convergence_flag as i64)
        .bind(batch_id)
        .bind(batch_version)
        .execute(&mut *tx)
        .await?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM summary_t WHERE session_id = ? AND photometer_id = ?",
        )
        .bind(ts(&summary.session_id))
        .bind(summary.photometer_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(id) = existing {
            tx.rollback().await?;
            debug!(summary_id = id, "Summary already stored");
            return Ok(id);
        }

        if bumped.rows_affected() == 0 {
            let reason = conflict_reason(&mut tx, batch_id, batch_version).await?;
            tx.rollback().await?;
            warn!(batch_id, %reason, "Batch changed during session");
            return Err(Error::PersistenceConflict { batch_id, reason });
        }

        let summary_id = insert_summary(&mut tx, summary, batch_id).await?;
        for round in &record.rounds {
            let round_id = insert_round(&mut tx, summary_id, round).await?;
            for sample in &round.samples {
                insert_sample(&mut tx, round_id, sample).await?;
            }
        }

        tx.commit().await?;

        info!(
            summary_id,
            batch_id,
            rounds = record.rounds.len(),
            samples = record.sample_count(),
            "Calibration summary stored"
        );
        Ok(summary_id)
    }
}

async fn conflict_reason(
    tx: &mut Transaction<'_, Sqlite>,
    batch_id: i64,
    expected_version: i64,
) -> Result<String> {
    let row = sqlx::query("SELECT status, version FROM batch_t WHERE id = ?")
        .bind(batch_id)
        .fetch_optional(&mut **tx)
        .await?;

    Ok(match row {
        None => "batch no longer exists".to_string(),
        Some(row) => {
            let status: String = row.get("status");
            let version: i64 = row.get("version");
            if status != "open" {
                format!("batch is {}", status)
            } else {
                format!(
                    "batch version changed (expected {}, found {})",
                    expected_version, version
                )
            }
        }
    })
}

async fn insert_summary(
    tx: &mut Transaction<'_, Sqlite>,
    summary: &Summary,
    batch_id: i64,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO summary_t (
            session_id, photometer_id, reference_id, batch_id,
            final_zero_point, final_stddev, best_zero_point, published_zero_point,
            zp_offset, round_count, convergence_flag, author, annotation
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(ts(&summary.session_id))
    .bind(summary.photometer_id)
    .bind(summary.reference_id)
    .bind(batch_id)
    .bind(summary.final_zero_point)
    .bind(summary.final_stddev)
    .bind(summary.best_zero_point)
    .bind(summary.published_zero_point)
    .bind(summary.zp_offset)
    .bind(summary.round_count as i64)
    .bind(summary.convergence_flag)
    .bind(&summary.author)
    .bind(&summary.annotation)
    .execute(&mut **tx)
    .await?;

    Ok(result.last_insert_rowid())
}

async fn insert_round(tx: &mut Transaction<'_, Sqlite>, summary_id: i64, round: &Round) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO rounds_t (
            summary_id, round_index, window_start, window_end,
            ref_mean, ref_stddev, ref_n, ref_freq,
            test_mean, test_stddev, test_n, test_freq,
            round_zero_point, accepted
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(summary_id)
    .bind(round.index as i64)
    .bind(ts(&round.window_start))
    .bind(ts(&round.window_end))
    .bind(round.ref_stats.mean)
    .bind(round.ref_stats.stddev)
    .bind(round.ref_stats.n as i64)
    .bind(round.ref_stats.frequency)
    .bind(round.test_stats.mean)
    .bind(round.test_stats.stddev)
    .bind(round.test_stats.n as i64)
    .bind(round.test_stats.frequency)
    .bind(round.round_zero_point)
    .bind(round.accepted)
    .execute(&mut **tx)
    .await?;

    Ok(result.last_insert_rowid())
}

async fn insert_sample(tx: &mut Transaction<'_, Sqlite>, round_id: i64, sample: &Sample) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO samples_t (round_id, channel, sequence_no, tstamp, frequency, magnitude)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(round_id)
    .bind(sample.channel.as_str())
    .bind(sample.sequence_no as i64)
    .bind(ts(&sample.timestamp))
    .bind(sample.frequency)
    .bind(sample.magnitude.is_finite().then_some(sample.magnitude))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub(crate) const SUMMARY_SELECT: &str = r#"
    SELECT id, session_id, photometer_id, reference_id, batch_id,
           final_zero_point, final_stddev, best_zero_point, published_zero_point,
           zp_offset, round_count, convergence_flag, author, annotation
    FROM summary_t"#;

/// Map a [`SUMMARY_SELECT`] row; stored summaries are always finalized
pub(crate) fn summary_from_row(row: &SqliteRow) -> Result<Summary> {
    Ok(Summary {
        id: Some(row.get("id")),
        session_id: parse_timestamp(&row.get::<String, _>("session_id"))?,
        photometer_id: row.get("photometer_id"),
        reference_id: row.get("reference_id"),
        batch_id: row.get("batch_id"),
        state: SummaryState::Finalized,
        final_zero_point: row.get("final_zero_point"),
        final_stddev: row.get("final_stddev"),
        best_zero_point: row.get("best_zero_point"),
        published_zero_point: row.get("published_zero_point"),
        zp_offset: row.get("zp_offset"),
        round_count: row.get::<i64, _>("round_count") as usize,
        convergence_flag: row.get("convergence_flag"),
        author: row.get("author"),
        annotation: row.get("annotation"),
    })
}
