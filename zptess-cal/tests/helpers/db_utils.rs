//! Database Test Utilities
//!
//! Temporary databases, photometer fixtures and ready-made records

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tempfile::TempDir;
use zptess_cal::calibration::stats::channel_stats;
use zptess_cal::calibration::{evaluate, SessionContext};
use zptess_cal::persistence::SqliteGateway;
use zptess_common::config::CalibrationConfig;
use zptess_common::db::{
    init_database, Batch, CalibrationRecord, Channel, Photometer, PhotometerInfo, Round, Sample,
};

/// Create temporary test database with the calibration schema
///
/// Returns (TempDir, SqlitePool) - TempDir must be kept alive for duration of test
pub async fn create_test_db() -> Result<(TempDir, SqlitePool)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test_zptess.db");
    let pool = init_database(&db_path).await?;
    Ok((temp_dir, pool))
}

/// Register a reference and a test photometer, returned in that order
pub async fn register_pair(gateway: &SqliteGateway) -> Result<(Photometer, Photometer)> {
    let reference = gateway
        .register_photometer(&PhotometerInfo {
            name: "stars3".to_string(),
            mac: "18:FE:34:CF:E9:A3".to_string(),
            model: "TESS-W".to_string(),
            freq_offset: 0.0,
        })
        .await?;
    let test = gateway
        .register_photometer(&PhotometerInfo {
            name: "stars1234".to_string(),
            mac: "AA:BB:CC:DD:EE:FF".to_string(),
            model: "TESS-W".to_string(),
            freq_offset: 0.0,
        })
        .await?;
    Ok((reference, test))
}

/// Config with a short window so failing sessions finish quickly
pub fn test_config(rounds: usize, samples_per_round: usize) -> CalibrationConfig {
    CalibrationConfig {
        rounds,
        samples_per_round,
        window_timeout: Duration::from_secs(5),
        stability_threshold: 0.05,
        max_round_retries: 2,
        outlier_retention_fraction: 0.5,
        ..Default::default()
    }
}

pub async fn count_rows(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

/// Row counts of the summary hierarchy
#[derive(Debug, PartialEq, Eq)]
pub struct StorageCounts {
    pub summaries: i64,
    pub rounds: i64,
    pub samples: i64,
}

impl StorageCounts {
    pub async fn read(pool: &SqlitePool) -> Self {
        Self {
            summaries: count_rows(pool, "summary_t").await,
            rounds: count_rows(pool, "rounds_t").await,
            samples: count_rows(pool, "samples_t").await,
        }
    }

    pub fn empty() -> Self {
        Self {
            summaries: 0,
            rounds: 0,
            samples: 0,
        }
    }
}

fn window(channel: Channel, first_seq: u64, magnitude: f64) -> Vec<Sample> {
    (0..3)
        .map(|i| Sample {
            channel,
            sequence_no: first_seq + i,
            timestamp: Utc::now(),
            frequency: 10.0,
            magnitude,
        })
        .collect()
}

/// Finalized record whose rounds carry the given zero points
///
/// Each round holds three samples per channel: reference at magnitude 1.0,
/// test at 1.0 + zp.
pub fn make_record(
    batch: &Batch,
    test: &Photometer,
    reference: &Photometer,
    zero_points: &[f64],
    started_at: DateTime<Utc>,
) -> CalibrationRecord {
    let config = CalibrationConfig {
        rounds: zero_points.len(),
        samples_per_round: 3,
        ..Default::default()
    };
    let threshold = config.stability_threshold;
    let mut ctx = SessionContext::new(batch, test, reference, config, started_at);

    for (i, zp) in zero_points.iter().enumerate() {
        let seq = i as u64 * 3 + 1;
        let ref_samples = window(Channel::Reference, seq, 1.0);
        let test_samples = window(Channel::Test, seq, 1.0 + zp);
        let ref_stats = channel_stats(&ref_samples).unwrap();
        let test_stats = channel_stats(&test_samples).unwrap();

        let mut samples = ref_samples;
        samples.extend(test_samples);
        ctx.accept(Round {
            index: 0,
            window_start: Utc::now(),
            window_end: Utc::now(),
            ref_stats,
            test_stats,
            round_zero_point: test_stats.mean - ref_stats.mean,
            accepted: true,
            samples,
        });
    }

    let convergence = evaluate(ctx.rounds(), zero_points.len(), threshold).unwrap();
    ctx.finalize(convergence)
}
