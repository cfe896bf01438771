//! End-to-end calibration sessions against a temporary database
//!
//! Samples are scripted through queue sources so every round zero point is
//! known exactly.

mod helpers;

use helpers::*;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use zptess_cal::calibration::SessionOrchestrator;
use zptess_cal::persistence::{SqliteBatchLifecycle, SqliteGateway};
use zptess_cal::{Error, RoundFailure};
use zptess_common::db::{Batch, Photometer};
use zptess_common::events::{CalibrationEvent, EventBus};

struct Fixture {
    _dir: TempDir,
    pool: SqlitePool,
    gateway: SqliteGateway,
    lifecycle: SqliteBatchLifecycle,
    events: Arc<EventBus>,
    batch: Batch,
    reference: Photometer,
    test: Photometer,
}

impl Fixture {
    async fn new() -> Self {
        let (dir, pool) = create_test_db().await.unwrap();
        let gateway = SqliteGateway::new(pool.clone());
        let lifecycle = SqliteBatchLifecycle::new(pool.clone());
        let (reference, test) = register_pair(&gateway).await.unwrap();
        let batch = lifecycle.begin(Some("scenario")).await.unwrap();

        Self {
            _dir: dir,
            pool,
            gateway,
            lifecycle,
            events: Arc::new(EventBus::new(256)),
            batch,
            reference,
            test,
        }
    }

    fn orchestrator(&self) -> SessionOrchestrator<SqliteGateway, SqliteBatchLifecycle> {
        SessionOrchestrator::new(
            self.gateway.clone(),
            self.lifecycle.clone(),
            self.events.clone(),
        )
    }

    async fn calibration_count(&self) -> i64 {
        sqlx::query_scalar("SELECT calibration_count FROM batch_t WHERE id = ?")
            .bind(self.batch.id)
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_stable_rounds_persist_converged_summary() {
    let fx = Fixture::new().await;
    let (mut ref_feed, ref_source, mut test_feed, test_source) = queue_pair();
    for test_mag in [21.12, 21.15, 21.10] {
        ref_feed.push_constant(5, 1.0).await;
        test_feed.push_constant(5, test_mag).await;
    }

    let config = test_config(3, 5);
    let record = fx
        .orchestrator()
        .run_session(
            &fx.batch,
            &fx.test,
            &fx.reference,
            &config,
            ref_source,
            test_source,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let s = &record.summary;
    assert!((s.final_zero_point.unwrap() - 20.1233).abs() < 1e-4);
    assert!((s.final_stddev.unwrap() - 0.0252).abs() < 1e-3);
    assert!(s.convergence_flag);
    assert_eq!(s.round_count, 3);
    assert!((s.best_zero_point.unwrap() - 20.12).abs() < 1e-9);
    assert_eq!(s.published_zero_point, s.best_zero_point);

    let indices: Vec<usize> = record.rounds.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);

    assert_eq!(
        StorageCounts::read(&fx.pool).await,
        StorageCounts {
            summaries: 1,
            rounds: 3,
            samples: 30
        }
    );
    assert_eq!(fx.calibration_count().await, 1);

    let stored = fx
        .gateway
        .load_record(s.id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.summary.round_count, 3);
    assert_eq!(stored.rounds.len(), 3);
    assert!(stored.summary.convergence_flag);
}

#[tokio::test]
async fn test_scattered_rounds_persist_non_converged_summary() {
    let fx = Fixture::new().await;
    let (mut ref_feed, ref_source, mut test_feed, test_source) = queue_pair();
    for test_mag in [21.0, 21.5, 20.6] {
        ref_feed.push_constant(5, 1.0).await;
        test_feed.push_constant(5, test_mag).await;
    }

    let record = fx
        .orchestrator()
        .run_session(
            &fx.batch,
            &fx.test,
            &fx.reference,
            &test_config(3, 5),
            ref_source,
            test_source,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!((record.summary.final_stddev.unwrap() - 0.4509).abs() < 1e-3);
    assert!(!record.summary.convergence_flag);

    let flag: bool = sqlx::query_scalar("SELECT convergence_flag FROM summary_t WHERE id = ?")
        .bind(record.summary.id.unwrap())
        .fetch_one(&fx.pool)
        .await
        .unwrap();
    assert!(!flag);
    assert_eq!(fx.calibration_count().await, 0);
}

#[tokio::test]
async fn test_starved_channel_exhausts_retries() {
    let fx = Fixture::new().await;
    let mut events = fx.events.subscribe();
    let (mut ref_feed, ref_source, mut test_feed, test_source) = queue_pair();
    ref_feed.push_constant(5, 1.0).await;
    test_feed.push_constant(2, 21.0).await;

    let mut config = test_config(3, 5);
    config.window_timeout = Duration::from_millis(100);

    let err = fx
        .orchestrator()
        .run_session(
            &fx.batch,
            &fx.test,
            &fx.reference,
            &config,
            ref_source,
            test_source,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err {
        Error::NonRecoverableAcquisitionFailure {
            round,
            attempts,
            last,
        } => {
            assert_eq!(round, 0);
            assert_eq!(attempts, 3);
            assert!(matches!(last, RoundFailure::Incomplete { expected: 5, .. }));
        }
        other => panic!("Unexpected error: {:?}", other),
    }

    let mut retries = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            CalibrationEvent::RoundRetry { attempt, reason, .. } => retries.push((attempt, reason)),
            CalibrationEvent::SessionFailed { .. } => break,
            _ => {}
        }
    }
    assert_eq!(retries.len(), 2);
    assert!(retries[0].1.contains("test 2/5"), "reason: {}", retries[0].1);

    assert_eq!(StorageCounts::read(&fx.pool).await, StorageCounts::empty());
}

#[tokio::test]
async fn test_rejected_rounds_exhaust_retries() {
    let fx = Fixture::new().await;
    let (mut ref_feed, ref_source, mut test_feed, test_source) = queue_pair();
    ref_feed.push_constant(15, 1.0).await;
    test_feed.push_constant(15, f64::NAN).await;

    let config = test_config(3, 5);
    let err = fx
        .orchestrator()
        .run_session(
            &fx.batch,
            &fx.test,
            &fx.reference,
            &config,
            ref_source,
            test_source,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err {
        Error::NonRecoverableAcquisitionFailure {
            round,
            attempts,
            last,
        } => {
            assert_eq!(round, 0);
            assert_eq!(attempts, config.max_round_retries + 1);
            assert_eq!(
                last,
                RoundFailure::Rejected {
                    ref_retained: 3,
                    test_retained: 0,
                    required: 3
                }
            );
        }
        other => panic!("Unexpected error: {:?}", other),
    }

    assert_eq!(StorageCounts::read(&fx.pool).await, StorageCounts::empty());
    assert_eq!(fx.calibration_count().await, 0);
}

#[tokio::test]
async fn test_batch_closed_mid_session_is_conflict() {
    let fx = Fixture::new().await;
    let mut events = fx.events.subscribe();
    let (mut ref_feed, ref_source, mut test_feed, test_source) = queue_pair();
    ref_feed.push_constant(10, 1.0).await;
    test_feed.push_constant(10, 21.1).await;

    let orchestrator = fx.orchestrator();
    let config = test_config(3, 5);
    let cancel = CancellationToken::new();
    let session = orchestrator.run_session(
        &fx.batch,
        &fx.test,
        &fx.reference,
        &config,
        ref_source,
        test_source,
        cancel,
    );

    let operator = async {
        wait_for_round(&mut events, 1).await;
        fx.lifecycle.end().await.unwrap();
        ref_feed.push_constant(5, 1.0).await;
        test_feed.push_constant(5, 21.1).await;
    };

    let (result, ()) = tokio::join!(session, operator);
    match result {
        Err(Error::PersistenceConflict { batch_id, reason }) => {
            assert_eq!(batch_id, fx.batch.id);
            assert!(reason.contains("closed"), "reason: {}", reason);
        }
        other => panic!("Unexpected result: {:?}", other),
    }

    assert_eq!(StorageCounts::read(&fx.pool).await, StorageCounts::empty());
}

#[tokio::test]
async fn test_cancel_after_two_rounds_persists_nothing() {
    let fx = Fixture::new().await;
    let mut events = fx.events.subscribe();
    let (mut ref_feed, ref_source, mut test_feed, test_source) = queue_pair();
    ref_feed.push_constant(10, 1.0).await;
    test_feed.push_constant(10, 21.1).await;

    let orchestrator = fx.orchestrator();
    let config = test_config(3, 5);
    let cancel = CancellationToken::new();
    let session = orchestrator.run_session(
        &fx.batch,
        &fx.test,
        &fx.reference,
        &config,
        ref_source,
        test_source,
        cancel.clone(),
    );

    let operator = async {
        wait_for_round(&mut events, 1).await;
        cancel.cancel();
        // Late samples must not revive the session
        ref_feed.push_constant(5, 1.0).await;
        test_feed.push_constant(5, 21.1).await;
    };

    let (result, ()) = tokio::join!(session, operator);
    assert!(
        matches!(result, Err(Error::Cancelled { accepted: 2 })),
        "Unexpected result: {:?}",
        result
    );

    assert_eq!(StorageCounts::read(&fx.pool).await, StorageCounts::empty());
    assert_eq!(fx.calibration_count().await, 0);
}

#[tokio::test]
async fn test_out_of_order_samples_never_stored() {
    let fx = Fixture::new().await;
    let mut events = fx.events.subscribe();
    let (mut ref_feed, ref_source, mut test_feed, test_source) = queue_pair();
    for seq in [1, 2, 2, 3, 1, 4, 5] {
        ref_feed.push_raw(seq, 1.0).await;
    }
    test_feed.push_constant(5, 21.1).await;

    let record = fx
        .orchestrator()
        .run_session(
            &fx.batch,
            &fx.test,
            &fx.reference,
            &test_config(1, 5),
            ref_source,
            test_source,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let rows = sqlx::query(
        "SELECT s.sequence_no FROM samples_t s JOIN rounds_t r ON s.round_id = r.id
         WHERE r.summary_id = ? AND s.channel = 'ref' ORDER BY s.id",
    )
    .bind(record.summary.id.unwrap())
    .fetch_all(&fx.pool)
    .await
    .unwrap();
    let seqs: Vec<i64> = rows.iter().map(|r| r.get("sequence_no")).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

    let mut rejected = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, CalibrationEvent::SampleRejected { .. }) {
            rejected += 1;
        }
    }
    assert_eq!(rejected, 2);
}

#[tokio::test]
async fn test_accepted_rounds_meet_retention_minimum() {
    let fx = Fixture::new().await;
    let (mut ref_feed, ref_source, mut test_feed, test_source) = queue_pair();
    ref_feed.push_constant(18, 1.0).await;
    test_feed.push_constant(18, 21.1).await;

    let config = test_config(2, 9);
    let min = config.min_retained() as i64;
    let record = fx
        .orchestrator()
        .run_session(
            &fx.batch,
            &fx.test,
            &fx.reference,
            &config,
            ref_source,
            test_source,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let rows = sqlx::query("SELECT ref_n, test_n, accepted FROM rounds_t WHERE summary_id = ?")
        .bind(record.summary.id.unwrap())
        .fetch_all(&fx.pool)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    for row in rows {
        assert!(row.get::<i64, _>("ref_n") >= min);
        assert!(row.get::<i64, _>("test_n") >= min);
        assert!(row.get::<bool, _>("accepted"));
    }
}

#[tokio::test]
async fn test_transient_channel_error_is_retried() {
    let fx = Fixture::new().await;
    let (mut ref_feed, ref_source, mut test_feed, test_source) = queue_pair();
    ref_feed.push_constant(10, 1.0).await;
    test_feed
        .push_error(zptess_cal::source::SourceError::Timeout)
        .await;
    test_feed.push_constant(5, 21.1).await;

    let record = fx
        .orchestrator()
        .run_session(
            &fx.batch,
            &fx.test,
            &fx.reference,
            &test_config(1, 5),
            ref_source,
            test_source,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(record.summary.round_count, 1);
    assert!((record.rounds[0].round_zero_point - 20.1).abs() < 1e-9);
}

#[tokio::test]
async fn test_closed_batch_rejected_before_acquisition() {
    let fx = Fixture::new().await;
    fx.lifecycle.end().await.unwrap();
    let (_ref_feed, ref_source, _test_feed, test_source) = queue_pair();

    let err = fx
        .orchestrator()
        .run_session(
            &fx.batch,
            &fx.test,
            &fx.reference,
            &test_config(3, 5),
            ref_source,
            test_source,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::BatchNotOpen { batch_id } if batch_id == fx.batch.id));
    assert_eq!(StorageCounts::read(&fx.pool).await, StorageCounts::empty());
}

#[tokio::test]
async fn test_invalid_config_is_precondition_violation() {
    let fx = Fixture::new().await;

    for config in [test_config(0, 5), test_config(3, 0)] {
        let (_ref_feed, ref_source, _test_feed, test_source) = queue_pair();
        let err = fx
            .orchestrator()
            .run_session(
                &fx.batch,
                &fx.test,
                &fx.reference,
                &config,
                ref_source,
                test_source,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionViolation(_)), "{:?}", err);
    }

    // Default P=9 keeps 5 samples after trimming; 0.6 would need 6
    let mut unreachable = test_config(3, 9);
    unreachable.outlier_retention_fraction = 0.6;
    let mut events = fx.events.subscribe();
    let (mut ref_feed, ref_source, mut test_feed, test_source) = queue_pair();
    ref_feed.push_constant(27, 1.0).await;
    test_feed.push_constant(27, 21.1).await;
    let err = fx
        .orchestrator()
        .run_session(
            &fx.batch,
            &fx.test,
            &fx.reference,
            &unreachable,
            ref_source,
            test_source,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PreconditionViolation(_)), "{:?}", err);
    assert!(
        events.try_recv().is_err(),
        "no acquisition may start on an invalid config"
    );

    let (_ref_feed, ref_source, _test_feed, test_source) = queue_pair();
    let err = fx
        .orchestrator()
        .run_session(
            &fx.batch,
            &fx.test,
            &fx.test,
            &test_config(3, 5),
            ref_source,
            test_source,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PreconditionViolation(_)));
}
