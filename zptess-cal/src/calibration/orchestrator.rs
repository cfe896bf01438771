//! Session Orchestrator
//!
//! Drives one calibration session end to end:
//!
//! 1. Check preconditions (configuration, photometers, open batch)
//! 2. Acquire R accepted rounds, retrying failed windows
//! 3. Evaluate convergence
//! 4. Persist summary, rounds and samples in a single append
//!
//! Nothing is written before step 4, so an abort at any earlier point
//! leaves storage untouched.

use crate::calibration::aggregator::RoundAggregator;
use crate::calibration::convergence::evaluate;
use crate::calibration::session::SessionContext;
use crate::error::{Error, Result};
use crate::persistence::{BatchLifecycle, PersistenceGateway};
use crate::source::SampleSource;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use zptess_common::config::CalibrationConfig;
use zptess_common::db::{Batch, CalibrationRecord, Channel, Photometer};
use zptess_common::events::{CalibrationEvent, EventBus};

pub struct SessionOrchestrator<G, L> {
    gateway: G,
    lifecycle: L,
    events: Arc<EventBus>,
}

impl<G, L> SessionOrchestrator<G, L>
where
    G: PersistenceGateway,
    L: BatchLifecycle,
{
    pub fn new(gateway: G, lifecycle: L, events: Arc<EventBus>) -> Self {
        Self {
            gateway,
            lifecycle,
            events,
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn lifecycle(&self) -> &L {
        &self.lifecycle
    }

    /// Run a full session for `test` against `reference` inside `batch`
    ///
    /// Returns the persisted record (converged or not). Cancelling `cancel`
    /// aborts at the next suspension point with [`Error::Cancelled`].
    #[allow(clippy::too_many_arguments)]
    pub async fn run_session<R, T>(
        &self,
        batch: &Batch,
        test: &Photometer,
        reference: &Photometer,
        config: &CalibrationConfig,
        ref_source: R,
        test_source: T,
        cancel: CancellationToken,
    ) -> Result<CalibrationRecord>
    where
        R: SampleSource + 'static,
        T: SampleSource + 'static,
    {
        config
            .validate()
            .map_err(|e| Error::PreconditionViolation(e.to_string()))?;

        if test.id == reference.id {
            return Err(Error::PreconditionViolation(format!(
                "photometer {} cannot be calibrated against itself",
                test.id
            )));
        }
        if ref_source.channel() != Channel::Reference || test_source.channel() != Channel::Test {
            return Err(Error::PreconditionViolation(format!(
                "sources are wired as {}/{}, expected ref/test",
                ref_source.channel(),
                test_source.channel()
            )));
        }
        if !batch.is_open() || !self.lifecycle.is_open(batch.id).await? {
            return Err(Error::BatchNotOpen { batch_id: batch.id });
        }

        let ctx = SessionContext::new(batch, test, reference, config.clone(), Utc::now());
        let session_id = ctx.session_id();

        info!(
            %session_id,
            batch_id = batch.id,
            photometer = %test.name,
            reference = %reference.name,
            rounds = config.rounds,
            samples_per_round = config.samples_per_round,
            "Starting calibration session"
        );
        self.events.emit_lossy(CalibrationEvent::SessionStarted {
            session_id,
            batch_id: batch.id,
            photometer_id: test.id,
            reference_id: reference.id,
            rounds: config.rounds,
            samples_per_round: config.samples_per_round,
        });

        let aggregator = RoundAggregator::start(
            ref_source,
            test_source,
            config.samples_per_round,
            self.events.clone(),
        );

        match self.drive(ctx, aggregator, &cancel).await {
            Ok(record) => {
                self.events.emit_lossy(CalibrationEvent::SessionFinalized {
                    summary: record.summary.clone(),
                });
                Ok(record)
            }
            Err(e) => {
                error!(%session_id, error = %e, "Calibration session failed");
                self.events.emit_lossy(CalibrationEvent::SessionFailed {
                    session_id,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        mut ctx: SessionContext,
        mut aggregator: RoundAggregator,
        cancel: &CancellationToken,
    ) -> Result<CalibrationRecord> {
        while !ctx.is_complete() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    accepted: ctx.accepted(),
                });
            }
            self.acquire_round(&mut ctx, &mut aggregator, cancel).await?;
        }

        // Stop reading the sensors before the storage round trip
        drop(aggregator);

        let config = ctx.config();
        let convergence = evaluate(ctx.rounds(), config.rounds, config.stability_threshold)?;
        if convergence.converged {
            info!(
                session_id = %ctx.session_id(),
                zero_point = convergence.final_zero_point,
                stddev = convergence.final_stddev,
                "Session converged"
            );
        } else {
            warn!(
                session_id = %ctx.session_id(),
                zero_point = convergence.final_zero_point,
                stddev = convergence.final_stddev,
                threshold = config.stability_threshold,
                "Session did not converge"
            );
        }

        let batch_version = ctx.batch_version();
        let mut record = ctx.finalize(convergence);
        let id = self.gateway.append_summary(&record, batch_version).await?;
        record.summary.id = Some(id);

        Ok(record)
    }

    /// Run windows until one is accepted or retries run out
    async fn acquire_round(
        &self,
        ctx: &mut SessionContext,
        aggregator: &mut RoundAggregator,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let session_id = ctx.session_id();
        let index = ctx.next_index();
        let config = ctx.config().clone();
        let min_retained = config.min_retained();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled { accepted: ctx.accepted() });
                }
                outcome = aggregator.next_round(
                    config.window_timeout,
                    config.samples_per_round,
                    min_retained,
                ) => outcome,
            };

            match outcome {
                Ok(round) => {
                    let round = ctx.accept(round);
                    info!(
                        %session_id,
                        round = round.index + 1,
                        total = config.rounds,
                        attempt,
                        zero_point = round.round_zero_point,
                        ref_mag = round.ref_stats.mean,
                        test_mag = round.test_stats.mean,
                        "Round accepted"
                    );
                    self.events.emit_lossy(CalibrationEvent::RoundAccepted {
                        index: round.index,
                        total: config.rounds,
                        round_zero_point: round.round_zero_point,
                        ref_stats: round.ref_stats,
                        test_stats: round.test_stats,
                        window_start: round.window_start,
                        window_end: round.window_end,
                    });
                    return Ok(());
                }
                Err(failure) if attempt > config.max_round_retries => {
                    return Err(Error::NonRecoverableAcquisitionFailure {
                        round: index,
                        attempts: attempt,
                        last: failure,
                    });
                }
                Err(failure) => {
                    warn!(
                        %session_id,
                        round = index + 1,
                        attempt,
                        reason = %failure,
                        "Round failed, retrying"
                    );
                    self.events.emit_lossy(CalibrationEvent::RoundRetry {
                        index,
                        attempt,
                        reason: failure.to_string(),
                    });
                }
            }
        }
    }
}
