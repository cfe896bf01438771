//! Session context
//!
//! Everything one calibration session accumulates lives here and is threaded
//! through the orchestrator explicitly: the target batch snapshot, the
//! pending summary, and the accepted rounds in temporal order.

use crate::calibration::convergence::Convergence;
use chrono::{DateTime, Utc};
use zptess_common::config::CalibrationConfig;
use zptess_common::db::{Batch, CalibrationRecord, Photometer, Round, Summary, SummaryState};

#[derive(Debug)]
pub struct SessionContext {
    batch_id: i64,
    batch_version: i64,
    config: CalibrationConfig,
    summary: Summary,
    rounds: Vec<Round>,
}

impl SessionContext {
    pub fn new(
        batch: &Batch,
        test: &Photometer,
        reference: &Photometer,
        config: CalibrationConfig,
        started_at: DateTime<Utc>,
    ) -> Self {
        let summary = Summary::pending(
            started_at,
            test.id,
            reference.id,
            batch.id,
            config.zp_offset,
            config.author.clone(),
        );
        let rounds = Vec::with_capacity(config.rounds);

        Self {
            batch_id: batch.id,
            batch_version: batch.version,
            config,
            summary,
            rounds,
        }
    }

    pub fn session_id(&self) -> DateTime<Utc> {
        self.summary.session_id
    }

    pub fn batch_id(&self) -> i64 {
        self.batch_id
    }

    /// Batch version observed when the session started
    pub fn batch_version(&self) -> i64 {
        self.batch_version
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn rounds(&self) -> &[Round] {
        &self.rounds
    }

    pub fn accepted(&self) -> usize {
        self.rounds.len()
    }

    /// Index the next accepted round will receive
    pub fn next_index(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_complete(&self) -> bool {
        self.rounds.len() >= self.config.rounds
    }

    /// Record an accepted round, assigning its index
    pub fn accept(&mut self, mut round: Round) -> &Round {
        round.index = self.rounds.len();
        round.accepted = true;
        self.rounds.push(round);
        self.summary.round_count = self.rounds.len();
        &self.rounds[self.rounds.len() - 1]
    }

    /// Close the session into a persistable record
    pub fn finalize(self, convergence: Convergence) -> CalibrationRecord {
        let mut summary = self.summary;
        summary.state = SummaryState::Finalized;
        summary.final_zero_point = Some(convergence.final_zero_point);
        summary.final_stddev = Some(convergence.final_stddev);
        summary.best_zero_point = Some(convergence.best_zero_point);
        summary.published_zero_point = Some(convergence.best_zero_point + summary.zp_offset);
        summary.convergence_flag = convergence.converged;
        summary.round_count = self.rounds.len();

        CalibrationRecord {
            summary,
            rounds: self.rounds,
        }
    }
}
