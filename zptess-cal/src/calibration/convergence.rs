//! Convergence Evaluator
//!
//! Pure function of the accepted rounds: the same rounds always give the
//! same result.

use crate::calibration::stats::{best_value, mean, sample_stddev};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use zptess_common::db::Round;

/// Cross-round result for one session
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Convergence {
    /// Mean of the round zero points
    pub final_zero_point: f64,
    /// Sample standard deviation of the round zero points
    pub final_stddev: f64,
    /// Mode of the round zero points at 0.01 mag, else the low median
    pub best_zero_point: f64,
    pub converged: bool,
}

/// Evaluate exactly `target` accepted rounds against `stability_threshold`
pub fn evaluate(rounds: &[Round], target: usize, stability_threshold: f64) -> Result<Convergence> {
    if target == 0 {
        return Err(Error::PreconditionViolation(
            "convergence target must be at least one round".to_string(),
        ));
    }
    if rounds.len() != target {
        return Err(Error::PreconditionViolation(format!(
            "expected {} accepted rounds, got {}",
            target,
            rounds.len()
        )));
    }
    if let Some(round) = rounds.iter().find(|r| !r.accepted) {
        return Err(Error::PreconditionViolation(format!(
            "round {} was not accepted",
            round.index
        )));
    }

    let zps: Vec<f64> = rounds.iter().map(|r| r.round_zero_point).collect();
    let (Some(final_zero_point), Some(final_stddev), Some(best_zero_point)) =
        (mean(&zps), sample_stddev(&zps), best_value(&zps))
    else {
        return Err(Error::PreconditionViolation(
            "no round zero points to evaluate".to_string(),
        ));
    };

    Ok(Convergence {
        final_zero_point,
        final_stddev,
        best_zero_point,
        converged: final_stddev <= stability_threshold,
    })
}
