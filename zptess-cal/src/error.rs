//! Error types for zptess-cal
//!
//! Channel- and round-local failures ([`RoundFailure`]) are retried inside
//! the session and only surface wrapped in
//! [`Error::NonRecoverableAcquisitionFailure`]. Every [`Error`] aborts the
//! whole session with nothing persisted.

use thiserror::Error;
use zptess_common::db::Channel;

/// Why a single round window did not produce an accepted round
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoundFailure {
    /// Window deadline hit before both channels delivered P samples
    #[error("round incomplete: ref {ref_count}/{expected}, test {test_count}/{expected} samples before window timeout")]
    Incomplete {
        ref_count: usize,
        test_count: usize,
        expected: usize,
    },

    /// Too few samples survived outlier rejection
    #[error("round rejected: retained ref {ref_retained}, test {test_retained}, required {required}")]
    Rejected {
        ref_retained: usize,
        test_retained: usize,
        required: usize,
    },

    /// Channel timeout or error reported by a sample source
    #[error("{channel} channel failed: {reason}")]
    Channel { channel: Channel, reason: String },
}

/// Main error type for zptess-cal
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration or session arguments, detected before acquisition
    #[error("Precondition violation: {0}")]
    PreconditionViolation(String),

    /// Target batch is closed or missing
    #[error("Batch {batch_id} is not open")]
    BatchNotOpen { batch_id: i64 },

    /// A round kept failing after all retries
    #[error("Acquisition failed at round {round} after {attempts} attempts: {last}")]
    NonRecoverableAcquisitionFailure {
        round: usize,
        attempts: u32,
        last: RoundFailure,
    },

    /// Operator abort
    #[error("Session cancelled after {accepted} accepted rounds")]
    Cancelled { accepted: usize },

    /// Batch changed between session start and persistence
    #[error("Persistence conflict on batch {batch_id}: {reason}")]
    PersistenceConflict { batch_id: i64, reason: String },

    /// Shared library errors (database init, config)
    #[error(transparent)]
    Common(#[from] zptess_common::Error),

    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Convenience Result type using zptess-cal Error
pub type Result<T> = std::result::Result<T, Error>;
