//! # ZPTESS Calibration Session Engine (zptess-cal)
//!
//! Calibrates a test photometer against a reference photometer of known
//! accuracy and derives the test unit's zero point.
//!
//! **Pipeline:** Sample Sources → Round Aggregator → Convergence Evaluator →
//! Session Orchestrator → Persistence Gateway, gated by the Batch Lifecycle.

pub mod calibration;
pub mod error;
pub mod persistence;
pub mod source;

pub use error::{Error, Result, RoundFailure};
