//! Calibration pipeline
//!
//! Round Aggregator → Convergence Evaluator → Session Orchestrator.

pub mod aggregator;
pub mod convergence;
pub mod orchestrator;
pub mod session;
pub mod stats;

pub use aggregator::RoundAggregator;
pub use convergence::{evaluate, Convergence};
pub use orchestrator::SessionOrchestrator;
pub use session::SessionContext;
