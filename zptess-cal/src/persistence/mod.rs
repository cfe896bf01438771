//! Persistence Gateway and Batch Lifecycle seams
//!
//! The orchestrator only sees these two traits. SQLite implementations live
//! in [`sqlite`] and [`batch`].

pub mod batch;
pub mod sqlite;

pub use batch::SqliteBatchLifecycle;
pub use sqlite::SqliteGateway;

use crate::error::Result;
use async_trait::async_trait;
use zptess_common::db::{Batch, CalibrationRecord};

/// Durable, transactional storage of the calibration hierarchy
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Store a finalized summary with all of its rounds and samples
    ///
    /// Atomic. Appending the same (session, photometer) twice returns the
    /// stored id without writing. Fails with
    /// [`Error::PersistenceConflict`](crate::Error::PersistenceConflict) if
    /// the target batch is no longer open at `batch_version`.
    async fn append_summary(&self, record: &CalibrationRecord, batch_version: i64) -> Result<i64>;
}

/// Which batch currently receives new summaries
#[async_trait]
pub trait BatchLifecycle: Send + Sync {
    async fn current_open_batch(&self) -> Result<Option<Batch>>;

    async fn is_open(&self, batch_id: i64) -> Result<bool>;
}
