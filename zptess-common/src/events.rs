//! Calibration event types and event bus
//!
//! The session engine publishes progress here; operator tooling subscribes
//! to render round and summary reports. Publishing never blocks acquisition.

use crate::db::{Channel, ChannelStats, Summary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Calibration progress events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CalibrationEvent {
    /// Session accepted its preconditions and acquisition is starting
    SessionStarted {
        session_id: DateTime<Utc>,
        batch_id: i64,
        photometer_id: i64,
        reference_id: i64,
        rounds: usize,
        samples_per_round: usize,
    },

    /// A duplicate or out-of-order sample was dropped at ingestion
    SampleRejected {
        channel: Channel,
        sequence_no: u64,
        last_sequence_no: u64,
    },

    /// A round passed acceptance and received its index
    RoundAccepted {
        index: usize,
        total: usize,
        round_zero_point: f64,
        ref_stats: ChannelStats,
        test_stats: ChannelStats,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    },

    /// A round window failed and will be retried
    RoundRetry {
        index: usize,
        attempt: u32,
        reason: String,
    },

    /// Summary persisted (converged or not)
    SessionFinalized { summary: Summary },

    /// Session aborted, nothing persisted
    SessionFailed {
        session_id: DateTime<Utc>,
        reason: String,
    },
}

/// Broadcast bus for [`CalibrationEvent`]s
///
/// Slow subscribers lag and lose the oldest events rather than applying
/// backpressure to the session.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<CalibrationEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<CalibrationEvent> {
        self.tx.subscribe()
    }

    /// Emit an event
    ///
    /// Returns `Ok(subscriber_count)`, or `Err` if nobody is listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: CalibrationEvent,
    ) -> Result<usize, broadcast::error::SendError<CalibrationEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the no-subscriber case
    pub fn emit_lossy(&self, event: CalibrationEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
