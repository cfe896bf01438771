//! Sample Feed Utilities
//!
//! Scripted sample delivery through [`QueueSource`]s

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use zptess_cal::source::{QueueSource, SourceError};
use zptess_common::db::{Channel, Sample};
use zptess_common::events::CalibrationEvent;

/// Sender half of a scripted channel with its own sequence counter
pub struct ChannelFeed {
    channel: Channel,
    tx: mpsc::Sender<Result<Sample, SourceError>>,
    next_seq: u64,
}

impl ChannelFeed {
    /// Push `count` samples at a constant magnitude
    pub async fn push_constant(&mut self, count: usize, magnitude: f64) {
        for _ in 0..count {
            self.next_seq += 1;
            self.push_raw(self.next_seq, magnitude).await;
        }
    }

    /// Push a sample with an explicit sequence number
    pub async fn push_raw(&mut self, sequence_no: u64, magnitude: f64) {
        self.tx
            .send(Ok(Sample {
                channel: self.channel,
                sequence_no,
                timestamp: Utc::now(),
                frequency: 10.0,
                magnitude,
            }))
            .await
            .unwrap();
    }

    pub async fn push_error(&mut self, error: SourceError) {
        self.tx.send(Err(error)).await.unwrap();
    }
}

/// Reference and test sources with their feeds
pub fn queue_pair() -> (ChannelFeed, QueueSource, ChannelFeed, QueueSource) {
    let (ref_tx, ref_source) = QueueSource::pair(Channel::Reference, 256);
    let (test_tx, test_source) = QueueSource::pair(Channel::Test, 256);
    (
        ChannelFeed {
            channel: Channel::Reference,
            tx: ref_tx,
            next_seq: 0,
        },
        ref_source,
        ChannelFeed {
            channel: Channel::Test,
            tx: test_tx,
            next_seq: 0,
        },
        test_source,
    )
}

/// Block until the round with `index` is accepted
pub async fn wait_for_round(rx: &mut broadcast::Receiver<CalibrationEvent>, index: usize) {
    loop {
        match rx.recv().await.unwrap() {
            CalibrationEvent::RoundAccepted { index: i, .. } if i == index => return,
            CalibrationEvent::SessionFailed { reason, .. } => {
                panic!("Session failed before round {}: {}", index, reason)
            }
            _ => {}
        }
    }
}
