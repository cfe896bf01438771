//! Sample sources
//!
//! A [`SampleSource`] yields a lazy, unbounded sequence of timestamped
//! readings for one channel. Byte-level transport and protocol framing live
//! outside this crate; transports feed decoded samples through a
//! [`QueueSource`] and report framing problems as [`SourceError::Failed`].

mod simulated;

pub use simulated::{SimulatedPhotometer, SimulationParams};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use zptess_common::db::{Channel, Sample};

/// Channel-local failure reported by a sample source
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    /// The device did not answer in time (transient)
    #[error("channel timeout")]
    Timeout,

    /// Transport or decoding failure (transient)
    #[error("channel error: {0}")]
    Failed(String),

    /// The source will never produce again
    #[error("source closed")]
    Closed,
}

/// Producer of samples for one acquisition channel
#[async_trait]
pub trait SampleSource: Send {
    /// Channel this source feeds
    fn channel(&self) -> Channel;

    /// Wait for the next sample
    async fn next_sample(&mut self) -> Result<Sample, SourceError>;
}

/// Source fed through an mpsc channel by an external transport
pub struct QueueSource {
    channel: Channel,
    rx: mpsc::Receiver<Result<Sample, SourceError>>,
}

impl QueueSource {
    /// Create a source and the sender an external transport pushes into
    pub fn pair(
        channel: Channel,
        capacity: usize,
    ) -> (mpsc::Sender<Result<Sample, SourceError>>, QueueSource) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, QueueSource { channel, rx })
    }
}

#[async_trait]
impl SampleSource for QueueSource {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn next_sample(&mut self) -> Result<Sample, SourceError> {
        self.rx.recv().await.unwrap_or(Err(SourceError::Closed))
    }
}

/// Enforces strictly increasing sequence numbers on one channel
///
/// One guard per channel per session. Duplicates and out-of-order samples
/// are rejected and counted; they never reach a round.
#[derive(Debug)]
pub struct SequenceGuard {
    channel: Channel,
    last: Option<u64>,
    rejected: u64,
}

impl SequenceGuard {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            last: None,
            rejected: 0,
        }
    }

    /// Admit a sample, or return the last admitted sequence number it failed against
    pub fn admit(&mut self, sample: &Sample) -> Result<(), u64> {
        match self.last {
            Some(last) if sample.sequence_no <= last => {
                self.rejected += 1;
                Err(last)
            }
            _ => {
                self.last = Some(sample.sequence_no);
                Ok(())
            }
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

/// Instrumental magnitude of a frequency reading
///
/// `zp_fict − 2.5·log10(freq − freq_offset)`; NaN when the reading does not
/// exceed the dark frequency.
pub fn instrumental_magnitude(frequency: f64, freq_offset: f64, zp_fict: f64) -> f64 {
    let net = frequency - freq_offset;
    if net > 0.0 {
        zp_fict - 2.5 * net.log10()
    } else {
        f64::NAN
    }
}
