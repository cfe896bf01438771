//! Round Aggregator
//!
//! Two producer tasks (one per channel) pull from their [`SampleSource`] and
//! forward readings into bounded queues. [`RoundAggregator::next_round`]
//! joins both queues against a single window deadline:
//!
//! ```text
//! ref source  ──► producer ──► mpsc(P) ──┐
//!                                         ├─► select! { ref, test, deadline }
//! test source ──► producer ──► mpsc(P) ──┘
//! ```
//!
//! A channel stops being consumed once it holds P fresh samples for the
//! window, so a fast channel never races ahead of the shared deadline.
//! Readings still queued when a window ends are left for the next window.

use crate::calibration::stats::channel_stats;
use crate::error::RoundFailure;
use crate::source::{SampleSource, SequenceGuard, SourceError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};
use zptess_common::db::{Channel, Round, Sample};
use zptess_common::events::{CalibrationEvent, EventBus};

type SampleQueue = mpsc::Receiver<Result<Sample, SourceError>>;

/// Assembles time-aligned rounds from a reference and a test source
///
/// Owns the per-channel [`SequenceGuard`]s, so one aggregator serves exactly
/// one session. Dropping it stops both producer tasks.
pub struct RoundAggregator {
    ref_rx: SampleQueue,
    test_rx: SampleQueue,
    ref_guard: SequenceGuard,
    test_guard: SequenceGuard,
    events: Arc<EventBus>,
    producers: Vec<JoinHandle<()>>,
}

impl RoundAggregator {
    /// Spawn the producer tasks and return the aggregator joining them
    ///
    /// `queue_capacity` bounds how far each producer may read ahead of the
    /// aggregator; the session uses P.
    pub fn start<R, T>(
        ref_source: R,
        test_source: T,
        queue_capacity: usize,
        events: Arc<EventBus>,
    ) -> Self
    where
        R: SampleSource + 'static,
        T: SampleSource + 'static,
    {
        let (ref_tx, ref_rx) = mpsc::channel(queue_capacity.max(1));
        let (test_tx, test_rx) = mpsc::channel(queue_capacity.max(1));

        let producers = vec![
            spawn_producer(ref_source, Channel::Reference, ref_tx),
            spawn_producer(test_source, Channel::Test, test_tx),
        ];

        Self {
            ref_rx,
            test_rx,
            ref_guard: SequenceGuard::new(Channel::Reference),
            test_guard: SequenceGuard::new(Channel::Test),
            events,
            producers,
        }
    }

    /// Collect one window and turn it into an accepted round
    ///
    /// The returned round carries index 0; the session assigns the real
    /// index when it accepts the round. On failure the partial window is
    /// discarded.
    pub async fn next_round(
        &mut self,
        window_timeout: Duration,
        samples_per_channel: usize,
        min_retained: usize,
    ) -> Result<Round, RoundFailure> {
        let p = samples_per_channel;
        let window_start = Utc::now();
        let deadline = sleep_until(window_deadline(window_timeout));
        tokio::pin!(deadline);

        // Disjoint borrows so select! branches and handlers can coexist
        let Self {
            ref_rx,
            test_rx,
            ref_guard,
            test_guard,
            events,
            ..
        } = self;

        let mut ref_samples: Vec<Sample> = Vec::with_capacity(p);
        let mut test_samples: Vec<Sample> = Vec::with_capacity(p);

        while ref_samples.len() < p || test_samples.len() < p {
            tokio::select! {
                msg = ref_rx.recv(), if ref_samples.len() < p => {
                    ingest(ref_guard, events, msg, &mut ref_samples)?;
                }
                msg = test_rx.recv(), if test_samples.len() < p => {
                    ingest(test_guard, events, msg, &mut test_samples)?;
                }
                _ = &mut deadline => {
                    debug!(
                        ref_count = ref_samples.len(),
                        test_count = test_samples.len(),
                        "Round window timed out"
                    );
                    return Err(RoundFailure::Incomplete {
                        ref_count: ref_samples.len(),
                        test_count: test_samples.len(),
                        expected: p,
                    });
                }
            }
        }

        let window_end = Utc::now();

        let ref_stats = channel_stats(&ref_samples);
        let test_stats = channel_stats(&test_samples);
        let ref_retained = ref_stats.as_ref().map_or(0, |s| s.n);
        let test_retained = test_stats.as_ref().map_or(0, |s| s.n);

        let (ref_stats, test_stats) = match (ref_stats, test_stats) {
            (Some(r), Some(t)) if r.n >= min_retained && t.n >= min_retained => (r, t),
            _ => {
                return Err(RoundFailure::Rejected {
                    ref_retained,
                    test_retained,
                    required: min_retained,
                })
            }
        };

        let round_zero_point = test_stats.mean - ref_stats.mean;

        let mut samples = ref_samples;
        samples.append(&mut test_samples);

        Ok(Round {
            index: 0,
            window_start,
            window_end,
            ref_stats,
            test_stats,
            round_zero_point,
            accepted: true,
            samples,
        })
    }

    /// Samples dropped so far for sequence violations, per channel
    pub fn rejected(&self, channel: Channel) -> u64 {
        match channel {
            Channel::Reference => self.ref_guard.rejected(),
            Channel::Test => self.test_guard.rejected(),
        }
    }
}

impl Drop for RoundAggregator {
    fn drop(&mut self) {
        for handle in &self.producers {
            handle.abort();
        }
    }
}

/// Deadline for a window starting now, saturating far in the future
fn window_deadline(window_timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(window_timeout).unwrap_or(now + FAR_FUTURE)
}

/// Roughly 30 years
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Route one queue message into the window buffer
fn ingest(
    guard: &mut SequenceGuard,
    events: &EventBus,
    msg: Option<Result<Sample, SourceError>>,
    buffer: &mut Vec<Sample>,
) -> Result<(), RoundFailure> {
    let channel = guard.channel();
    match msg {
        Some(Ok(sample)) => {
            match guard.admit(&sample) {
                Ok(()) => buffer.push(sample),
                Err(last) => {
                    warn!(
                        %channel,
                        sequence_no = sample.sequence_no,
                        last_sequence_no = last,
                        "Rejected out-of-order sample"
                    );
                    events.emit_lossy(CalibrationEvent::SampleRejected {
                        channel,
                        sequence_no: sample.sequence_no,
                        last_sequence_no: last,
                    });
                }
            }
            Ok(())
        }
        Some(Err(e)) => Err(RoundFailure::Channel {
            channel,
            reason: e.to_string(),
        }),
        None => Err(RoundFailure::Channel {
            channel,
            reason: SourceError::Closed.to_string(),
        }),
    }
}

fn spawn_producer<S>(
    mut source: S,
    expected: Channel,
    tx: mpsc::Sender<Result<Sample, SourceError>>,
) -> JoinHandle<()>
where
    S: SampleSource + 'static,
{
    tokio::spawn(async move {
        loop {
            let item = match source.next_sample().await {
                Ok(sample) if sample.channel != expected => Err(SourceError::Failed(format!(
                    "{} source produced a {} sample",
                    expected, sample.channel
                ))),
                other => other,
            };

            let closed = matches!(item, Err(SourceError::Closed));
            if tx.send(item).await.is_err() || closed {
                break;
            }
        }
        debug!(channel = %expected, "Sample producer stopped");
    })
}
