//! Synthetic photometer for dry runs
//!
//! Emits readings at a fixed period around a base frequency with uniform
//! relative noise. A seed makes runs reproducible.

use super::{instrumental_magnitude, SampleSource, SourceError};
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use zptess_common::db::{Channel, Sample};

#[derive(Debug, Clone)]
pub struct SimulationParams {
    /// Mean reading (Hz)
    pub base_frequency: f64,
    /// Dark frequency (Hz)
    pub freq_offset: f64,
    /// Relative noise amplitude, e.g. 0.01 for ±1%
    pub noise: f64,
    /// Time between readings
    pub period: Duration,
    /// Fictitious zero point for the instrumental magnitude
    pub zp_fict: f64,
    pub seed: u64,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            base_frequency: 10.0,
            freq_offset: 0.0,
            noise: 0.005,
            period: Duration::from_millis(200),
            zp_fict: 20.50,
            seed: 0,
        }
    }
}

pub struct SimulatedPhotometer {
    channel: Channel,
    params: SimulationParams,
    rng: StdRng,
    sequence_no: u64,
    // Created on first poll, needs a running runtime
    ticker: Option<Interval>,
}

impl SimulatedPhotometer {
    pub fn new(channel: Channel, params: SimulationParams) -> Self {
        let rng = StdRng::seed_from_u64(params.seed);
        Self {
            channel,
            params,
            rng,
            sequence_no: 0,
            ticker: None,
        }
    }
}

#[async_trait]
impl SampleSource for SimulatedPhotometer {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn next_sample(&mut self) -> Result<Sample, SourceError> {
        let period = self.params.period;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut t = interval(period);
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            t
        });
        ticker.tick().await;

        let jitter: f64 = self.rng.gen_range(-1.0..=1.0);
        let frequency = self.params.base_frequency * (1.0 + self.params.noise * jitter);
        self.sequence_no += 1;

        Ok(Sample {
            channel: self.channel,
            sequence_no: self.sequence_no,
            timestamp: Utc::now(),
            frequency,
            magnitude: instrumental_magnitude(
                frequency,
                self.params.freq_offset,
                self.params.zp_fict,
            ),
        })
    }
}
