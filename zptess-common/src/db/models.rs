//! Database models
//!
//! The four-level calibration hierarchy: Batch → Summary → Round → Sample.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Acquisition channel of a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Reference,
    Test,
}

impl Channel {
    /// Both channels, reference first
    pub const ALL: [Channel; 2] = [Channel::Reference, Channel::Test];

    /// Column representation (`ref` / `test`)
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Reference => "ref",
            Channel::Test => "test",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ref" => Some(Channel::Reference),
            "test" => Some(Channel::Test),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Open,
    Closed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Open => "open",
            BatchStatus::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(BatchStatus::Open),
            "closed" => Some(BatchStatus::Closed),
            _ => None,
        }
    }
}

/// Calibration campaign grouping several sessions
///
/// `version` is an optimistic concurrency token bumped by every lifecycle
/// mutation (close, purge). Appends compare against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: i64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub status: BatchStatus,
    pub calibration_count: i64,
    pub version: i64,
    pub comment: Option<String>,
}

impl Batch {
    pub fn is_open(&self) -> bool {
        self.status == BatchStatus::Open
    }
}

/// Registered photometer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photometer {
    pub id: i64,
    pub name: String,
    pub mac: String,
    pub model: String,
    /// Dark frequency subtracted before computing magnitudes (Hz)
    pub freq_offset: f64,
}

/// Photometer identity used for registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotometerInfo {
    pub name: String,
    pub mac: String,
    pub model: String,
    pub freq_offset: f64,
}

/// One raw reading from one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub channel: Channel,
    pub sequence_no: u64,
    pub timestamp: DateTime<Utc>,
    pub frequency: f64,
    pub magnitude: f64,
}

/// Statistics over the retained (interquartile) samples of one channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub mean: f64,
    pub stddev: f64,
    pub n: usize,
    /// Mean frequency of the retained samples (Hz)
    pub frequency: f64,
}

/// One synchronized measurement window inside a summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    /// 0-based, assigned at acceptance time
    pub index: usize,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub ref_stats: ChannelStats,
    pub test_stats: ChannelStats,
    /// test mean − reference mean (magnitudes)
    pub round_zero_point: f64,
    pub accepted: bool,
    /// Every sample consumed by this round, both channels, in arrival order per channel
    pub samples: Vec<Sample>,
}

impl Round {
    pub fn samples_for(&self, channel: Channel) -> impl Iterator<Item = &Sample> {
        self.samples.iter().filter(move |s| s.channel == channel)
    }

    pub fn stats_for(&self, channel: Channel) -> &ChannelStats {
        match channel {
            Channel::Reference => &self.ref_stats,
            Channel::Test => &self.test_stats,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryState {
    Pending,
    Finalized,
}

/// One calibration attempt for one test photometer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Database id, `None` until persisted
    pub id: Option<i64>,
    /// Session start time truncated to whole seconds
    pub session_id: DateTime<Utc>,
    pub photometer_id: i64,
    pub reference_id: i64,
    /// `None` means orphan
    pub batch_id: Option<i64>,
    pub state: SummaryState,
    pub final_zero_point: Option<f64>,
    pub final_stddev: Option<f64>,
    pub best_zero_point: Option<f64>,
    pub published_zero_point: Option<f64>,
    pub zp_offset: f64,
    pub round_count: usize,
    pub convergence_flag: bool,
    pub author: Option<String>,
    /// Operator-entered note, never written by the engine
    pub annotation: Option<String>,
}

impl Summary {
    /// New summary in PENDING state
    pub fn pending(
        started_at: DateTime<Utc>,
        photometer_id: i64,
        reference_id: i64,
        batch_id: i64,
        zp_offset: f64,
        author: Option<String>,
    ) -> Self {
        Self {
            id: None,
            session_id: session_id_from(started_at),
            photometer_id,
            reference_id,
            batch_id: Some(batch_id),
            state: SummaryState::Pending,
            final_zero_point: None,
            final_stddev: None,
            best_zero_point: None,
            published_zero_point: None,
            zp_offset,
            round_count: 0,
            convergence_flag: false,
            author,
            annotation: None,
        }
    }

    pub fn is_orphan(&self) -> bool {
        self.batch_id.is_none()
    }
}

/// A finalized summary with its nested rounds and samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub summary: Summary,
    pub rounds: Vec<Round>,
}

impl CalibrationRecord {
    pub fn sample_count(&self) -> usize {
        self.rounds.iter().map(|r| r.samples.len()).sum()
    }
}

/// Derive a session identifier from its start time
pub fn session_id_from(started_at: DateTime<Utc>) -> DateTime<Utc> {
    started_at.trunc_subsecs(0)
}
