//! Configuration loading
//!
//! Settings sources, highest priority first:
//! 1. Command-line arguments
//! 2. TOML configuration file
//! 3. Database `config_t` table (section `calibration`)
//! 4. Built-in defaults
//!
//! Missing database settings are written back with their built-in default so
//! the table always documents the values a session actually ran with.

use crate::{Error, Result};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming the TOML config file
pub const CONFIG_ENV_VAR: &str = "ZPTESS_CONFIG";

/// `config_t` section holding calibration settings
pub const CALIBRATION_SECTION: &str = "calibration";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    /// Path to SQLite database file
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Calibration overrides applied on top of database settings
    #[serde(default)]
    pub calibration: CalibrationOverrides,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Optional calibration settings, as given on the command line or in TOML
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CalibrationOverrides {
    pub rounds: Option<usize>,
    pub samples_per_round: Option<usize>,
    pub window_timeout_secs: Option<f64>,
    pub stability_threshold: Option<f64>,
    pub max_round_retries: Option<u32>,
    pub outlier_retention_fraction: Option<f64>,
    pub zp_offset: Option<f64>,
    pub zp_fict: Option<f64>,
    pub author: Option<String>,
}

impl CalibrationOverrides {
    /// Combine two override sets, `self` taking priority
    pub fn or(self, lower: CalibrationOverrides) -> CalibrationOverrides {
        CalibrationOverrides {
            rounds: self.rounds.or(lower.rounds),
            samples_per_round: self.samples_per_round.or(lower.samples_per_round),
            window_timeout_secs: self.window_timeout_secs.or(lower.window_timeout_secs),
            stability_threshold: self.stability_threshold.or(lower.stability_threshold),
            max_round_retries: self.max_round_retries.or(lower.max_round_retries),
            outlier_retention_fraction: self
                .outlier_retention_fraction
                .or(lower.outlier_retention_fraction),
            zp_offset: self.zp_offset.or(lower.zp_offset),
            zp_fict: self.zp_fict.or(lower.zp_fict),
            author: self.author.or(lower.author),
        }
    }
}

/// Resolved calibration settings for one session
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationConfig {
    /// Accepted rounds required per session (R)
    pub rounds: usize,
    /// Samples per channel per round (P)
    pub samples_per_round: usize,
    /// Deadline for one round window
    pub window_timeout: Duration,
    /// Maximum cross-round stddev (mag) for convergence
    pub stability_threshold: f64,
    /// Retries per round before the session fails
    pub max_round_retries: u32,
    /// Minimum retained fraction of P per channel for round acceptance
    pub outlier_retention_fraction: f64,
    /// Offset added to the final zero point before publication
    pub zp_offset: f64,
    /// Fictitious zero point for instrumental magnitudes
    pub zp_fict: f64,
    pub author: Option<String>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            rounds: 5,
            samples_per_round: 9,
            window_timeout: Duration::from_secs(30),
            stability_threshold: 0.05,
            max_round_retries: 2,
            outlier_retention_fraction: 0.5,
            zp_offset: 0.0,
            zp_fict: 20.50,
            author: None,
        }
    }
}

impl CalibrationConfig {
    /// Check every option against its documented range
    pub fn validate(&self) -> Result<()> {
        if self.rounds < 1 {
            return Err(Error::InvalidInput("rounds must be >= 1".to_string()));
        }
        if self.samples_per_round < 1 {
            return Err(Error::InvalidInput(
                "samples_per_round must be >= 1".to_string(),
            ));
        }
        if self.window_timeout.is_zero() {
            return Err(Error::InvalidInput(
                "window_timeout must be positive".to_string(),
            ));
        }
        if !self.stability_threshold.is_finite() || self.stability_threshold < 0.0 {
            return Err(Error::InvalidInput(format!(
                "stability_threshold must be a non-negative magnitude, got {}",
                self.stability_threshold
            )));
        }
        let f = self.outlier_retention_fraction;
        if !(f > 0.0 && f <= 1.0) {
            return Err(Error::InvalidInput(format!(
                "outlier_retention_fraction must satisfy 0 < f <= 1, got {}",
                f
            )));
        }
        if self.min_retained() > self.retained_after_trim() {
            return Err(Error::InvalidInput(format!(
                "outlier_retention_fraction {} requires {} of {} samples, but trimming keeps {}",
                f,
                self.min_retained(),
                self.samples_per_round,
                self.retained_after_trim()
            )));
        }
        if !self.zp_offset.is_finite() || !self.zp_fict.is_finite() {
            return Err(Error::InvalidInput(
                "zp_offset and zp_fict must be finite".to_string(),
            ));
        }
        Ok(())
    }

    /// Minimum retained samples per channel for a round to be accepted
    pub fn min_retained(&self) -> usize {
        (self.outlier_retention_fraction * self.samples_per_round as f64).ceil() as usize
    }

    /// Samples per channel left after interquartile trimming of a full window
    pub fn retained_after_trim(&self) -> usize {
        let p = self.samples_per_round;
        p - 2 * (p / 4)
    }

    /// Apply overrides; unset fields keep their current value
    pub fn apply(&mut self, overrides: &CalibrationOverrides) {
        if let Some(v) = overrides.rounds {
            self.rounds = v;
        }
        if let Some(v) = overrides.samples_per_round {
            self.samples_per_round = v;
        }
        if let Some(v) = overrides.window_timeout_secs {
            // Negative or NaN collapse to zero and fail validation
            self.window_timeout = Duration::try_from_secs_f64(v).unwrap_or(Duration::ZERO);
        }
        if let Some(v) = overrides.stability_threshold {
            self.stability_threshold = v;
        }
        if let Some(v) = overrides.max_round_retries {
            self.max_round_retries = v;
        }
        if let Some(v) = overrides.outlier_retention_fraction {
            self.outlier_retention_fraction = v;
        }
        if let Some(v) = overrides.zp_offset {
            self.zp_offset = v;
        }
        if let Some(v) = overrides.zp_fict {
            self.zp_fict = v;
        }
        if let Some(v) = &overrides.author {
            self.author = Some(v.clone());
        }
    }

    /// Load settings from the `config_t` table
    ///
    /// For each setting:
    /// 1. Try to read from database
    /// 2. If missing, use the built-in default and write it back
    pub async fn load_settings(pool: &SqlitePool) -> Result<Self> {
        let defaults = Self::default();
        let mut config = defaults.clone();

        config.rounds = get_setting(pool, "rounds", defaults.rounds).await?;
        config.samples_per_round =
            get_setting(pool, "samples_per_round", defaults.samples_per_round).await?;
        let timeout: f64 = get_setting(
            pool,
            "window_timeout_secs",
            defaults.window_timeout.as_secs_f64(),
        )
        .await?;
        config.window_timeout = Duration::try_from_secs_f64(timeout).map_err(|e| {
            Error::Config(format!("window_timeout_secs = {}: {}", timeout, e))
        })?;
        config.stability_threshold =
            get_setting(pool, "stability_threshold", defaults.stability_threshold).await?;
        config.max_round_retries =
            get_setting(pool, "max_round_retries", defaults.max_round_retries).await?;
        config.outlier_retention_fraction = get_setting(
            pool,
            "outlier_retention_fraction",
            defaults.outlier_retention_fraction,
        )
        .await?;
        config.zp_offset = get_setting(pool, "zp_offset", defaults.zp_offset).await?;
        config.zp_fict = get_setting(pool, "zp_fict", defaults.zp_fict).await?;

        config.author = sqlx::query_scalar(
            "SELECT value FROM config_t WHERE section = ? AND property = 'author'",
        )
        .bind(CALIBRATION_SECTION)
        .fetch_optional(pool)
        .await?;

        Ok(config)
    }
}

async fn get_setting<T>(pool: &SqlitePool, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + ToString,
    T::Err: std::fmt::Display,
{
    let value: Option<String> =
        sqlx::query_scalar("SELECT value FROM config_t WHERE section = ? AND property = ?")
            .bind(CALIBRATION_SECTION)
            .bind(key)
            .fetch_optional(pool)
            .await?;

    match value {
        Some(value) => value.trim().parse::<T>().map_err(|e| {
            Error::Config(format!(
                "Setting {}.{} = '{}': {}",
                CALIBRATION_SECTION, key, value, e
            ))
        }),
        None => {
            let default_str = default.to_string();
            info!(
                "Setting '{}' not found in database, using default: {}",
                key, default_str
            );
            sqlx::query("INSERT OR IGNORE INTO config_t (section, property, value) VALUES (?, ?, ?)")
                .bind(CALIBRATION_SECTION)
                .bind(key)
                .bind(&default_str)
                .execute(pool)
                .await?;
            Ok(default)
        }
    }
}

/// Locate the TOML config file
///
/// Priority: explicit path, then `ZPTESS_CONFIG`, then
/// `<config dir>/zptess/config.toml` if it exists.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    dirs::config_dir()
        .map(|d| d.join("zptess").join("config.toml"))
        .filter(|p| p.exists())
}

/// Load TOML config; a missing file yields defaults with a warning
pub fn load_toml(path: Option<&Path>) -> Result<TomlConfig> {
    let Some(path) = path else {
        return Ok(TomlConfig::default());
    };

    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Config file {} not found, using defaults", path.display());
            Ok(TomlConfig::default())
        }
        Err(e) => Err(Error::Io(e)),
    }
}

/// OS-dependent default database location
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("zptess").join("zptess.db"))
        .unwrap_or_else(|| PathBuf::from("./zptess.db"))
}
