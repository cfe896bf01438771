//! # ZPTESS Common Library
//!
//! Shared code for the photometer calibration tools:
//! - Database initialization and the Batch/Summary/Round/Sample models
//! - Calibration event types and the event bus
//! - Configuration loading (TOML bootstrap, settings table, defaults)
//! - Common error type

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
