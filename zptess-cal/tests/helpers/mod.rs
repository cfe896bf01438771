//! Test Helper Utilities
//!
//! Shared utilities for testing zptess-cal

#![allow(dead_code)]

pub mod db_utils;
pub mod sample_feed;

// Re-export commonly used items
pub use db_utils::{
    count_rows, create_test_db, make_record, register_pair, test_config, StorageCounts,
};
pub use sample_feed::{queue_pair, wait_for_round, ChannelFeed};
