//! tsdb-backup library
//!
//! Backup and restore of InfluxDB 2.x metadata and time-series shards into
//! versioned on-disk archives.

pub mod api;
pub mod config;
pub mod executor;
pub mod legacy;
pub mod manifest;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::BackupError;
pub use utils::Result;
