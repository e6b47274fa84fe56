//! Backup and restore orchestration.
//!
//! Each executor drives one run against a server API and an archive directory.

pub mod backup;
pub mod restore;

#[cfg(test)]
pub(crate) mod mock;

pub use backup::{BackupExecutor, BackupParams, BackupResult};
pub use restore::{RestoreExecutor, RestoreParams, RestoreResult};

use chrono::{DateTime, Utc};

/// Layout of the base name shared by every file of one backup run.
const BACKUP_NAME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Base file name for a backup taken at `at`, e.g. `20211201T153000Z`.
pub fn backup_base_name(at: DateTime<Utc>) -> String {
    at.format(BACKUP_NAME_FORMAT).to_string()
}
