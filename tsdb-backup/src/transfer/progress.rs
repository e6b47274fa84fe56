//! Byte accounting for a backup or restore run.

use std::time::{Duration, Instant};

/// Running totals of files and bytes moved in one run.
#[derive(Debug, Clone)]
pub struct TransferStats {
    started: Instant,
    pub files: usize,
    pub bytes: u64,
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            files: 0,
            bytes: 0,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.files += 1;
        self.bytes += bytes;
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// e.g. `"3 files, 1.50 MB in 2s"`.
    pub fn summary(&self) -> String {
        format!(
            "{} files, {} in {}",
            self.files,
            format_bytes(self.bytes),
            format_duration(self.elapsed().as_secs())
        )
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{:.2} {}", size, UNITS[unit])
}

pub fn format_duration(seconds: u64) -> String {
    match seconds {
        0..=59 => format!("{}s", seconds),
        60..=3599 => format!("{}m {}s", seconds / 60, seconds % 60),
        _ => format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
    }

    #[test]
    fn test_stats_summary() {
        let mut stats = TransferStats::new();
        stats.record(1024);
        stats.record(512);
        assert_eq!(stats.files, 2);
        assert_eq!(stats.bytes, 1536);
        assert!(stats.summary().starts_with("2 files, 1.50 KB in "));
    }
}
