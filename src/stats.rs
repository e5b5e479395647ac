//! Run statistics.
//!
//! Counts what a capture run did so the CLI can print an honest summary at
//! exit, including the entries that were dropped along the way.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for one run.
#[derive(Debug)]
pub struct CaptureStats {
    /// Devices that completed the initial connect
    devices_connected: AtomicU64,
    /// Devices whose capture finished cleanly
    devices_completed: AtomicU64,
    /// Devices abandoned after an error
    devices_failed: AtomicU64,
    /// Samples appended to artifacts
    samples_written: AtomicU64,
    /// Log entries with an unmappable type tag
    unknown_entries: AtomicU64,
    /// Log entries that arrived outside a subscription
    unhandled_entries: AtomicU64,
    /// Artifacts renamed to their final name
    artifacts_finalized: AtomicU64,
    /// Empty artifacts removed at finalize
    artifacts_discarded: AtomicU64,
    /// Run start time
    run_start: DateTime<Utc>,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self {
            devices_connected: AtomicU64::new(0),
            devices_completed: AtomicU64::new(0),
            devices_failed: AtomicU64::new(0),
            samples_written: AtomicU64::new(0),
            unknown_entries: AtomicU64::new(0),
            unhandled_entries: AtomicU64::new(0),
            artifacts_finalized: AtomicU64::new(0),
            artifacts_discarded: AtomicU64::new(0),
            run_start: Utc::now(),
        }
    }

    pub fn record_device_connected(&self) {
        self.devices_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_device_completed(&self) {
        self.devices_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_device_failed(&self) {
        self.devices_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sample_written(&self) {
        self.samples_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_entry(&self) {
        self.unknown_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unhandled_entry(&self) {
        self.unhandled_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_artifact_finalized(&self) {
        self.artifacts_finalized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_artifact_discarded(&self) {
        self.artifacts_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            devices_connected: self.devices_connected.load(Ordering::Relaxed),
            devices_completed: self.devices_completed.load(Ordering::Relaxed),
            devices_failed: self.devices_failed.load(Ordering::Relaxed),
            samples_written: self.samples_written.load(Ordering::Relaxed),
            unknown_entries: self.unknown_entries.load(Ordering::Relaxed),
            unhandled_entries: self.unhandled_entries.load(Ordering::Relaxed),
            artifacts_finalized: self.artifacts_finalized.load(Ordering::Relaxed),
            artifacts_discarded: self.artifacts_discarded.load(Ordering::Relaxed),
            run_start: self.run_start,
            run_duration_secs: (Utc::now() - self.run_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.snapshot();
        format!(
            "Run Statistics:\n\
             - Devices connected: {}\n\
             - Devices completed: {}\n\
             - Devices failed: {}\n\
             - Samples written: {}\n\
             - Unknown log entries dropped: {}\n\
             - Unhandled log entries dropped: {}\n\
             - Files finalized: {}\n\
             - Empty files removed: {}\n\
             - Run duration: {} seconds",
            stats.devices_connected,
            stats.devices_completed,
            stats.devices_failed,
            stats.samples_written,
            stats.unknown_entries,
            stats.unhandled_entries,
            stats.artifacts_finalized,
            stats.artifacts_discarded,
            stats.run_duration_secs
        )
    }
}

impl Default for CaptureStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub devices_connected: u64,
    pub devices_completed: u64,
    pub devices_failed: u64,
    pub samples_written: u64,
    pub unknown_entries: u64,
    pub unhandled_entries: u64,
    pub artifacts_finalized: u64,
    pub artifacts_discarded: u64,
    pub run_start: DateTime<Utc>,
    pub run_duration_secs: u64,
}

/// Thread-safe shared statistics.
pub type SharedCaptureStats = Arc<CaptureStats>;

/// Create a new shared statistics block.
pub fn create_shared_stats() -> SharedCaptureStats {
    Arc::new(CaptureStats::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting() {
        let stats = CaptureStats::new();

        stats.record_sample_written();
        stats.record_sample_written();
        stats.record_unknown_entry();
        stats.record_device_connected();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.samples_written, 2);
        assert_eq!(snapshot.unknown_entries, 1);
        assert_eq!(snapshot.devices_connected, 1);
        assert_eq!(snapshot.unhandled_entries, 0);
    }

    #[test]
    fn test_summary_format() {
        let stats = CaptureStats::new();
        let summary = stats.summary();

        assert!(summary.contains("Devices connected"));
        assert!(summary.contains("Samples written"));
        assert!(summary.contains("Unknown log entries dropped"));
    }
}
