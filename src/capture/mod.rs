//! Capture state store.
//!
//! Every (device, signal) pair being recorded gets a [`CaptureState`]: an
//! open CSV sink named with a `@` placeholder stamp, the timestamp of the
//! first sample it saw, and an optional cloud session it forwards to. When
//! the device is done the capture is finalized exactly once, which renames
//! the file after its first sample.
//!
//! ```text
//! @_AABBCCDDEEFF_Accelerometer.csv                       while recording
//! 2024-03-01T14-05-09.120_AABBCCDDEEFF_Accelerometer.csv  after finalize
//! ```

mod naming;
mod state;

pub use naming::{artifact_stem, format_stamp, PLACEHOLDER_STAMP};
pub use state::{csv_header, CaptureState, Completeness, FinalizeOutcome, FinalizedArtifact};

use crate::cloud::CloudSession;
use crate::sensor::SensorKind;
use crate::stats::SharedCaptureStats;
use crate::transport::Sample;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Observer called for every sample a capture accepts.
///
/// Arguments are the device address, the sensor and the sample.
pub type SampleListener = Arc<dyn Fn(&str, SensorKind, &Sample) + Send + Sync>;

/// Capture errors.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind} capture cannot store value {value}")]
    ValueMismatch { kind: SensorKind, value: String },

    #[error("sample timestamp {0} is out of range")]
    InvalidTimestamp(i64),

    #[error("failed to rename {from:?} to {to:?}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CaptureError {
    /// A rejected sample that leaves the capture usable.
    pub fn is_sample_error(&self) -> bool {
        matches!(self, Self::ValueMismatch { .. } | Self::InvalidTimestamp(_))
    }
}

/// Creates captures under one output directory.
#[derive(Clone)]
pub struct CaptureStore {
    dir: PathBuf,
    listener: Option<SampleListener>,
    stats: SharedCaptureStats,
}

impl CaptureStore {
    /// Create a store, making the output directory if needed.
    pub fn new(dir: impl Into<PathBuf>, stats: SharedCaptureStats) -> Result<Self, CaptureError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| CaptureError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            listener: None,
            stats,
        })
    }

    /// Attach an observer to every capture this store creates.
    pub fn with_listener(mut self, listener: SampleListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stats(&self) -> &SharedCaptureStats {
        &self.stats
    }

    /// Open a new capture for a device's signal.
    pub fn create(
        &self,
        address: &str,
        kind: SensorKind,
        cloud: Option<Arc<dyn CloudSession>>,
    ) -> Result<CaptureState, CaptureError> {
        CaptureState::create(
            &self.dir,
            address,
            kind,
            cloud,
            self.listener.clone(),
            Arc::clone(&self.stats),
        )
    }

    /// Finalize a device's captures.
    ///
    /// Every capture is attempted even when an earlier one fails; the first
    /// failure is returned after the rest are done.
    pub fn finalize_all(
        &self,
        captures: Vec<CaptureState>,
        completeness: Completeness,
    ) -> Result<Vec<FinalizeOutcome>, CaptureError> {
        let mut outcomes = Vec::with_capacity(captures.len());
        let mut first_error = None;
        for capture in captures {
            match capture.finalize(completeness) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::error!("Failed to finalize capture: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::create_shared_stats;
    use crate::transport::SampleValue;

    #[test]
    fn test_store_creates_output_dir() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("captures").join("today");
        let store = CaptureStore::new(&dir, create_shared_stats()).unwrap();
        assert!(dir.is_dir());
        assert_eq!(store.dir(), dir.as_path());
    }

    #[test]
    fn test_finalize_all_counts() {
        let dir = tempfile::tempdir().unwrap();
        let stats = create_shared_stats();
        let store = CaptureStore::new(dir.path(), Arc::clone(&stats)).unwrap();

        let mut pressure = store
            .create("AA:BB:CC:DD:EE:FF", SensorKind::Pressure, None)
            .unwrap();
        pressure
            .write(&Sample::new(1_700_000_000_000, SampleValue::Scalar(99_000.0)))
            .unwrap();
        let gyro = store
            .create("AA:BB:CC:DD:EE:FF", SensorKind::Gyroscope, None)
            .unwrap();

        let outcomes = store
            .finalize_all(vec![pressure, gyro], Completeness::Complete)
            .unwrap();
        assert_eq!(outcomes.len(), 2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.artifacts_finalized, 1);
        assert_eq!(snapshot.artifacts_discarded, 1);
        assert_eq!(snapshot.samples_written, 1);

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(!names[0].starts_with(PLACEHOLDER_STAMP));
    }

    #[test]
    fn test_listener_sees_samples() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let store = CaptureStore::new(dir.path(), create_shared_stats())
            .unwrap()
            .with_listener(Arc::new(move |_: &str, _: SensorKind, _: &Sample| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }));

        let mut capture = store
            .create("AA:BB:CC:DD:EE:FF", SensorKind::Humidity, None)
            .unwrap();
        capture
            .write(&Sample::new(1_700_000_000_000, SampleValue::Scalar(40.0)))
            .unwrap();
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
