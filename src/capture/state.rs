//! Per-signal capture state.

use super::naming::{artifact_stem, format_stamp, unique_path, PLACEHOLDER_STAMP};
use super::{CaptureError, SampleListener};
use crate::cloud::CloudSession;
use crate::sensor::SensorKind;
use crate::stats::SharedCaptureStats;
use crate::transport::Sample;
use chrono::{DateTime, Local};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Whether a capture saw its whole download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    Complete,
    /// The device failed or was cancelled before its data was fully received
    Partial,
}

/// An artifact renamed to its final name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedArtifact {
    pub kind: SensorKind,
    pub path: PathBuf,
    /// Timestamp embedded in the file name
    pub first_sample_ms: i64,
    pub samples: u64,
    pub partial: bool,
}

/// What finalize did with a capture's artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Renamed(FinalizedArtifact),
    /// No sample ever arrived; the header-only file was removed
    Discarded { kind: SensorKind, path: PathBuf },
}

/// Output sink and bookkeeping for one (device, signal) pair.
pub struct CaptureState {
    address: String,
    kind: SensorKind,
    dir: PathBuf,
    placeholder_path: PathBuf,
    sink: BufWriter<File>,
    first_epoch_ms: Option<i64>,
    samples: u64,
    cloud: Option<Arc<dyn CloudSession>>,
    listener: Option<SampleListener>,
    stats: SharedCaptureStats,
}

impl CaptureState {
    /// Open the placeholder-named artifact and write its header.
    pub(crate) fn create(
        dir: &Path,
        address: &str,
        kind: SensorKind,
        cloud: Option<Arc<dyn CloudSession>>,
        listener: Option<SampleListener>,
        stats: SharedCaptureStats,
    ) -> Result<Self, CaptureError> {
        let stem = artifact_stem(PLACEHOLDER_STAMP, address, kind, false);
        let (placeholder_path, file) = unique_path(dir, &stem, |path| {
            File::options().write(true).create_new(true).open(path)
        })?;

        let mut sink = BufWriter::new(file);
        let header = csv_header(kind, &Local::now().format("%:z").to_string());
        sink.write_all(header.as_bytes())
            .map_err(|source| CaptureError::Io {
                path: placeholder_path.clone(),
                source,
            })?;

        tracing::debug!(mac = %address, sensor = %kind, path = ?placeholder_path, "Opened capture");
        Ok(Self {
            address: address.to_string(),
            kind,
            dir: dir.to_path_buf(),
            placeholder_path,
            sink,
            first_epoch_ms: None,
            samples: 0,
            cloud,
            listener,
            stats,
        })
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Path the artifact has until it is finalized.
    pub fn placeholder_path(&self) -> &Path {
        &self.placeholder_path
    }

    /// Timestamp of the first sample, once one has arrived.
    pub fn first_epoch_ms(&self) -> Option<i64> {
        self.first_epoch_ms
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Append a decoded sample.
    ///
    /// The first sample fixes the elapsed-time origin. A sample whose value
    /// does not fit this sensor is rejected without touching the sink.
    pub fn write(&mut self, sample: &Sample) -> Result<(), CaptureError> {
        let fields = self
            .kind
            .write_value(&sample.value)
            .ok_or_else(|| CaptureError::ValueMismatch {
                kind: self.kind,
                value: sample.value.to_string(),
            })?;
        let time = DateTime::from_timestamp_millis(sample.epoch_ms)
            .ok_or(CaptureError::InvalidTimestamp(sample.epoch_ms))?
            .with_timezone(&Local);

        let origin = *self.first_epoch_ms.get_or_insert(sample.epoch_ms);
        let elapsed = (sample.epoch_ms - origin) as f64 / 1000.0;

        writeln!(
            self.sink,
            "{},{},{:.3},{}",
            sample.epoch_ms,
            time.format(super::naming::STAMP_FORMAT),
            elapsed,
            fields
        )
        .map_err(|source| CaptureError::Io {
            path: self.placeholder_path.clone(),
            source,
        })?;
        self.samples += 1;
        self.stats.record_sample_written();

        if let Some(cloud) = &self.cloud {
            if let Err(e) = cloud.record(self.kind, sample) {
                tracing::warn!(mac = %self.address, sensor = %self.kind, "Cloud forward failed: {e}");
            }
        }
        if let Some(listener) = &self.listener {
            listener(&self.address, self.kind, sample);
        }
        Ok(())
    }

    /// Flush and close the sink, then give the artifact its final name.
    pub fn finalize(mut self, completeness: Completeness) -> Result<FinalizeOutcome, CaptureError> {
        self.sink.flush().map_err(|source| CaptureError::Io {
            path: self.placeholder_path.clone(),
            source,
        })?;
        let Self {
            address,
            kind,
            dir,
            placeholder_path,
            sink,
            first_epoch_ms,
            samples,
            stats,
            ..
        } = self;
        drop(sink);

        let Some(first_sample_ms) = first_epoch_ms else {
            std::fs::remove_file(&placeholder_path).map_err(|source| CaptureError::Io {
                path: placeholder_path.clone(),
                source,
            })?;
            tracing::warn!(mac = %address, sensor = %kind, "No samples received, removed empty capture");
            stats.record_artifact_discarded();
            return Ok(FinalizeOutcome::Discarded {
                kind,
                path: placeholder_path,
            });
        };

        let partial = completeness == Completeness::Partial;
        let stem = artifact_stem(&format_stamp(first_sample_ms), &address, kind, partial);
        let (path, ()) = unique_path(&dir, &stem, |path| {
            if path.exists() {
                return Err(std::io::ErrorKind::AlreadyExists.into());
            }
            std::fs::rename(&placeholder_path, path)
        })
        .map_err(|e| match e {
            CaptureError::Io { path: to, source } => CaptureError::Rename {
                from: placeholder_path.clone(),
                to,
                source,
            },
            other => other,
        })?;

        if partial {
            tracing::warn!(mac = %address, sensor = %kind, path = ?path, "Capture is incomplete");
        } else {
            tracing::info!(mac = %address, sensor = %kind, path = ?path, samples, "Capture finalized");
        }
        stats.record_artifact_finalized();
        Ok(FinalizeOutcome::Renamed(FinalizedArtifact {
            kind,
            path,
            first_sample_ms,
            samples,
            partial,
        }))
    }
}

/// Header row of a sensor's artifact.
pub fn csv_header(kind: SensorKind, utc_offset: &str) -> String {
    format!(
        "epoch (ms),time ({utc_offset}),elapsed (s),{}\n",
        kind.csv_columns()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudCredentials, CloudError};
    use crate::stats::create_shared_stats;
    use crate::transport::SampleValue;
    use std::sync::Mutex;

    fn accel(epoch_ms: i64, x: f32) -> Sample {
        Sample::new(epoch_ms, SampleValue::Cartesian { x, y: 0.0, z: 1.0 })
    }

    fn open(dir: &Path, kind: SensorKind) -> CaptureState {
        CaptureState::create(dir, "AA:BB:CC:DD:EE:FF", kind, None, None, create_shared_stats())
            .unwrap()
    }

    #[test]
    fn test_header_and_elapsed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut capture = open(dir.path(), SensorKind::Accelerometer);
        assert_eq!(
            capture.placeholder_path().file_name().unwrap(),
            "@_AABBCCDDEEFF_Accelerometer.csv"
        );

        capture.write(&accel(1_700_000_000_000, 0.5)).unwrap();
        capture.write(&accel(1_700_000_001_250, -0.25)).unwrap();
        assert_eq!(capture.first_epoch_ms(), Some(1_700_000_000_000));
        assert_eq!(capture.samples(), 2);

        let placeholder = capture.placeholder_path().to_path_buf();
        capture.sink.flush().unwrap();
        let content = std::fs::read_to_string(&placeholder).unwrap();
        let lines: Vec<&str> = content.lines().collect();

        assert!(lines[0].starts_with("epoch (ms),time ("));
        assert!(lines[0].ends_with("),elapsed (s),x-axis (g),y-axis (g),z-axis (g)"));

        let first: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(first[0], "1700000000000");
        assert_eq!(first[2], "0.000");
        assert_eq!(&first[3..], &["0.500", "0.000", "1.000"]);

        let second: Vec<&str> = lines[2].split(',').collect();
        assert_eq!(second[2], "1.250");
        assert_eq!(second[3], "-0.250");
    }

    #[test]
    fn test_finalize_renames_to_first_sample() {
        let dir = tempfile::tempdir().unwrap();
        let mut capture = open(dir.path(), SensorKind::Pressure);
        let placeholder = capture.placeholder_path().to_path_buf();

        capture
            .write(&Sample::new(1_700_000_000_123, SampleValue::Scalar(101_325.0)))
            .unwrap();

        let outcome = capture.finalize(Completeness::Complete).unwrap();
        let FinalizeOutcome::Renamed(artifact) = outcome else {
            panic!("expected a renamed artifact");
        };

        assert!(!placeholder.exists());
        assert!(artifact.path.exists());
        assert_eq!(artifact.first_sample_ms, 1_700_000_000_123);
        assert_eq!(
            artifact.path.file_name().unwrap().to_string_lossy(),
            format!("{}_AABBCCDDEEFF_Pressure.csv", format_stamp(1_700_000_000_123))
        );
    }

    #[test]
    fn test_finalize_discards_empty_capture() {
        let dir = tempfile::tempdir().unwrap();
        let capture = open(dir.path(), SensorKind::Gyroscope);
        let placeholder = capture.placeholder_path().to_path_buf();

        let outcome = capture.finalize(Completeness::Complete).unwrap();
        assert!(matches!(outcome, FinalizeOutcome::Discarded { .. }));
        assert!(!placeholder.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_partial_capture_is_marked() {
        let dir = tempfile::tempdir().unwrap();
        let mut capture = open(dir.path(), SensorKind::Accelerometer);
        capture.write(&accel(1_700_000_000_000, 0.0)).unwrap();

        let FinalizeOutcome::Renamed(artifact) = capture.finalize(Completeness::Partial).unwrap()
        else {
            panic!("expected a renamed artifact");
        };
        assert!(artifact.partial);
        assert!(artifact
            .path
            .to_string_lossy()
            .ends_with("_AABBCCDDEEFF_Accelerometer.partial.csv"));
    }

    #[test]
    fn test_wrong_shape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut capture = open(dir.path(), SensorKind::Pressure);
        let err = capture.write(&accel(1_700_000_000_000, 0.0)).unwrap_err();
        assert!(matches!(err, CaptureError::ValueMismatch { .. }));
        assert_eq!(capture.samples(), 0);
        assert_eq!(capture.first_epoch_ms(), None);
    }

    #[test]
    fn test_same_sensor_twice_gets_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = open(dir.path(), SensorKind::Accelerometer);
        let b = open(dir.path(), SensorKind::Accelerometer);
        assert_ne!(a.placeholder_path(), b.placeholder_path());
    }

    struct FailingCloud {
        attempts: Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl CloudSession for FailingCloud {
        fn record(&self, _kind: SensorKind, _sample: &Sample) -> Result<(), CloudError> {
            *self.attempts.lock().unwrap() += 1;
            Err(CloudError::Rejected("offline".to_string()))
        }

        fn pending(&self) -> usize {
            0
        }

        async fn sync(&self, _credentials: &CloudCredentials) -> Result<(), CloudError> {
            Ok(())
        }
    }

    #[test]
    fn test_cloud_failure_does_not_block_sink() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(FailingCloud {
            attempts: Mutex::new(0),
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_listener = Arc::clone(&seen);
        let listener: SampleListener = Arc::new(move |_addr: &str, kind: SensorKind, sample: &Sample| {
            seen_by_listener.lock().unwrap().push((kind, sample.epoch_ms));
        });

        let mut capture = CaptureState::create(
            dir.path(),
            "AA:BB:CC:DD:EE:FF",
            SensorKind::Accelerometer,
            Some(cloud.clone() as Arc<dyn CloudSession>),
            Some(listener),
            create_shared_stats(),
        )
        .unwrap();

        capture.write(&accel(1_700_000_000_000, 0.1)).unwrap();
        capture.write(&accel(1_700_000_000_010, 0.2)).unwrap();

        assert_eq!(capture.samples(), 2);
        assert_eq!(*cloud.attempts.lock().unwrap(), 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (SensorKind::Accelerometer, 1_700_000_000_000),
                (SensorKind::Accelerometer, 1_700_000_000_010)
            ]
        );
    }
}
