//! Artifact file names.

use super::CaptureError;
use crate::sensor::SensorKind;
use chrono::{DateTime, Local};
use std::io;
use std::path::{Path, PathBuf};

/// Stamp used in a file name until the first sample is known.
pub const PLACEHOLDER_STAMP: &str = "@";

/// Local-time format of file name stamps and the CSV `time` column.
pub(crate) const STAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3f";

/// Attempts before giving up on finding a free name.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Format an epoch timestamp the way file names carry it.
pub fn format_stamp(epoch_ms: i64) -> String {
    match DateTime::from_timestamp_millis(epoch_ms) {
        Some(time) => time.with_timezone(&Local).format(STAMP_FORMAT).to_string(),
        None => epoch_ms.to_string(),
    }
}

/// `{stamp}_{ADDRESS}_{Sensor}`, with the address uppercased and stripped of colons.
pub fn artifact_stem(stamp: &str, address: &str, kind: SensorKind, partial: bool) -> String {
    let address: String = address
        .chars()
        .filter(|c| *c != ':')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let marker = if partial { ".partial" } else { "" };
    format!("{stamp}_{address}_{}{marker}", kind.name())
}

/// Run `claim` against `{stem}.csv`, then `{stem}-2.csv` and so on until
/// it stops reporting that the name is taken.
pub(crate) fn unique_path<T, F>(dir: &Path, stem: &str, mut claim: F) -> Result<(PathBuf, T), CaptureError>
where
    F: FnMut(&Path) -> io::Result<T>,
{
    let mut last = dir.join(format!("{stem}.csv"));
    for attempt in 1..=MAX_NAME_ATTEMPTS {
        let path = if attempt == 1 {
            last.clone()
        } else {
            dir.join(format!("{stem}-{attempt}.csv"))
        };
        match claim(&path) {
            Ok(value) => return Ok((path, value)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => last = path,
            Err(source) => return Err(CaptureError::Io { path, source }),
        }
    }
    Err(CaptureError::Io {
        path: last,
        source: io::ErrorKind::AlreadyExists.into(),
    })
}
