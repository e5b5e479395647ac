//! Value types exchanged with the radio transport.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque per-session handle to a data signal on a board.
///
/// Handles are only meaningful for the board (and connection) that issued
/// them; they are never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignalHandle(pub u32);

/// A decoded sample value.
///
/// Boards parse their raw wire format into one of these shapes before
/// handing samples to the host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SampleValue {
    /// Single-channel reading (pressure, illuminance, humidity)
    Scalar(f32),
    /// Three-axis reading
    Cartesian { x: f32, y: f32, z: f32 },
    /// Orientation quaternion
    Quaternion { w: f32, x: f32, y: f32, z: f32 },
    /// Orientation as Euler angles in degrees
    Euler {
        heading: f32,
        pitch: f32,
        roll: f32,
        yaw: f32,
    },
}

/// A decoded sample with its device-side timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Milliseconds since the Unix epoch, as reported by the board
    pub epoch_ms: i64,
    pub value: SampleValue,
}

impl Sample {
    pub fn new(epoch_ms: i64, value: SampleValue) -> Self {
        Self { epoch_ms, value }
    }
}

impl std::fmt::Display for SampleValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleValue::Scalar(v) => write!(f, "{v}"),
            SampleValue::Cartesian { x, y, z } => write!(f, "{{x: {x}, y: {y}, z: {z}}}"),
            SampleValue::Quaternion { w, x, y, z } => {
                write!(f, "{{w: {w}, x: {x}, y: {y}, z: {z}}}")
            }
            SampleValue::Euler {
                heading,
                pitch,
                roll,
                yaw,
            } => write!(
                f,
                "{{heading: {heading}, pitch: {pitch}, roll: {roll}, yaw: {yaw}}}"
            ),
        }
    }
}

/// A signal the board reports as currently being logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSignal {
    pub handle: SignalHandle,
    /// Board-side identifier string, e.g. `acceleration`
    pub identifier: String,
}

/// Reply to an anonymous signal request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalsReply {
    /// The board materialized a handle for every logged signal
    Signals(Vec<RawSignal>),
    /// The board answered with a non-zero error status instead
    Status(i32),
}

/// An advertisement seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Hardware address, colon-delimited hex octets
    pub address: String,
    /// Advertised local name, if any
    pub local_name: Option<String>,
    /// Raw manufacturer data (first two bytes are the company id)
    pub manufacturer_data: Option<Vec<u8>>,
}

impl Advertisement {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            local_name: None,
            manufacturer_data: None,
        }
    }

    /// Whether this advertisement came from `address` (case-insensitive).
    pub fn matches(&self, address: &str) -> bool {
        self.address.eq_ignore_ascii_case(address)
    }

    /// Device name carried in the manufacturer data, if present.
    pub fn manufacturer_name(&self) -> Option<String> {
        let data = self.manufacturer_data.as_ref()?;
        let name: String = data
            .get(2..)?
            .iter()
            .map(|&b| b as char)
            .filter(|c| !c.is_control())
            .collect();
        let name = name.trim().to_string();
        (!name.is_empty()).then_some(name)
    }
}

/// Static description of a board, read during setup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardInfo {
    pub model: String,
    pub firmware_revision: String,
}

/// Notifications delivered by a board, in FIFO order.
#[derive(Debug, Clone, PartialEq)]
pub enum BoardEvent {
    /// The link dropped (requested or not)
    Disconnected,
    /// Log download progress
    Progress {
        entries_left: u32,
        total_entries: u32,
    },
    /// A decoded sample for a subscribed signal
    Data { signal: SignalHandle, sample: Sample },
    /// A log entry whose sensor type tag could not be mapped
    UnknownEntry {
        id: u8,
        epoch_ms: i64,
        data: Vec<u8>,
    },
    /// A known log entry that arrived outside an active subscription
    UnhandledEntry(Sample),
}

/// Errors raised by the radio transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("a discovery scan is already active")]
    ScanInProgress,

    #[error("device {0} is no longer available")]
    Unavailable(String),

    #[error("setup failed: {0}")]
    Setup(String),

    #[error("device is not connected")]
    NotConnected,

    #[error("sensor is not present on this board")]
    NoSuchSensor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertisement_matches_ignoring_case() {
        let adv = Advertisement::new("aa:bb:cc:dd:ee:ff");
        assert!(adv.matches("AA:BB:CC:DD:EE:FF"));
        assert!(!adv.matches("AA:BB:CC:DD:EE:00"));
    }

    #[test]
    fn test_manufacturer_name_skips_company_id() {
        let mut adv = Advertisement::new("AA:BB:CC:DD:EE:FF");
        assert_eq!(adv.manufacturer_name(), None);

        let mut data = vec![0x7e, 0x02];
        data.extend_from_slice(b"LeftWrist");
        adv.manufacturer_data = Some(data);
        assert_eq!(adv.manufacturer_name().as_deref(), Some("LeftWrist"));

        adv.manufacturer_data = Some(vec![0x7e, 0x02]);
        assert_eq!(adv.manufacturer_name(), None);
    }

    #[test]
    fn test_sample_value_display() {
        let value = SampleValue::Cartesian {
            x: 1.0,
            y: -0.5,
            z: 0.25,
        };
        assert_eq!(value.to_string(), "{x: 1, y: -0.5, z: 0.25}");
    }
}
