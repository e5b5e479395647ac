//! Sensor capability table.
//!
//! Every sensor the agent knows about is a [`SensorKind`] variant. The
//! board-side register programming is the transport's business; this module
//! owns the naming, the identifier mapping used by logged signals and the
//! CSV layout of each sensor's samples.

use crate::transport::{Board, SampleValue, SignalHandle, TransportError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The sensors a board can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensorKind {
    Accelerometer,
    AmbientLight,
    Pressure,
    Humidity,
    Gyroscope,
    Magnetometer,
    Quaternion,
    EulerAngles,
    Gravity,
    LinearAcceleration,
}

/// Layout of a sensor's decoded values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    Scalar,
    Cartesian,
    Quaternion,
    Euler,
}

// `ALL` lists every variant exactly once, in `index()` order.
const _: () = {
    let mut i = 0;
    while i < SensorKind::ALL.len() {
        assert!(SensorKind::ALL[i].index() == i);
        i += 1;
    }
    assert!(SensorKind::ALL.len() == SensorKind::LinearAcceleration.index() + 1);
};

impl SensorKind {
    /// Every known sensor, in display order.
    pub const ALL: [SensorKind; 10] = [
        SensorKind::Accelerometer,
        SensorKind::AmbientLight,
        SensorKind::Pressure,
        SensorKind::Humidity,
        SensorKind::Gyroscope,
        SensorKind::Magnetometer,
        SensorKind::Quaternion,
        SensorKind::EulerAngles,
        SensorKind::Gravity,
        SensorKind::LinearAcceleration,
    ];

    /// Human-readable name, also used in config files and artifact names.
    pub fn name(self) -> &'static str {
        match self {
            SensorKind::Accelerometer => "Accelerometer",
            SensorKind::AmbientLight => "Ambient Light",
            SensorKind::Pressure => "Pressure",
            SensorKind::Humidity => "Humidity",
            SensorKind::Gyroscope => "Gyroscope",
            SensorKind::Magnetometer => "Magnetometer",
            SensorKind::Quaternion => "Quaternion",
            SensorKind::EulerAngles => "Euler Angles",
            SensorKind::Gravity => "Gravity",
            SensorKind::LinearAcceleration => "Linear Acceleration",
        }
    }

    /// Identifier the board uses for logged signals of this sensor.
    pub fn identifier(self) -> &'static str {
        match self {
            SensorKind::Accelerometer => "acceleration",
            SensorKind::AmbientLight => "illuminance",
            SensorKind::Pressure => "pressure",
            SensorKind::Humidity => "relative-humidity",
            SensorKind::Gyroscope => "angular-velocity",
            SensorKind::Magnetometer => "magnetic-field",
            SensorKind::Quaternion => "quaternion",
            SensorKind::EulerAngles => "euler-angles",
            SensorKind::Gravity => "gravity",
            SensorKind::LinearAcceleration => "linear-acceleration",
        }
    }

    /// Map a logged-signal identifier back to its sensor.
    pub fn from_identifier(identifier: &str) -> Option<SensorKind> {
        let kind = match identifier {
            "acceleration" => SensorKind::Accelerometer,
            "illuminance" => SensorKind::AmbientLight,
            "pressure" => SensorKind::Pressure,
            "relative-humidity" => SensorKind::Humidity,
            "angular-velocity" => SensorKind::Gyroscope,
            "magnetic-field" => SensorKind::Magnetometer,
            "quaternion" => SensorKind::Quaternion,
            "euler-angles" => SensorKind::EulerAngles,
            "gravity" => SensorKind::Gravity,
            "linear-acceleration" => SensorKind::LinearAcceleration,
            _ => return None,
        };
        Some(kind)
    }

    /// Position of this sensor in [`SensorKind::ALL`].
    pub const fn index(self) -> usize {
        match self {
            SensorKind::Accelerometer => 0,
            SensorKind::AmbientLight => 1,
            SensorKind::Pressure => 2,
            SensorKind::Humidity => 3,
            SensorKind::Gyroscope => 4,
            SensorKind::Magnetometer => 5,
            SensorKind::Quaternion => 6,
            SensorKind::EulerAngles => 7,
            SensorKind::Gravity => 8,
            SensorKind::LinearAcceleration => 9,
        }
    }

    pub fn shape(self) -> ValueShape {
        match self {
            SensorKind::AmbientLight | SensorKind::Pressure | SensorKind::Humidity => {
                ValueShape::Scalar
            }
            SensorKind::Quaternion => ValueShape::Quaternion,
            SensorKind::EulerAngles => ValueShape::Euler,
            SensorKind::Accelerometer
            | SensorKind::Gyroscope
            | SensorKind::Magnetometer
            | SensorKind::Gravity
            | SensorKind::LinearAcceleration => ValueShape::Cartesian,
        }
    }

    /// Sensor-specific CSV columns.
    pub fn csv_columns(self) -> &'static str {
        match self {
            SensorKind::Accelerometer | SensorKind::Gravity | SensorKind::LinearAcceleration => {
                "x-axis (g),y-axis (g),z-axis (g)"
            }
            SensorKind::Gyroscope => "x-axis (deg/s),y-axis (deg/s),z-axis (deg/s)",
            SensorKind::Magnetometer => "x-axis (T),y-axis (T),z-axis (T)",
            SensorKind::AmbientLight => "illuminance (lx)",
            SensorKind::Pressure => "pressure (Pa)",
            SensorKind::Humidity => "relative humidity (%)",
            SensorKind::Quaternion => "w (number),x (number),y (number),z (number)",
            SensorKind::EulerAngles => "heading (deg),pitch (deg),roll (deg),yaw (deg)",
        }
    }

    /// Decimal places used when writing values.
    pub fn precision(self) -> usize {
        match self {
            SensorKind::Magnetometer => 9,
            _ => 3,
        }
    }

    /// Format a decoded value as CSV fields.
    ///
    /// Returns `None` when the value's layout does not belong to this sensor.
    pub fn write_value(self, value: &SampleValue) -> Option<String> {
        let p = self.precision();
        let fields = match (self.shape(), value) {
            (ValueShape::Scalar, SampleValue::Scalar(v)) => format!("{v:.p$}"),
            (ValueShape::Cartesian, SampleValue::Cartesian { x, y, z }) => {
                format!("{x:.p$},{y:.p$},{z:.p$}")
            }
            (ValueShape::Quaternion, SampleValue::Quaternion { w, x, y, z }) => {
                format!("{w:.p$},{x:.p$},{y:.p$},{z:.p$}")
            }
            (
                ValueShape::Euler,
                SampleValue::Euler {
                    heading,
                    pitch,
                    roll,
                    yaw,
                },
            ) => format!("{heading:.p$},{pitch:.p$},{roll:.p$},{yaw:.p$}"),
            _ => return None,
        };
        Some(fields)
    }

    /// Whether the board carries this sensor.
    pub fn exists<B: Board>(self, board: &B) -> bool {
        board.has_sensor(self)
    }

    /// Program the sensor's output data rate.
    pub async fn configure<B: Board>(self, board: &mut B, odr_hz: f32) -> Result<(), TransportError> {
        board.configure_sensor(self, odr_hz).await
    }

    /// Start sampling.
    pub fn start<B: Board>(self, board: &mut B) -> Result<(), TransportError> {
        board.start_sensor(self)
    }

    /// Live data signal of this sensor.
    pub fn signal<B: Board>(self, board: &mut B) -> Result<SignalHandle, TransportError> {
        board.sensor_signal(self)
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error for sensor names that are not in the table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{0}' is not a valid sensor name")]
pub struct UnknownSensor(pub String);

impl FromStr for SensorKind {
    type Err = UnknownSensor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownSensor(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_table_round_trips() {
        for kind in SensorKind::ALL {
            assert_eq!(SensorKind::from_identifier(kind.identifier()), Some(kind));
            assert_eq!(SensorKind::ALL[kind.index()], kind);
        }
        assert_eq!(SensorKind::from_identifier("temperature"), None);
    }

    #[test]
    fn test_sensor_names_parse() {
        assert_eq!("Euler Angles".parse(), Ok(SensorKind::EulerAngles));
        assert_eq!("accelerometer".parse(), Ok(SensorKind::Accelerometer));
        assert_eq!(
            "Thermometer".parse::<SensorKind>(),
            Err(UnknownSensor("Thermometer".to_string()))
        );
    }

    #[test]
    fn test_write_value_precision() {
        let acc = SampleValue::Cartesian {
            x: 0.5,
            y: -1.0,
            z: 0.0123,
        };
        assert_eq!(
            SensorKind::Accelerometer.write_value(&acc).as_deref(),
            Some("0.500,-1.000,0.012")
        );

        let mag = SampleValue::Cartesian {
            x: 0.000_025,
            y: 0.0,
            z: -0.000_001,
        };
        let written = SensorKind::Magnetometer.write_value(&mag).unwrap();
        assert_eq!(written.split(',').count(), 3);
        assert!(written.split(',').all(|f| f.split('.').nth(1).unwrap().len() == 9));

        assert_eq!(
            SensorKind::Pressure
                .write_value(&SampleValue::Scalar(101_325.5))
                .as_deref(),
            Some("101325.500")
        );
    }

    #[test]
    fn test_write_value_rejects_wrong_shape() {
        assert_eq!(
            SensorKind::Pressure.write_value(&SampleValue::Cartesian {
                x: 0.0,
                y: 0.0,
                z: 0.0
            }),
            None
        );
    }

    #[test]
    fn test_column_count_matches_shape() {
        for kind in SensorKind::ALL {
            let columns = kind.csv_columns().split(',').count();
            let expected = match kind.shape() {
                ValueShape::Scalar => 1,
                ValueShape::Cartesian => 3,
                ValueShape::Quaternion | ValueShape::Euler => 4,
            };
            assert_eq!(columns, expected, "{kind}");
        }
    }
}
