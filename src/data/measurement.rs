//! Measurement types and characteristic value decoding.
//!
//! Sensors report values as small fixed-point integers. The
//! [`Encoding`] of a characteristic describes how its raw notification
//! payload becomes a number; the [`MeasurementKind`] says what that number
//! means.

use chrono::{DateTime, Utc};

use crate::ble::platform::PeripheralAddress;
use crate::error::{Error, Result};

/// How a characteristic payload is turned into a numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Encoding {
    /// Two bytes, value in hundredths of a unit.
    ///
    /// `value = byte[1] * 256 + unsigned(byte[0])`, divided by `100.0`.
    /// `byte[1]` keeps its signed interpretation, only `byte[0]` is read as
    /// unsigned, so `[0x00, 0xFF]` is `-2.56`.
    Hundredths,
    /// A single unsigned byte.
    Uint8,
}

impl Encoding {
    /// Decode a raw payload. Extra trailing bytes are ignored.
    ///
    /// # Example
    ///
    /// ```
    /// use ble_relay::data::Encoding;
    ///
    /// let value = Encoding::Hundredths.decode(&[0x88, 0x0B]).unwrap();
    /// assert_eq!(value, 29.52);
    /// ```
    pub fn decode(&self, data: &[u8]) -> Result<f32> {
        match self {
            Self::Hundredths => match data {
                [b0, b1, ..] => Ok(decode_hundredths(*b0, *b1)),
                _ => Err(Error::InvalidData {
                    context: format!("expected at least 2 bytes, got {}", data.len()),
                }),
            },
            Self::Uint8 => data.first().map(|b| *b as f32).ok_or(Error::InvalidData {
                context: "expected at least 1 byte, got 0".to_string(),
            }),
        }
    }
}

/// Fixed-point hundredths from a byte pair.
#[inline]
pub fn decode_hundredths(b0: u8, b1: u8) -> f32 {
    let raw = (b1 as i8 as i32) * 256 + b0 as i32;
    raw as f32 / 100.0
}

/// The kind of value a measurement carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MeasurementKind {
    /// Temperature in °C.
    Temperature,
    /// Relative humidity in %.
    Humidity,
    /// Battery charge in %.
    BatteryLevel,
}

impl MeasurementKind {
    /// All known kinds.
    pub const ALL: [MeasurementKind; 3] = [Self::Temperature, Self::Humidity, Self::BatteryLevel];

    /// Name used for the time-series measurement.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::BatteryLevel => "battery_level",
        }
    }
}

impl std::fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A temperature reading.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TemperatureMeasurement {
    /// Degrees Celsius.
    pub value: f32,
}

/// A relative humidity reading.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HumidityMeasurement {
    /// Percent relative humidity.
    pub value: f32,
}

/// A battery level reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BatteryLevelMeasurement {
    /// Remaining charge, 0-100.
    pub percent: u8,
}

/// A decoded measurement, one variant per domain.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Measurement {
    /// Temperature reading.
    Temperature(TemperatureMeasurement),
    /// Humidity reading.
    Humidity(HumidityMeasurement),
    /// Battery level reading.
    BatteryLevel(BatteryLevelMeasurement),
}

impl Measurement {
    /// Build a measurement of the given kind from a decoded value.
    pub fn new(kind: MeasurementKind, value: f32) -> Self {
        match kind {
            MeasurementKind::Temperature => Self::Temperature(TemperatureMeasurement { value }),
            MeasurementKind::Humidity => Self::Humidity(HumidityMeasurement { value }),
            MeasurementKind::BatteryLevel => Self::BatteryLevel(BatteryLevelMeasurement {
                percent: value.clamp(0.0, u8::MAX as f32) as u8,
            }),
        }
    }

    /// Get the kind of this measurement.
    pub fn kind(&self) -> MeasurementKind {
        match self {
            Self::Temperature(_) => MeasurementKind::Temperature,
            Self::Humidity(_) => MeasurementKind::Humidity,
            Self::BatteryLevel(_) => MeasurementKind::BatteryLevel,
        }
    }

    /// Get the numeric value.
    pub fn value(&self) -> f32 {
        match self {
            Self::Temperature(m) => m.value,
            Self::Humidity(m) => m.value,
            Self::BatteryLevel(m) => m.percent as f32,
        }
    }
}

/// A measurement together with where and when it was taken.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Sample {
    /// The decoded measurement.
    pub measurement: Measurement,
    /// Address of the peripheral that reported it.
    pub peripheral: PeripheralAddress,
    /// Advertised name of the peripheral, if known.
    pub peripheral_name: Option<String>,
    /// Time the notification was decoded.
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    /// Create a sample stamped with the current time.
    pub fn now(measurement: Measurement, peripheral: PeripheralAddress) -> Self {
        Self {
            measurement,
            peripheral,
            peripheral_name: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the peripheral's advertised name.
    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.peripheral_name = name;
        self
    }

    /// Kind of the carried measurement.
    pub fn kind(&self) -> MeasurementKind {
        self.measurement.kind()
    }
}
