//! Decoded sensor values.
//!
//! This module contains the measurement types produced from characteristic
//! notifications and the per-kind queues that hold them for consumers.

pub mod measurement;
pub mod sink;

pub use measurement::{
    BatteryLevelMeasurement, Encoding, HumidityMeasurement, Measurement, MeasurementKind, Sample,
    TemperatureMeasurement,
};
pub use sink::{SampleReceiver, SampleSink};
