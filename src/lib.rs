// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-relay
//!
//! A cross-platform Rust library that discovers Bluetooth Low Energy sensor
//! peripherals, keeps a connection to them, decodes their characteristic
//! notifications into typed measurements, and relays those measurements to
//! local consumers and an optional time-series database.
//!
//! ## Features
//!
//! - **Adapter Monitoring**: Scanning starts as soon as the radio is powered on
//! - **Service-filtered Discovery**: Only peripherals advertising a target service are picked up
//! - **Connection Supervision**: Dropped links are retried after a 15 second check
//! - **Table-driven Decoding**: Temperature, humidity and battery level out of the box
//! - **Per-kind Sample Queues**: Non-blocking producer, one consumer per measurement kind
//! - **Cloud Forwarding**: Fire-and-forget points in InfluxDB line protocol
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_relay::{BleRelay, LoggingSink, MeasurementKind, RelayConfig, Result};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let relay = BleRelay::with_btleplug(Some(Arc::new(LoggingSink)), RelayConfig::default()).await?;
//!     relay.start().await?;
//!
//!     if let Some(mut temperatures) = relay.samples(MeasurementKind::Temperature) {
//!         while let Some(sample) = temperatures.recv().await {
//!             println!("{}: {:.2}", sample.peripheral, sample.measurement.value());
//!         }
//!     }
//!
//!     relay.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! `btleplug` negotiates the MTU and connection interval itself, so the
//! relay's MTU and priority requests are logged as unsupported there.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for configuration and data types

// Public modules
pub mod ble;
pub mod cloud;
pub mod config;
pub mod data;
pub mod error;
pub mod relay;

// Re-exports for convenience
pub use config::RelayConfig;
pub use error::{Error, Result};
pub use relay::BleRelay;

// Re-export commonly used types from submodules
pub use ble::connection::{ConnectionState, ReconnectPolicy};
pub use ble::platform::{AdapterState, BleCentral, BlePeripheral, PeripheralAddress};
pub use ble::scanner::ScanMode;
pub use cloud::{CloudSink, LoggingSink, Point};
pub use data::{Measurement, MeasurementKind, Sample, SampleReceiver};
