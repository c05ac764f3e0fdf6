//! BLE communication module.
//!
//! This module provides the Bluetooth Low Energy side of the relay:
//! adapter monitoring, scanning, connection supervision and GATT decoding,
//! all written against the platform traits in [`platform`].

pub mod adapter;
pub mod btleplug_backend;
pub mod characteristics;
pub mod connection;
pub mod platform;
pub mod scanner;
pub mod uuids;

pub use adapter::AdapterMonitor;
pub use btleplug_backend::{BtleplugCentral, BtleplugPeripheral};
pub use characteristics::{CharacteristicDecoder, CharacteristicSubscription};
pub use connection::{ConnectionEvent, ConnectionState, ConnectionSupervisor, ReconnectPolicy};
pub use platform::{
    AdapterState, Advertisement, BleCentral, BlePeripheral, BondState, CentralEvent,
    CharacteristicRef, ConnectionPriority, NotificationEvent, PeripheralAddress,
};
pub use scanner::{BleScanner, DiscoveredPeripheral, ScanEvent, ScanFailureReason, ScanMode};
pub use uuids::*;
