//! Boundary to the platform BLE radio and GATT driver.
//!
//! The relay never talks to a Bluetooth stack directly. Everything it needs
//! from the radio goes through [`BleCentral`] and [`BlePeripheral`], and
//! everything the radio reports comes back as a stream of [`CentralEvent`]s.
//! The `btleplug` implementation lives in
//! [`btleplug_backend`](crate::ble::btleplug_backend).

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use std::pin::Pin;
use std::sync::Arc;
use uuid::Uuid;

use crate::ble::connection::ConnectionState;
use crate::error::Result;

#[cfg(test)]
use mockall::automock;

/// Opaque, stable identity of a remote peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralAddress(String);

impl PeripheralAddress {
    /// Wrap a platform identifier.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Get the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Power state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AdapterState {
    /// State not yet known.
    #[default]
    Unknown,
    /// Radio is on and usable.
    PoweredOn,
    /// Radio is off.
    PoweredOff,
}

/// Pairing state of a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BondState {
    /// Not bonded.
    None,
    /// Bonding in progress.
    Bonding,
    /// Bonded.
    Bonded,
}

/// Requested connection interval class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionPriority {
    /// Platform default interval.
    Balanced,
    /// Short interval, higher throughput and power draw.
    #[default]
    High,
    /// Long interval, lowest power draw.
    LowPower,
}

/// A single advertisement seen while scanning.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Advertising peripheral.
    pub address: PeripheralAddress,
    /// Advertised local name.
    pub name: Option<String>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

/// Something the platform observed.
#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    /// The radio's power state changed.
    AdapterStateChanged(AdapterState),
    /// A peripheral advertised.
    Advertisement(Advertisement),
    /// A peripheral's connection state changed.
    ConnectionStateChanged {
        /// The peripheral.
        address: PeripheralAddress,
        /// Its new state.
        state: ConnectionState,
    },
    /// A peripheral's bond state changed.
    BondStateChanged {
        /// The peripheral.
        address: PeripheralAddress,
        /// Its new bond state.
        state: BondState,
    },
}

/// Handle to a characteristic found on a connected peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    /// Service containing the characteristic.
    pub service_uuid: Uuid,
    /// The characteristic.
    pub uuid: Uuid,
}

/// Value notification from a subscribed characteristic.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    /// UUID of the characteristic that sent the notification.
    pub characteristic_uuid: Uuid,
    /// The notification data.
    pub data: Bytes,
}

/// Stream of platform events.
pub type CentralEventStream = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// Stream of value notifications from one peripheral.
pub type NotificationStream = Pin<Box<dyn Stream<Item = NotificationEvent> + Send>>;

/// The local radio.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BleCentral: Send + Sync + 'static {
    /// Start scanning for peripherals advertising any of `services`.
    async fn start_scan(&self, services: &[Uuid]) -> Result<()>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Current power state of the radio.
    async fn adapter_state(&self) -> Result<AdapterState>;

    /// Subscribe to platform events.
    async fn events(&self) -> Result<CentralEventStream>;

    /// Get a handle to a peripheral seen by the platform.
    async fn peripheral(&self, address: &PeripheralAddress) -> Result<Arc<dyn BlePeripheral>>;
}

/// A remote GATT server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BlePeripheral: Send + Sync + 'static {
    /// Stable address of the peripheral.
    fn address(&self) -> PeripheralAddress;

    /// Advertised name, if known.
    async fn name(&self) -> Option<String>;

    /// Issue a connect request.
    async fn connect(&self) -> Result<()>;

    /// Issue a disconnect request.
    async fn disconnect(&self) -> Result<()>;

    /// Whether the platform currently reports the link as up.
    async fn is_connected(&self) -> Result<bool>;

    /// Run GATT service discovery.
    async fn discover_services(&self) -> Result<()>;

    /// Ask for a larger MTU; returns the negotiated size.
    async fn request_mtu(&self, mtu: u16) -> Result<u16>;

    /// Ask for a connection interval class.
    async fn request_connection_priority(&self, priority: ConnectionPriority) -> Result<()>;

    /// Read the current signal strength in dBm.
    async fn read_rssi(&self) -> Result<i16>;

    /// Look up a discovered characteristic.
    fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Option<CharacteristicRef>;

    /// Read a characteristic's value.
    async fn read(&self, characteristic: CharacteristicRef) -> Result<Vec<u8>>;

    /// Enable value-change notifications on a characteristic.
    async fn subscribe(&self, characteristic: CharacteristicRef) -> Result<()>;

    /// Stream of notifications for all subscribed characteristics.
    async fn notifications(&self) -> Result<NotificationStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peripheral_address_display() {
        let address = PeripheralAddress::new("AA:BB:CC:DD:EE:FF");
        assert_eq!(address.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(address.as_str(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_defaults() {
        assert_eq!(AdapterState::default(), AdapterState::Unknown);
        assert_eq!(ConnectionPriority::default(), ConnectionPriority::High);
    }
}
