//! GATT characteristic setup and decoding.
//!
//! Once a peripheral is connected, [`CharacteristicDecoder`] negotiates link
//! parameters, subscribes to every characteristic in its subscription table
//! that the peripheral actually exposes, and turns each notification into a
//! [`Sample`] for the sink and the cloud forwarder.

use futures::future::join_all;
use futures::stream::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::platform::{BlePeripheral, ConnectionPriority, NotificationEvent, PeripheralAddress};
use crate::ble::uuids::*;
use crate::cloud::CloudForwarder;
use crate::config::RelayConfig;
use crate::data::measurement::{Encoding, Measurement, MeasurementKind, Sample};
use crate::data::sink::SampleSink;
use crate::error::Result;

/// One row of the subscription table: where a value lives, how to decode it,
/// and which queue it goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicSubscription {
    /// Service containing the characteristic.
    pub service: Uuid,
    /// The characteristic to subscribe to.
    pub characteristic: Uuid,
    /// Payload encoding.
    pub encoding: Encoding,
    /// Measurement produced.
    pub kind: MeasurementKind,
}

impl CharacteristicSubscription {
    /// Create a table entry.
    pub const fn new(
        service: Uuid,
        characteristic: Uuid,
        encoding: Encoding,
        kind: MeasurementKind,
    ) -> Self {
        Self {
            service,
            characteristic,
            encoding,
            kind,
        }
    }

    /// ESS temperature, hundredths of a degree.
    pub const TEMPERATURE: Self = Self::new(
        ENVIRONMENTAL_SENSING_SERVICE_UUID,
        TEMPERATURE_UUID,
        Encoding::Hundredths,
        MeasurementKind::Temperature,
    );

    /// ESS humidity, hundredths of a percent.
    pub const HUMIDITY: Self = Self::new(
        ENVIRONMENTAL_SENSING_SERVICE_UUID,
        HUMIDITY_UUID,
        Encoding::Hundredths,
        MeasurementKind::Humidity,
    );

    /// Battery level in percent.
    pub const BATTERY_LEVEL: Self = Self::new(
        BATTERY_SERVICE_UUID,
        BATTERY_LEVEL_UUID,
        Encoding::Uint8,
        MeasurementKind::BatteryLevel,
    );

    /// The table used when none is configured.
    pub fn default_table() -> Vec<Self> {
        vec![Self::TEMPERATURE, Self::HUMIDITY, Self::BATTERY_LEVEL]
    }
}

/// Per-connection setup and notification decoding.
pub struct CharacteristicDecoder {
    subscriptions: Vec<CharacteristicSubscription>,
    preferred_mtu: u16,
    connection_priority: ConnectionPriority,
    read_device_info: bool,
    sink: Arc<SampleSink>,
    forwarder: Option<CloudForwarder>,
}

impl CharacteristicDecoder {
    /// Create a decoder from the relay configuration.
    pub fn new(
        config: &RelayConfig,
        sink: Arc<SampleSink>,
        forwarder: Option<CloudForwarder>,
    ) -> Self {
        Self {
            subscriptions: config.subscriptions.clone(),
            preferred_mtu: config.preferred_mtu,
            connection_priority: config.connection_priority,
            read_device_info: config.read_device_info,
            sink,
            forwarder,
        }
    }

    /// The subscription table.
    pub fn subscriptions(&self) -> &[CharacteristicSubscription] {
        &self.subscriptions
    }

    /// Run one connection's session: set up, then decode notifications
    /// until the peripheral's notification stream ends.
    ///
    /// # Errors
    ///
    /// Returns an error if service discovery or the notification stream
    /// fails. Best-effort steps only log.
    pub async fn run_session(&self, peripheral: Arc<dyn BlePeripheral>) -> Result<()> {
        let address = peripheral.address();
        let name = peripheral.name().await;

        self.negotiate(peripheral.as_ref()).await;

        peripheral.discover_services().await?;

        if self.read_device_info {
            self.log_device_info(peripheral.as_ref()).await;
        }

        // Listen before subscribing so the first notifications are not lost.
        let mut notifications = peripheral.notifications().await?;

        let active = self.subscribe_all(peripheral.as_ref()).await;
        if active.is_empty() {
            info!("No subscribable characteristics on {}", address);
            return Ok(());
        }

        info!(
            "Subscribed to {} characteristic(s) on {}",
            active.len(),
            address
        );

        while let Some(event) = notifications.next().await {
            self.handle_notification(&active, &address, name.as_deref(), event);
        }

        debug!("Notification stream for {} ended", address);

        Ok(())
    }

    /// Best-effort link tuning and diagnostics. Failures are logged only.
    async fn negotiate(&self, peripheral: &dyn BlePeripheral) {
        let address = peripheral.address();

        match peripheral.request_mtu(self.preferred_mtu).await {
            Ok(mtu) => info!("MTU is {} for {}", mtu, address),
            Err(e) => debug!("MTU request to {} failed: {}", address, e),
        }

        if let Err(e) = peripheral
            .request_connection_priority(self.connection_priority)
            .await
        {
            debug!(
                "Connection priority {:?} request to {} failed: {}",
                self.connection_priority, address, e
            );
        }

        match peripheral.read_rssi().await {
            Ok(rssi) => info!("RSSI is {} for {}", rssi, address),
            Err(e) => debug!("RSSI read from {} failed: {}", address, e),
        }
    }

    async fn log_device_info(&self, peripheral: &dyn BlePeripheral) {
        let Some(characteristic) =
            peripheral.characteristic(DEVICE_INFO_SERVICE_UUID, MANUFACTURER_NAME_UUID)
        else {
            return;
        };

        match peripheral.read(characteristic).await {
            Ok(data) => info!(
                "Manufacturer of {}: {}",
                peripheral.address(),
                String::from_utf8_lossy(&data)
            ),
            Err(e) => debug!("Manufacturer name read failed: {}", e),
        }
    }

    /// Subscribe to every table entry the peripheral exposes, concurrently.
    ///
    /// Entries whose characteristic is absent are skipped silently; a
    /// failed subscription only loses that entry.
    async fn subscribe_all(&self, peripheral: &dyn BlePeripheral) -> Vec<CharacteristicSubscription> {
        let attempts = self.subscriptions.iter().map(|entry| async move {
            let Some(characteristic) =
                peripheral.characteristic(entry.service, entry.characteristic)
            else {
                debug!(
                    "Characteristic {} not present, skipping {}",
                    entry.characteristic, entry.kind
                );
                return None;
            };

            match peripheral.subscribe(characteristic).await {
                Ok(()) => {
                    debug!("Subscribed to {} ({})", entry.characteristic, entry.kind);
                    Some(*entry)
                }
                Err(e) => {
                    warn!(
                        "Failed to subscribe to {} ({}): {}",
                        entry.characteristic, entry.kind, e
                    );
                    None
                }
            }
        });

        join_all(attempts).await.into_iter().flatten().collect()
    }

    /// Decode one notification and deliver it.
    ///
    /// The sample goes to the sink first; cloud forwarding is independent
    /// and cannot stop it. The entry is looked up by characteristic UUID,
    /// which [`RelayConfig::validate`] keeps unique within the table.
    pub fn handle_notification(
        &self,
        active: &[CharacteristicSubscription],
        address: &PeripheralAddress,
        name: Option<&str>,
        event: NotificationEvent,
    ) -> Option<Sample> {
        let entry = active
            .iter()
            .find(|s| s.characteristic == event.characteristic_uuid)?;

        trace!(
            "Notification from {} on {}: {:02X?}",
            address,
            event.characteristic_uuid,
            &event.data[..]
        );

        let value = match entry.encoding.decode(&event.data) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to decode {} from {}: {}", entry.kind, address, e);
                return None;
            }
        };

        let sample = Sample::now(Measurement::new(entry.kind, value), address.clone())
            .with_name(name.map(str::to_string));

        self.sink.push(sample.clone());

        if let Some(forwarder) = &self.forwarder {
            forwarder.forward(sample.clone());
        }

        Some(sample)
    }
}
