//! [`BleCentral`] and [`BlePeripheral`] on top of `btleplug`.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent as BtleplugEvent, CentralState, Characteristic, Manager as _,
    Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::ble::connection::ConnectionState;
use crate::ble::platform::{
    AdapterState, Advertisement, BleCentral, BlePeripheral, CentralEvent, CentralEventStream,
    CharacteristicRef, ConnectionPriority, NotificationEvent, NotificationStream,
    PeripheralAddress,
};
use crate::error::{Error, Result};

type KnownPeripherals = Arc<RwLock<HashMap<PeripheralAddress, PeripheralId>>>;

/// The first Bluetooth adapter on the system.
pub struct BtleplugCentral {
    adapter: Adapter,
    known: KnownPeripherals,
}

impl BtleplugCentral {
    /// Open the first available adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            known: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn translate(
        adapter: Adapter,
        known: KnownPeripherals,
        event: BtleplugEvent,
    ) -> Option<CentralEvent> {
        match event {
            BtleplugEvent::DeviceDiscovered(id) | BtleplugEvent::DeviceUpdated(id) => {
                trace!("Device seen: {:?}", id);
                Self::advertisement(&adapter, &known, id, Vec::new())
                    .await
                    .map(CentralEvent::Advertisement)
            }
            BtleplugEvent::ServicesAdvertisement { id, services } => {
                Self::advertisement(&adapter, &known, id, services)
                    .await
                    .map(CentralEvent::Advertisement)
            }
            BtleplugEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
                Some(CentralEvent::ConnectionStateChanged {
                    address: Self::remember(&known, id),
                    state: ConnectionState::Connected,
                })
            }
            BtleplugEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                Some(CentralEvent::ConnectionStateChanged {
                    address: Self::remember(&known, id),
                    state: ConnectionState::Disconnected,
                })
            }
            BtleplugEvent::StateUpdate(state) => {
                Some(CentralEvent::AdapterStateChanged(adapter_state(state)))
            }
            _ => None,
        }
    }

    async fn advertisement(
        adapter: &Adapter,
        known: &KnownPeripherals,
        id: PeripheralId,
        mut services: Vec<Uuid>,
    ) -> Option<Advertisement> {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        for service in properties.services {
            if !services.contains(&service) {
                services.push(service);
            }
        }

        if services.is_empty() {
            return None;
        }

        Some(Advertisement {
            address: Self::remember(known, id),
            name: properties.local_name,
            services,
            rssi: properties.rssi,
        })
    }

    fn remember(known: &KnownPeripherals, id: PeripheralId) -> PeripheralAddress {
        let address = PeripheralAddress::new(id.to_string());
        known.write().insert(address.clone(), id);
        address
    }
}

fn adapter_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        _ => AdapterState::Unknown,
    }
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        self.adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await
            .map_err(Error::Bluetooth)
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)
    }

    async fn adapter_state(&self) -> Result<AdapterState> {
        let state = self.adapter.adapter_state().await?;
        Ok(adapter_state(state))
    }

    async fn events(&self) -> Result<CentralEventStream> {
        let events = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let known = self.known.clone();

        Ok(events
            .filter_map(move |event| Self::translate(adapter.clone(), known.clone(), event))
            .boxed())
    }

    async fn peripheral(&self, address: &PeripheralAddress) -> Result<Arc<dyn BlePeripheral>> {
        let id = self.known.read().get(address).cloned();

        let peripheral = match id {
            Some(id) => self.adapter.peripheral(&id).await?,
            None => self
                .adapter
                .peripherals()
                .await?
                .into_iter()
                .find(|p| p.id().to_string() == address.as_str())
                .ok_or_else(|| Error::PeripheralNotFound {
                    address: address.to_string(),
                })?,
        };

        Ok(Arc::new(BtleplugPeripheral::new(peripheral)))
    }
}

/// A peripheral known to a [`BtleplugCentral`].
pub struct BtleplugPeripheral {
    peripheral: Peripheral,
    address: PeripheralAddress,
}

impl BtleplugPeripheral {
    /// Wrap a `btleplug` peripheral.
    pub fn new(peripheral: Peripheral) -> Self {
        let address = PeripheralAddress::new(peripheral.id().to_string());
        Self {
            peripheral,
            address,
        }
    }

    /// Get the underlying peripheral.
    pub fn inner(&self) -> &Peripheral {
        &self.peripheral
    }

    fn find(&self, characteristic: CharacteristicRef) -> Result<Characteristic> {
        self.peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == characteristic.service_uuid)
            .flat_map(|s| s.characteristics)
            .find(|c| c.uuid == characteristic.uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: characteristic.uuid.to_string(),
            })
    }
}

#[async_trait]
impl BlePeripheral for BtleplugPeripheral {
    fn address(&self) -> PeripheralAddress {
        self.address.clone()
    }

    async fn name(&self) -> Option<String> {
        self.peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.local_name)
    }

    async fn connect(&self) -> Result<()> {
        self.peripheral.connect().await.map_err(Error::Bluetooth)
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await.map_err(Error::Bluetooth)
    }

    async fn is_connected(&self) -> Result<bool> {
        self.peripheral.is_connected().await.map_err(Error::Bluetooth)
    }

    async fn discover_services(&self) -> Result<()> {
        self.peripheral
            .discover_services()
            .await
            .map_err(Error::Bluetooth)?;

        for service in self.peripheral.services() {
            for characteristic in service.characteristics {
                debug!(
                    "Found characteristic: {} in service {}",
                    characteristic.uuid, service.uuid
                );
            }
        }

        Ok(())
    }

    async fn request_mtu(&self, _mtu: u16) -> Result<u16> {
        // btleplug negotiates the MTU itself and exposes no request.
        Err(Error::NotSupported {
            operation: "request_mtu".to_string(),
        })
    }

    async fn request_connection_priority(&self, _priority: ConnectionPriority) -> Result<()> {
        Err(Error::NotSupported {
            operation: "request_connection_priority".to_string(),
        })
    }

    async fn read_rssi(&self) -> Result<i16> {
        self.peripheral
            .properties()
            .await?
            .and_then(|p| p.rssi)
            .ok_or_else(|| Error::NotSupported {
                operation: "read_rssi".to_string(),
            })
    }

    fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Option<CharacteristicRef> {
        let characteristic = CharacteristicRef {
            service_uuid: service,
            uuid: characteristic,
        };
        self.find(characteristic).ok().map(|_| characteristic)
    }

    async fn read(&self, characteristic: CharacteristicRef) -> Result<Vec<u8>> {
        let found = self.find(characteristic)?;
        let data = self.peripheral.read(&found).await.map_err(Error::Bluetooth)?;

        trace!("Read {} bytes from characteristic {}", data.len(), found.uuid);

        Ok(data)
    }

    async fn subscribe(&self, characteristic: CharacteristicRef) -> Result<()> {
        let found = self.find(characteristic)?;

        debug!(
            "Found characteristic {}, properties: {:?}",
            found.uuid, found.properties
        );

        self.peripheral
            .subscribe(&found)
            .await
            .map_err(Error::Bluetooth)
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let notifications = self.peripheral.notifications().await?;

        Ok(notifications
            .map(|n| NotificationEvent {
                characteristic_uuid: n.uuid,
                data: Bytes::from(n.value),
            })
            .boxed())
    }
}
