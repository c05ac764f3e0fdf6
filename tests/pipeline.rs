//! End-to-end tests of the relay against an in-memory platform.

use async_trait::async_trait;
use ble_relay::ble::platform::{
    Advertisement, CentralEvent, CentralEventStream, CharacteristicRef, ConnectionPriority,
    NotificationEvent, NotificationStream,
};
use ble_relay::ble::uuids::*;
use ble_relay::cloud::Point;
use ble_relay::{
    AdapterState, BleCentral, BlePeripheral, BleRelay, CloudSink, ConnectionState, Error,
    MeasurementKind, PeripheralAddress, RelayConfig, Result,
};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

fn channel_stream<T: Send + 'static>(
    rx: mpsc::UnboundedReceiver<T>,
) -> futures::stream::BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
        .boxed()
}

struct FakePeripheral {
    address: PeripheralAddress,
    name: Option<String>,
    characteristics: Vec<CharacteristicRef>,
    connected: AtomicBool,
    connects: AtomicU32,
    subscribed: Mutex<Vec<Uuid>>,
    notify_tx: mpsc::UnboundedSender<NotificationEvent>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<NotificationEvent>>>,
}

impl FakePeripheral {
    fn new(address: &str, characteristics: &[(Uuid, Uuid)]) -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            address: PeripheralAddress::new(address),
            name: Some(format!("Sensor {}", address)),
            characteristics: characteristics
                .iter()
                .map(|&(service_uuid, uuid)| CharacteristicRef { service_uuid, uuid })
                .collect(),
            connected: AtomicBool::new(false),
            connects: AtomicU32::new(0),
            subscribed: Mutex::new(Vec::new()),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
        })
    }

    fn notify(&self, characteristic_uuid: Uuid, data: &'static [u8]) {
        let _ = self.notify_tx.send(NotificationEvent {
            characteristic_uuid,
            data: Bytes::from_static(data),
        });
    }

    fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    fn advertisement(&self, services: Vec<Uuid>) -> CentralEvent {
        CentralEvent::Advertisement(Advertisement {
            address: self.address.clone(),
            name: self.name.clone(),
            services,
            rssi: Some(-60),
        })
    }
}

#[async_trait]
impl BlePeripheral for FakePeripheral {
    fn address(&self) -> PeripheralAddress {
        self.address.clone()
    }

    async fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> Result<bool> {
        Ok(self.connected.load(Ordering::SeqCst))
    }

    async fn discover_services(&self) -> Result<()> {
        Ok(())
    }

    async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        Ok(mtu)
    }

    async fn request_connection_priority(&self, _priority: ConnectionPriority) -> Result<()> {
        Ok(())
    }

    async fn read_rssi(&self) -> Result<i16> {
        Ok(-60)
    }

    fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Option<CharacteristicRef> {
        self.characteristics
            .iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .copied()
    }

    async fn read(&self, characteristic: CharacteristicRef) -> Result<Vec<u8>> {
        Err(Error::CharacteristicNotFound {
            uuid: characteristic.uuid.to_string(),
        })
    }

    async fn subscribe(&self, characteristic: CharacteristicRef) -> Result<()> {
        self.subscribed.lock().push(characteristic.uuid);
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let rx = self.notify_rx.lock().take().ok_or(Error::NotConnected)?;
        Ok(channel_stream(rx))
    }
}

struct FakeCentral {
    state: AdapterState,
    peripherals: HashMap<PeripheralAddress, Arc<FakePeripheral>>,
    scans: Mutex<Vec<Vec<Uuid>>>,
    event_tx: mpsc::UnboundedSender<CentralEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<CentralEvent>>>,
}

impl FakeCentral {
    fn new(state: AdapterState, peripherals: &[Arc<FakePeripheral>]) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state,
            peripherals: peripherals
                .iter()
                .map(|p| (p.address.clone(), p.clone()))
                .collect(),
            scans: Mutex::new(Vec::new()),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        })
    }

    fn emit(&self, event: CentralEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[async_trait]
impl BleCentral for FakeCentral {
    async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        self.scans.lock().push(services.to_vec());
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        Ok(())
    }

    async fn adapter_state(&self) -> Result<AdapterState> {
        Ok(self.state)
    }

    async fn events(&self) -> Result<CentralEventStream> {
        let rx = self
            .event_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Internal("events already taken".to_string()))?;
        Ok(channel_stream(rx))
    }

    async fn peripheral(&self, address: &PeripheralAddress) -> Result<Arc<dyn BlePeripheral>> {
        let peripheral = self
            .peripherals
            .get(address)
            .cloned()
            .ok_or_else(|| Error::PeripheralNotFound {
                address: address.to_string(),
            })?;
        Ok(peripheral as Arc<dyn BlePeripheral>)
    }
}

/// Records every point it is given.
struct RecordingSink(mpsc::UnboundedSender<Point>);

#[async_trait]
impl CloudSink for RecordingSink {
    async fn write_point(&self, point: Point) -> Result<()> {
        let _ = self.0.send(point);
        Ok(())
    }
}

/// Never finishes a write.
struct StalledSink;

#[async_trait]
impl CloudSink for StalledSink {
    async fn write_point(&self, _point: Point) -> Result<()> {
        std::future::pending().await
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn ess_only() -> Vec<(Uuid, Uuid)> {
    vec![(ENVIRONMENTAL_SENSING_SERVICE_UUID, TEMPERATURE_UUID)]
}

#[tokio::test]
async fn test_advertisement_to_decoded_sample() {
    let sensor = FakePeripheral::new("AA:BB:CC:DD:EE:01", &ess_only());
    let central = FakeCentral::new(AdapterState::PoweredOn, &[sensor.clone()]);
    let (points_tx, mut points) = mpsc::unbounded_channel();

    let relay = BleRelay::new(
        central.clone(),
        Some(Arc::new(RecordingSink(points_tx))),
        RelayConfig::default(),
    )
    .await
    .unwrap();
    let mut temperatures = relay.samples(MeasurementKind::Temperature).unwrap();

    relay.start().await.unwrap();
    assert_eq!(central.scans.lock().len(), 1);
    assert!(central.scans.lock()[0].contains(&ENVIRONMENTAL_SENSING_SERVICE_UUID));

    central.emit(sensor.advertisement(vec![ENVIRONMENTAL_SENSING_SERVICE_UUID]));
    eventually(|| relay.connection_state(&sensor.address) == Some(ConnectionState::Connected))
        .await;
    assert!(!relay.is_scanning());

    sensor.notify(TEMPERATURE_UUID, &[0x88, 0x0B]);

    let sample = tokio::time::timeout(Duration::from_secs(5), temperatures.recv())
        .await
        .unwrap()
        .unwrap();
    assert!((sample.measurement.value() - 29.52).abs() < 1e-4);
    assert_eq!(sample.peripheral, sensor.address);
    assert_eq!(sample.peripheral_name.as_deref(), Some("Sensor AA:BB:CC:DD:EE:01"));

    let point = tokio::time::timeout(Duration::from_secs(5), points.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(point
        .to_line_protocol()
        .starts_with("temperature,device=AA:BB:CC:DD:EE:01,name=Sensor\\ AA:BB:CC:DD:EE:01 value=29.52 "));

    relay.shutdown().await.unwrap();
    assert!(!sensor.connected.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_missing_characteristic_is_skipped() {
    let sensor = FakePeripheral::new("AA:BB:CC:DD:EE:02", &ess_only());
    let central = FakeCentral::new(AdapterState::PoweredOn, &[sensor.clone()]);

    let relay = BleRelay::new(central.clone(), None, RelayConfig::default())
        .await
        .unwrap();
    let mut temperatures = relay.samples(MeasurementKind::Temperature).unwrap();
    let mut humidity = relay.samples(MeasurementKind::Humidity).unwrap();

    relay.start().await.unwrap();
    central.emit(sensor.advertisement(vec![ENVIRONMENTAL_SENSING_SERVICE_UUID]));
    eventually(|| !sensor.subscribed.lock().is_empty()).await;

    // A stray humidity notification must not be decoded without a subscription.
    sensor.notify(HUMIDITY_UUID, &[0x10, 0x27]);
    sensor.notify(TEMPERATURE_UUID, &[0xF4, 0x01]);

    let sample = tokio::time::timeout(Duration::from_secs(5), temperatures.recv())
        .await
        .unwrap()
        .unwrap();
    assert!((sample.measurement.value() - 5.0).abs() < 1e-4);
    assert_eq!(*sensor.subscribed.lock(), vec![TEMPERATURE_UUID]);
    assert!(humidity.try_recv().is_none());

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stalled_cloud_does_not_block_sink() {
    let sensor = FakePeripheral::new("AA:BB:CC:DD:EE:03", &ess_only());
    let central = FakeCentral::new(AdapterState::PoweredOn, &[sensor.clone()]);

    let relay = BleRelay::new(
        central.clone(),
        Some(Arc::new(StalledSink)),
        RelayConfig::default(),
    )
    .await
    .unwrap();
    let mut temperatures = relay.samples(MeasurementKind::Temperature).unwrap();

    relay.start().await.unwrap();
    central.emit(sensor.advertisement(vec![ENVIRONMENTAL_SENSING_SERVICE_UUID]));
    eventually(|| !sensor.subscribed.lock().is_empty()).await;

    for _ in 0..10 {
        sensor.notify(TEMPERATURE_UUID, &[0x64, 0x00]);
    }

    for _ in 0..10 {
        let sample = tokio::time::timeout(Duration::from_secs(5), temperatures.recv())
            .await
            .unwrap()
            .unwrap();
        assert!((sample.measurement.value() - 1.0).abs() < 1e-4);
    }

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_single_target_hands_off_first_match_only() {
    let first = FakePeripheral::new("AA:BB:CC:DD:EE:04", &ess_only());
    let second = FakePeripheral::new("AA:BB:CC:DD:EE:05", &ess_only());
    let central = FakeCentral::new(AdapterState::PoweredOn, &[first.clone(), second.clone()]);

    let relay = BleRelay::new(central.clone(), None, RelayConfig::default())
        .await
        .unwrap();
    relay.start().await.unwrap();

    central.emit(second.advertisement(vec![BATTERY_SERVICE_UUID, DEVICE_INFO_SERVICE_UUID]));
    central.emit(first.advertisement(vec![ENVIRONMENTAL_SENSING_SERVICE_UUID]));
    central.emit(second.advertisement(vec![ENVIRONMENTAL_SENSING_SERVICE_UUID]));
    central.emit(first.advertisement(vec![ENVIRONMENTAL_SENSING_SERVICE_UUID]));

    eventually(|| first.connects() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(first.connects(), 1);
    assert_eq!(second.connects(), 0);
    assert_eq!(relay.peripherals(), vec![first.address.clone()]);

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_powered_on_event_starts_scan() {
    let central = FakeCentral::new(AdapterState::PoweredOff, &[]);
    let relay = BleRelay::new(central.clone(), None, RelayConfig::default())
        .await
        .unwrap();

    relay.start().await.unwrap();
    assert!(central.scans.lock().is_empty());

    central.emit(CentralEvent::AdapterStateChanged(AdapterState::PoweredOn));
    central.emit(CentralEvent::AdapterStateChanged(AdapterState::PoweredOn));
    eventually(|| relay.is_scanning()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(central.scans.lock().len(), 1);
    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_power_cycle_restarts_scan() {
    let central = FakeCentral::new(AdapterState::PoweredOn, &[]);
    let relay = BleRelay::new(central.clone(), None, RelayConfig::default())
        .await
        .unwrap();

    relay.start().await.unwrap();
    eventually(|| relay.is_scanning()).await;

    central.emit(CentralEvent::AdapterStateChanged(AdapterState::PoweredOff));
    eventually(|| !relay.is_scanning()).await;

    central.emit(CentralEvent::AdapterStateChanged(AdapterState::PoweredOn));
    eventually(|| central.scans.lock().len() == 2).await;
    assert!(relay.is_scanning());

    relay.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_dropped_link_is_reconnected_after_delay() {
    let sensor = FakePeripheral::new("AA:BB:CC:DD:EE:06", &ess_only());
    let central = FakeCentral::new(AdapterState::PoweredOn, &[sensor.clone()]);

    let relay = BleRelay::new(central.clone(), None, RelayConfig::default())
        .await
        .unwrap();
    relay.start().await.unwrap();

    central.emit(sensor.advertisement(vec![ENVIRONMENTAL_SENSING_SERVICE_UUID]));
    eventually(|| sensor.connects() == 1).await;

    sensor.connected.store(false, Ordering::SeqCst);
    central.emit(CentralEvent::ConnectionStateChanged {
        address: sensor.address.clone(),
        state: ConnectionState::Disconnected,
    });
    eventually(|| relay.connection_state(&sensor.address) == Some(ConnectionState::Disconnected))
        .await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(sensor.connects(), 1);

    tokio::time::sleep(Duration::from_secs(6)).await;
    eventually(|| sensor.connects() == 2).await;
    assert_eq!(
        relay.connection_state(&sensor.address),
        Some(ConnectionState::Connected)
    );

    relay.shutdown().await.unwrap();
}
