//! Relay orchestration.
//!
//! [`BleRelay`] wires the pieces together: platform events are dispatched to
//! the adapter monitor, the scanner and the per-peripheral connection
//! supervisors, and every peripheral the scanner hands over is connected and
//! decoded into the sample sink (and the cloud forwarder when one is
//! configured).

use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::ble::adapter::AdapterMonitor;
use crate::ble::btleplug_backend::BtleplugCentral;
use crate::ble::characteristics::CharacteristicDecoder;
use crate::ble::connection::{ConnectionState, ConnectionSupervisor};
use crate::ble::platform::{AdapterState, BleCentral, CentralEvent, PeripheralAddress};
use crate::ble::scanner::{BleScanner, DiscoveredPeripheral, ScanEvent};
use crate::cloud::{CloudForwarder, CloudSink};
use crate::config::RelayConfig;
use crate::data::measurement::MeasurementKind;
use crate::data::sink::{SampleReceiver, SampleSink};
use crate::error::{Error, Result};

/// State shared with the background tasks.
struct Shared {
    central: Arc<dyn BleCentral>,
    config: RelayConfig,
    scanner: Arc<BleScanner>,
    monitor: AdapterMonitor,
    decoder: Arc<CharacteristicDecoder>,
    supervisors: RwLock<HashMap<PeripheralAddress, Arc<ConnectionSupervisor>>>,
    /// Hand-off tasks in flight.
    handoffs: Mutex<Vec<JoinHandle<()>>>,
}

/// Relays sensor values from BLE peripherals to the sample sink and the cloud.
pub struct BleRelay {
    shared: Arc<Shared>,
    sink: Arc<SampleSink>,
    /// Scanner output, taken by `start`.
    scan_rx: Mutex<Option<mpsc::UnboundedReceiver<ScanEvent>>>,
    /// Cloud forwarding task.
    forwarder_handle: Mutex<Option<JoinHandle<()>>>,
    /// Event dispatch tasks.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    is_running: AtomicBool,
    is_shut_down: AtomicBool,
}

impl BleRelay {
    /// Create a relay on top of a platform radio.
    ///
    /// Nothing happens until [`start`](Self::start) is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub async fn new(
        central: Arc<dyn BleCentral>,
        cloud: Option<Arc<dyn CloudSink>>,
        config: RelayConfig,
    ) -> Result<Self> {
        config.validate()?;

        let sink = Arc::new(SampleSink::with_kinds(
            config.subscriptions.iter().map(|s| s.kind),
        ));

        let (forwarder, forwarder_handle) = match cloud {
            Some(cloud) => {
                let (forwarder, handle) = CloudForwarder::spawn(cloud);
                (Some(forwarder), Some(handle))
            }
            None => (None, None),
        };

        let decoder = Arc::new(CharacteristicDecoder::new(&config, sink.clone(), forwarder));
        let (scanner, scan_rx) = BleScanner::new(central.clone(), config.scan_mode);
        let scanner = Arc::new(scanner);
        let monitor = AdapterMonitor::new(scanner.clone(), config.target_services.clone());

        Ok(Self {
            shared: Arc::new(Shared {
                central,
                config,
                scanner,
                monitor,
                decoder,
                supervisors: RwLock::new(HashMap::new()),
                handoffs: Mutex::new(Vec::new()),
            }),
            sink,
            scan_rx: Mutex::new(Some(scan_rx)),
            forwarder_handle: Mutex::new(forwarder_handle),
            tasks: Mutex::new(Vec::new()),
            is_running: AtomicBool::new(false),
            is_shut_down: AtomicBool::new(false),
        })
    }

    /// Create a relay on the system's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available or the configuration is invalid.
    pub async fn with_btleplug(
        cloud: Option<Arc<dyn CloudSink>>,
        config: RelayConfig,
    ) -> Result<Self> {
        let central = BtleplugCentral::new().await?;
        Self::new(Arc::new(central), cloud, config).await
    }

    /// Start listening to the platform.
    ///
    /// Scanning begins as soon as the adapter reports `PoweredOn`.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay was shut down or the platform event
    /// stream cannot be opened.
    pub async fn start(&self) -> Result<()> {
        if self.is_shut_down.load(Ordering::SeqCst) {
            return Err(Error::Internal("relay has been shut down".to_string()));
        }

        if self.is_running.swap(true, Ordering::SeqCst) {
            debug!("Relay already running");
            return Ok(());
        }

        info!("Starting BLE relay");

        let mut events = match self.shared.central.events().await {
            Ok(events) => events,
            Err(e) => {
                self.is_running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let mut scan_rx = self
            .scan_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Internal("scan events already taken".to_string()))?;

        let shared = self.shared.clone();
        let dispatch = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                shared.dispatch(event).await;
            }
            debug!("Platform event stream ended");
        });

        let shared = self.shared.clone();
        let scan_events = tokio::spawn(async move {
            while let Some(event) = scan_rx.recv().await {
                shared.handle_scan_event(event);
            }
            debug!("Scan event loop ended");
        });

        self.tasks.lock().extend([dispatch, scan_events]);

        // The radio may already be on; no state change would be reported then.
        match self.shared.central.adapter_state().await {
            Ok(state) => {
                self.shared.monitor.handle_state(state).await;
            }
            Err(e) => warn!("Failed to query adapter state: {}", e),
        }

        Ok(())
    }

    /// Stop scanning, disconnect every peripheral and cancel all background work.
    ///
    /// The relay cannot be restarted afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        if self.is_shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Shutting down BLE relay");

        self.is_running.store(false, Ordering::SeqCst);

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for task in self.shared.handoffs.lock().drain(..) {
            task.abort();
        }

        self.shared.scanner.stop_scanning().await;

        let supervisors: Vec<_> = self
            .shared
            .supervisors
            .write()
            .drain()
            .map(|(_, supervisor)| supervisor)
            .collect();

        for supervisor in supervisors {
            if let Err(e) = supervisor.disconnect().await {
                warn!("Failed to disconnect {}: {}", supervisor.address(), e);
            }
            supervisor.shutdown();
        }

        if let Some(handle) = self.forwarder_handle.lock().take() {
            handle.abort();
        }

        Ok(())
    }

    /// Check if the relay is running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Take the consumer side of one measurement queue.
    ///
    /// Returns `None` if the kind is not configured or already taken.
    pub fn samples(&self, kind: MeasurementKind) -> Option<SampleReceiver> {
        self.sink.subscribe(kind)
    }

    /// Get the sample sink.
    pub fn sink(&self) -> &Arc<SampleSink> {
        &self.sink
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    /// Last observed adapter state.
    pub fn adapter_state(&self) -> AdapterState {
        self.shared.monitor.state()
    }

    /// Check if a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.shared.scanner.is_scanning()
    }

    /// Get the supervisor for a peripheral that has been handed over.
    pub fn supervisor(&self, address: &PeripheralAddress) -> Option<Arc<ConnectionSupervisor>> {
        self.shared.supervisors.read().get(address).cloned()
    }

    /// Connection state of a handed-over peripheral.
    pub fn connection_state(&self, address: &PeripheralAddress) -> Option<ConnectionState> {
        self.supervisor(address).map(|s| s.state())
    }

    /// Addresses of every peripheral handed over so far.
    pub fn peripherals(&self) -> Vec<PeripheralAddress> {
        self.shared.supervisors.read().keys().cloned().collect()
    }
}

impl Drop for BleRelay {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        for task in self.shared.handoffs.lock().drain(..) {
            task.abort();
        }
        for supervisor in self.shared.supervisors.read().values() {
            supervisor.shutdown();
        }
        if let Some(handle) = self.forwarder_handle.get_mut().take() {
            handle.abort();
        }
    }
}

impl Shared {
    async fn dispatch(self: &Arc<Self>, event: CentralEvent) {
        match event {
            CentralEvent::AdapterStateChanged(state) => {
                self.monitor.handle_state(state).await;
            }
            CentralEvent::Advertisement(advertisement) => {
                self.scanner.handle_advertisement(&advertisement).await;
            }
            CentralEvent::ConnectionStateChanged { address, state } => {
                let supervisor = self.supervisors.read().get(&address).cloned();
                match supervisor {
                    Some(supervisor) => supervisor.handle_state_change(state),
                    None => trace!("{} for unmanaged peripheral {}", state, address),
                }
            }
            CentralEvent::BondStateChanged { address, state } => {
                let supervisor = self.supervisors.read().get(&address).cloned();
                match supervisor {
                    Some(supervisor) => supervisor.handle_bond_state(state),
                    None => trace!("Bond state {:?} for unmanaged peripheral {}", state, address),
                }
            }
        }
    }

    fn handle_scan_event(self: &Arc<Self>, event: ScanEvent) {
        match event {
            ScanEvent::Discovered(peripheral) => {
                let this = self.clone();
                let handle = tokio::spawn(async move { this.hand_off(peripheral).await });

                let mut handoffs = self.handoffs.lock();
                handoffs.retain(|task| !task.is_finished());
                handoffs.push(handle);
            }
            ScanEvent::Failed { reason } => {
                error!("Scan failed: {}", reason);
                self.monitor.scan_finished();
            }
            ScanEvent::Stopped => {
                debug!("Scan stopped");
                self.monitor.scan_finished();
            }
        }
    }

    async fn hand_off(self: &Arc<Self>, discovered: DiscoveredPeripheral) {
        let supervisor = match self.supervisor_for(&discovered.address).await {
            Ok(supervisor) => supervisor,
            Err(e) => {
                warn!("Cannot hand over {}: {}", discovered.address, e);
                return;
            }
        };

        if supervisor.state() != ConnectionState::Disconnected {
            debug!(
                "{} is {}, not connecting again",
                discovered.address,
                supervisor.state()
            );
            return;
        }

        info!("Connecting to {}", discovered.address);

        if let Err(e) = supervisor.connect().await {
            warn!("Failed to connect to {}: {}", discovered.address, e);
        }
    }

    async fn supervisor_for(
        &self,
        address: &PeripheralAddress,
    ) -> Result<Arc<ConnectionSupervisor>> {
        let existing = self.supervisors.read().get(address).cloned();
        if let Some(supervisor) = existing {
            return Ok(supervisor);
        }

        let peripheral = self.central.peripheral(address).await?;
        let supervisor = ConnectionSupervisor::new(
            peripheral,
            self.decoder.clone(),
            self.config.reconnect.clone(),
        );

        Ok(self
            .supervisors
            .write()
            .entry(address.clone())
            .or_insert(supervisor)
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::platform::MockBleCentral;
    use crate::ble::uuids::ENVIRONMENTAL_SENSING_SERVICE_UUID;
    use crate::cloud::LoggingSink;

    fn idle_central(state: AdapterState) -> MockBleCentral {
        let mut central = MockBleCentral::new();
        central
            .expect_events()
            .times(1)
            .returning(|| Ok(futures::stream::pending().boxed()));
        central.expect_adapter_state().returning(move || Ok(state));
        central
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let config = RelayConfig::default().with_target_services(Vec::<uuid::Uuid>::new());
        let result = BleRelay::new(Arc::new(MockBleCentral::new()), None, config).await;
        assert!(matches!(result, Err(Error::InvalidParameter { .. })));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_scans_when_powered_on() {
        let mut central = idle_central(AdapterState::PoweredOn);
        central
            .expect_start_scan()
            .withf(|services| services.contains(&ENVIRONMENTAL_SENSING_SERVICE_UUID))
            .times(1)
            .returning(|_| Ok(()));
        central.expect_stop_scan().times(1).returning(|| Ok(()));

        let relay = BleRelay::new(
            Arc::new(central),
            Some(Arc::new(LoggingSink)),
            RelayConfig::default(),
        )
        .await
        .unwrap();

        relay.start().await.unwrap();
        relay.start().await.unwrap();
        assert!(relay.is_running());
        assert!(relay.is_scanning());
        assert_eq!(relay.adapter_state(), AdapterState::PoweredOn);

        relay.shutdown().await.unwrap();
        assert!(!relay.is_running());
        assert!(!relay.is_scanning());
    }

    #[tokio::test]
    async fn test_powered_off_adapter_does_not_scan() {
        let mut central = idle_central(AdapterState::PoweredOff);
        central.expect_start_scan().never();

        let relay = BleRelay::new(Arc::new(central), None, RelayConfig::default())
            .await
            .unwrap();
        relay.start().await.unwrap();
        assert!(!relay.is_scanning());
        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_is_single_use() {
        let relay = BleRelay::new(
            Arc::new(idle_central(AdapterState::Unknown)),
            None,
            RelayConfig::default(),
        )
        .await
        .unwrap();

        relay.start().await.unwrap();
        relay.shutdown().await.unwrap();
        relay.shutdown().await.unwrap();
        assert!(matches!(relay.start().await, Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_samples_single_consumer() {
        let relay = BleRelay::new(Arc::new(MockBleCentral::new()), None, RelayConfig::default())
            .await
            .unwrap();
        assert!(relay.samples(MeasurementKind::Temperature).is_some());
        assert!(relay.samples(MeasurementKind::Temperature).is_none());
        assert!(relay.samples(MeasurementKind::Humidity).is_some());
    }
}
