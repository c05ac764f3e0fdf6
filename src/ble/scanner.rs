//! BLE scanning functionality.
//!
//! Provides the scanner that discovers peripherals advertising one of the
//! target services and hands them over for connection.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::ble::platform::{Advertisement, BleCentral, PeripheralAddress};

/// How many peripherals one scan session hands over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanMode {
    /// Stop scanning at the first match.
    #[default]
    SingleTarget,
    /// Keep scanning and hand over every distinct peripheral.
    Continuous {
        /// Stop handing over after this many peripherals per session.
        max_peripherals: Option<usize>,
    },
}

/// A peripheral matched by the scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPeripheral {
    /// The BLE peripheral address.
    pub address: PeripheralAddress,
    /// Advertised name.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Advertised services that matched the targets.
    pub matched_services: Vec<Uuid>,
}

/// Why a scan could not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanFailureReason {
    /// `start_scanning` was called with no services.
    NoTargetServices,
    /// The platform refused to start the scan.
    Platform(String),
}

impl ScanFailureReason {
    /// Numeric reason code.
    pub fn code(&self) -> u8 {
        match self {
            Self::NoTargetServices => 1,
            Self::Platform(_) => 2,
        }
    }
}

impl std::fmt::Display for ScanFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoTargetServices => write!(f, "no target services (code {})", self.code()),
            Self::Platform(reason) => write!(f, "{} (code {})", reason, self.code()),
        }
    }
}

/// Output of the scanner.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// A matching peripheral was found and should be connected.
    Discovered(DiscoveredPeripheral),
    /// The scan could not be started.
    Failed {
        /// What went wrong.
        reason: ScanFailureReason,
    },
    /// The scan session ended.
    Stopped,
}

#[derive(Default)]
struct ScanSession {
    active: bool,
    targets: Vec<Uuid>,
    handed_off: HashSet<PeripheralAddress>,
}

/// BLE scanner for discovering target peripherals.
pub struct BleScanner {
    /// The radio to scan with.
    central: Arc<dyn BleCentral>,
    /// Single or continuous.
    mode: ScanMode,
    /// Current session; the lock makes hand-off decisions atomic.
    session: Mutex<ScanSession>,
    /// Channel for scan events.
    event_tx: mpsc::UnboundedSender<ScanEvent>,
}

impl BleScanner {
    /// Create a new scanner and the receiver for its events.
    pub fn new(
        central: Arc<dyn BleCentral>,
        mode: ScanMode,
    ) -> (Self, mpsc::UnboundedReceiver<ScanEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                central,
                mode,
                session: Mutex::new(ScanSession::default()),
                event_tx,
            },
            event_rx,
        )
    }

    /// Start scanning for peripherals advertising any of `targets`.
    ///
    /// Never fails directly: problems are reported as [`ScanEvent::Failed`].
    pub async fn start_scanning(&self, targets: &[Uuid]) {
        if targets.is_empty() {
            error!("Scan requested without target services");
            self.emit(ScanEvent::Failed {
                reason: ScanFailureReason::NoTargetServices,
            });
            return;
        }

        {
            let mut session = self.session.lock();
            if session.active {
                debug!("Already scanning, ignoring start request");
                return;
            }
            *session = ScanSession {
                active: true,
                targets: targets.to_vec(),
                handed_off: HashSet::new(),
            };
        }

        info!("Starting BLE scan for {} service(s)", targets.len());

        if let Err(e) = self.central.start_scan(targets).await {
            error!("Scan failed with reason {}", e);
            self.session.lock().active = false;
            self.emit(ScanEvent::Failed {
                reason: ScanFailureReason::Platform(e.to_string()),
            });
        }
    }

    /// Stop scanning.
    pub async fn stop_scanning(&self) {
        {
            let mut session = self.session.lock();
            if !session.active {
                debug!("Not scanning, ignoring stop request");
                return;
            }
            session.active = false;
        }

        info!("Stopping BLE scan");
        self.stop_platform_scan().await;
        self.emit(ScanEvent::Stopped);
    }

    /// End the session without talking to the radio.
    ///
    /// Used when the adapter goes away and the platform has dropped the scan
    /// on its own. Emits [`ScanEvent::Stopped`] if a session was active.
    pub fn reset_session(&self) {
        {
            let mut session = self.session.lock();
            if !session.active {
                return;
            }
            session.active = false;
        }

        debug!("Scan session reset");
        self.emit(ScanEvent::Stopped);
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        self.session.lock().active
    }

    /// Get the scan mode.
    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// Process an advertisement seen by the platform.
    ///
    /// Returns `true` if the peripheral was handed over.
    pub async fn handle_advertisement(&self, advertisement: &Advertisement) -> bool {
        let (matched_services, ends_session) = {
            let mut session = self.session.lock();
            if !session.active {
                return false;
            }

            let matched: Vec<Uuid> = advertisement
                .services
                .iter()
                .filter(|s| session.targets.contains(s))
                .copied()
                .collect();
            if matched.is_empty() {
                return false;
            }

            if session.handed_off.contains(&advertisement.address) {
                trace!("{} already handed over this session", advertisement.address);
                return false;
            }

            let ends_session = match self.mode {
                ScanMode::SingleTarget => {
                    if !session.handed_off.is_empty() {
                        return false;
                    }
                    true
                }
                ScanMode::Continuous { max_peripherals } => {
                    if max_peripherals.is_some_and(|max| session.handed_off.len() >= max) {
                        return false;
                    }
                    // The peripheral that fills the cap closes the session.
                    max_peripherals.is_some_and(|max| session.handed_off.len() + 1 >= max)
                }
            };

            session.handed_off.insert(advertisement.address.clone());
            if ends_session {
                session.active = false;
            }
            (matched, ends_session)
        };

        info!(
            "Found peripheral '{}' ({}) with RSSI {:?}",
            advertisement.name.as_deref().unwrap_or("unknown"),
            advertisement.address,
            advertisement.rssi
        );

        if ends_session {
            self.stop_platform_scan().await;
        }

        self.emit(ScanEvent::Discovered(DiscoveredPeripheral {
            address: advertisement.address.clone(),
            name: advertisement.name.clone(),
            rssi: advertisement.rssi,
            matched_services,
        }));

        if ends_session {
            self.emit(ScanEvent::Stopped);
        }

        true
    }

    async fn stop_platform_scan(&self) {
        if let Err(e) = self.central.stop_scan().await {
            error!("Failed to stop scan: {}", e);
        }
    }

    fn emit(&self, event: ScanEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        self.session.get_mut().active = false;
    }
}
