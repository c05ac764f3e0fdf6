//! Radio power state tracking.
//!
//! Scanning is started whenever the adapter reports `PoweredOn`, at most
//! once per outstanding scan session.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::platform::AdapterState;
use crate::ble::scanner::BleScanner;

/// Watches the adapter and starts the scanner when the radio comes on.
pub struct AdapterMonitor {
    scanner: Arc<BleScanner>,
    targets: Vec<Uuid>,
    state: RwLock<AdapterState>,
    /// Set while a scan triggered by this monitor has not finished.
    scan_outstanding: AtomicBool,
}

impl AdapterMonitor {
    /// Create a monitor that scans for `targets`.
    pub fn new(scanner: Arc<BleScanner>, targets: Vec<Uuid>) -> Self {
        Self {
            scanner,
            targets,
            state: RwLock::new(AdapterState::Unknown),
            scan_outstanding: AtomicBool::new(false),
        }
    }

    /// Last observed adapter state.
    pub fn state(&self) -> AdapterState {
        *self.state.read()
    }

    /// Apply an adapter state report.
    ///
    /// Returns `true` if this report started a scan.
    pub async fn handle_state(&self, state: AdapterState) -> bool {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!("Adapter state changed: {:?} -> {:?}", previous, state);
        }

        match state {
            AdapterState::PoweredOn => {
                if self
                    .scan_outstanding
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    debug!("Scan already outstanding, ignoring PoweredOn");
                    return false;
                }

                info!("Bluetooth adapter powered on, starting scan");
                self.scanner.start_scanning(&self.targets).await;
                true
            }
            AdapterState::PoweredOff => {
                warn!("Bluetooth adapter powered off");
                self.scanner.reset_session();
                self.scan_outstanding.store(false, Ordering::SeqCst);
                false
            }
            AdapterState::Unknown => {
                info!("Bluetooth adapter state unknown");
                self.scanner.reset_session();
                self.scan_outstanding.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Mark the outstanding scan as finished so the next `PoweredOn` scans again.
    pub fn scan_finished(&self) {
        self.scan_outstanding.store(false, Ordering::SeqCst);
    }
}
