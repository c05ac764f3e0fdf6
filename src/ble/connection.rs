//! BLE connection supervision.
//!
//! A [`ConnectionSupervisor`] owns one peripheral's link. It issues connect
//! requests, reacts to the state changes the platform reports, starts a
//! decoder session on every connection, and schedules a delayed reconnect
//! check whenever an established link drops.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::ble::characteristics::CharacteristicDecoder;
use crate::ble::platform::{BlePeripheral, BondState, PeripheralAddress};
use crate::error::{Error, Result};

/// Connection state for a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not connected to the peripheral.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected to the peripheral.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    /// The peripheral.
    pub address: PeripheralAddress,
    /// The new connection state.
    pub state: ConnectionState,
}

/// When and how often to retry a dropped connection.
///
/// The default waits a fixed 15 seconds and never gives up.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect check.
    pub delay: Duration,
    /// Growth factor per consecutive failed attempt. `1.0` keeps the delay fixed.
    pub backoff_multiplier: f64,
    /// Upper bound for a grown delay.
    pub max_delay: Duration,
    /// Give up after this many consecutive attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Default reconnect delay.
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(15);

    /// Fixed delay, unlimited attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            backoff_multiplier: 1.0,
            max_delay: delay,
            max_attempts: None,
        }
    }

    /// Cap the number of consecutive attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Grow the delay geometrically up to `max_delay`.
    pub fn with_backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.backoff_multiplier = multiplier;
        self.max_delay = max_delay;
        self
    }

    /// Delay before the check following `attempts` failed attempts.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        if self.backoff_multiplier <= 1.0 || attempts == 0 {
            return self.delay;
        }
        let grown = self.delay.as_secs_f64() * self.backoff_multiplier.powi(attempts as i32);
        let capped = grown.min(self.max_delay.as_secs_f64()).max(self.delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Whether another attempt is allowed after `attempts` attempts.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Self::DEFAULT_DELAY)
    }
}

/// Supervises the connection to a single peripheral.
pub struct ConnectionSupervisor {
    /// The peripheral to manage.
    peripheral: Arc<dyn BlePeripheral>,
    /// Cached address of the peripheral.
    address: PeripheralAddress,
    /// Decoder run on every successful connection.
    decoder: Arc<CharacteristicDecoder>,
    /// Reconnect timing.
    policy: ReconnectPolicy,
    /// Current connection state.
    state: RwLock<ConnectionState>,
    /// Bumped on every state change; lets a delayed check detect that
    /// anything happened while it slept.
    epoch: AtomicU64,
    /// Whether the link has ever been established.
    was_connected: AtomicBool,
    /// Whether to maintain the connection (auto-reconnect).
    maintain_connection: AtomicBool,
    /// Set once by `shutdown`.
    is_shut_down: AtomicBool,
    /// Consecutive reconnect attempts since the last successful connection.
    reconnect_attempts: AtomicU32,
    /// Channel for connection events.
    event_tx: broadcast::Sender<ConnectionEvent>,
    /// The running decoder session.
    session: Mutex<Option<JoinHandle<()>>>,
    /// Pending reconnect checks.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    /// Create a supervisor for a peripheral.
    pub fn new(
        peripheral: Arc<dyn BlePeripheral>,
        decoder: Arc<CharacteristicDecoder>,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(16);
        let address = peripheral.address();

        Arc::new(Self {
            peripheral,
            address,
            decoder,
            policy,
            state: RwLock::new(ConnectionState::Disconnected),
            epoch: AtomicU64::new(0),
            was_connected: AtomicBool::new(false),
            maintain_connection: AtomicBool::new(false),
            is_shut_down: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            event_tx,
            session: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Get the peripheral's address.
    pub fn address(&self) -> &PeripheralAddress {
        &self.address
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Consecutive reconnect attempts since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Check if we're maintaining the connection.
    pub fn is_maintaining_connection(&self) -> bool {
        self.maintain_connection.load(Ordering::SeqCst)
    }

    /// Connect to the peripheral and keep the link up afterwards.
    ///
    /// A failed initial connect is not retried; the peripheral stays
    /// `Disconnected` until it is handed over again.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_shut_down.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed {
                reason: "Supervisor shut down".to_string(),
            });
        }
        self.maintain_connection.store(true, Ordering::SeqCst);
        self.attempt_connect(false).await
    }

    async fn attempt_connect(self: &Arc<Self>, is_reconnect: bool) -> Result<()> {
        let current_state = self.state();

        if current_state.is_connected() {
            debug!("{} already connected", self.address);
            return Ok(());
        }

        if current_state.is_transitioning() {
            return Err(Error::ConnectionFailed {
                reason: "Connection already in progress".to_string(),
            });
        }

        self.set_state(ConnectionState::Connecting);

        match self.peripheral.connect().await {
            Ok(()) => {
                info!("Connected to {}", self.address);
                self.handle_state_change(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                error!("Connection to {} failed: {}", self.address, e);

                // A platform report may have moved the state on meanwhile; if it
                // reported Disconnected, that report already scheduled the check.
                let reverted =
                    self.set_state_from(ConnectionState::Connecting, ConnectionState::Disconnected);

                if is_reconnect && reverted {
                    self.schedule_reconnect();
                }

                Err(Error::ConnectionFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Apply a connection state reported by the platform.
    ///
    /// Reports may be duplicated or arrive out of order relative to our own
    /// commands; a report matching the current state is ignored.
    pub fn handle_state_change(self: &Arc<Self>, new_state: ConnectionState) {
        if self.is_shut_down.load(Ordering::SeqCst) {
            trace!("Ignoring {} for shut down supervisor {}", new_state, self.address);
            return;
        }

        info!("Peripheral {} is {}", self.address, new_state);

        if !self.set_state(new_state) {
            trace!("Duplicate {} report for {}", new_state, self.address);
            return;
        }

        match new_state {
            ConnectionState::Connected => {
                self.was_connected.store(true, Ordering::SeqCst);
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.start_session();
            }
            ConnectionState::Disconnected => {
                self.stop_session();
                if self.was_connected.load(Ordering::SeqCst)
                    && self.maintain_connection.load(Ordering::SeqCst)
                {
                    self.schedule_reconnect();
                }
            }
            ConnectionState::Connecting | ConnectionState::Disconnecting => {}
        }
    }

    /// Observe a bond state change. Logged only.
    pub fn handle_bond_state(&self, state: BondState) {
        info!("Bond state of {} is {:?}", self.address, state);
    }

    /// Schedule a reconnect check after the policy delay.
    fn schedule_reconnect(self: &Arc<Self>) {
        let attempts = self.reconnect_attempts();
        if !self.policy.allows(attempts) {
            warn!(
                "Giving up on {} after {} reconnect attempts",
                self.address, attempts
            );
            return;
        }

        let delay = self.policy.delay_for(attempts);
        let epoch = self.epoch.load(Ordering::SeqCst);
        let this = Arc::clone(self);

        debug!("Reconnect check for {} in {:?}", self.address, delay);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            if !this.still_disconnected_since(epoch) {
                debug!("{} changed state meanwhile, skipping reconnect", this.address);
                return;
            }

            if this.peripheral.is_connected().await.unwrap_or(false) {
                info!("{} reconnected through the platform", this.address);
                this.handle_state_change(ConnectionState::Connected);
                return;
            }

            let attempt = this.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            info!("Reconnecting to {} (attempt {})", this.address, attempt);

            if let Err(e) = this.attempt_connect(true).await {
                debug!("Reconnect attempt {} to {} failed: {}", attempt, this.address, e);
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn still_disconnected_since(&self, epoch: u64) -> bool {
        !self.is_shut_down.load(Ordering::SeqCst)
            && self.maintain_connection.load(Ordering::SeqCst)
            && self.epoch.load(Ordering::SeqCst) == epoch
            && self.state() == ConnectionState::Disconnected
    }

    fn start_session(&self) {
        let decoder = self.decoder.clone();
        let peripheral = self.peripheral.clone();
        let address = self.address.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = decoder.run_session(peripheral).await {
                error!("Characteristic setup for {} failed: {}", address, e);
            }
        });

        if let Some(previous) = self.session.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_session(&self) {
        if let Some(session) = self.session.lock().take() {
            session.abort();
        }
    }

    /// Disconnect from the peripheral and stop maintaining the link.
    pub async fn disconnect(&self) -> Result<()> {
        self.maintain_connection.store(false, Ordering::SeqCst);

        let current_state = self.state();

        if matches!(
            current_state,
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        ) {
            return Ok(());
        }

        self.set_state(ConnectionState::Disconnecting);
        self.stop_session();

        match self.peripheral.disconnect().await {
            Ok(()) => {
                info!("Disconnected from {}", self.address);
                self.set_state(ConnectionState::Disconnected);
                Ok(())
            }
            Err(e) => {
                error!("Failed to disconnect from {}: {}", self.address, e);
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Abort every task this supervisor started. Later state reports are ignored.
    pub fn shutdown(&self) {
        self.is_shut_down.store(true, Ordering::SeqCst);
        self.maintain_connection.store(false, Ordering::SeqCst);
        self.stop_session();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Update the connection state and emit an event. Returns whether it changed.
    fn set_state(&self, new_state: ConnectionState) -> bool {
        let old_state = std::mem::replace(&mut *self.state.write(), new_state);
        self.state_changed(old_state, new_state)
    }

    /// Move to `new_state` only if the current state is `expected`.
    fn set_state_from(&self, expected: ConnectionState, new_state: ConnectionState) -> bool {
        {
            let mut state = self.state.write();
            if *state != expected {
                return false;
            }
            *state = new_state;
        }
        self.state_changed(expected, new_state)
    }

    fn state_changed(&self, old_state: ConnectionState, new_state: ConnectionState) -> bool {
        if old_state == new_state {
            return false;
        }

        self.epoch.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Connection state of {} changed: {} -> {}",
            self.address, old_state, new_state
        );

        let _ = self.event_tx.send(ConnectionEvent {
            address: self.address.clone(),
            state: new_state,
        });

        true
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
