//! BLE peripheral session state machine.
//!
//! Tracks the one peer allowed to talk to the GATT service and decides when
//! advertising is restarted.
//!
//! # States
//!
//! ```text
//! Idle ──start_advertising──▶ Advertising ──connect ok──▶ Connected(conn)
//!                               ▲    │ connect failed           │
//!                               │    └──(re-advertise)──┘       │ disconnect
//!                               │                               ▼
//!                               └──────adv complete────── AwaitingAdvertise
//! ```
//!
//! The connection handle lives inside [`SessionState::Connected`], so it is
//! set exactly when the session is connected.
//!
//! # Advertising restart policy
//!
//! Advertising is always restarted when an advertising period completes.
//! Whether it is also restarted after a failed connection attempt or after
//! a disconnect is configured through [`SessionPolicy`]. By default the
//! session re-advertises after a failed connect and waits for the stack's
//! adv-complete event after a disconnect.
//!
//! # Example
//!
//! ```
//! use gatt_wifi_esp32::ble::{BleSession, HostBle, SessionPolicy, SessionState};
//! use gatt_wifi_esp32::transport::{ConnHandle, GapEvent, NullSink, StatusCode};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let mut session = BleSession::new(
//!     HostBle::default(),
//!     SessionPolicy::default(),
//!     Arc::new(NullSink),
//!     CancellationToken::new(),
//! )
//! .unwrap();
//!
//! session.start_advertising().unwrap();
//! session
//!     .on_event(GapEvent::Connect { status: StatusCode::OK, conn: ConnHandle(1) })
//!     .unwrap();
//! assert_eq!(session.state(), SessionState::Connected(ConnHandle(1)));
//! ```

use super::notify::{Notifier, SendError};
use crate::transport::{
    AddressType, AdvFields, AdvParams, AdvertiseDuration, AttrHandle, BleDriver,
    CancellableSink, ConnHandle, EventSink, GapEvent, StatusCode,
};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Bytes served on a read when no [`ReadSource`] has been installed.
pub const DEFAULT_READ_PAYLOAD: &[u8] = b"Data from the server";

/// Produces the bytes served when the peer reads the read/notify
/// characteristic.
pub type ReadSource = Box<dyn FnMut(ConnHandle) -> Vec<u8> + Send>;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not advertising, never connected.
    Idle,
    /// Advertising and waiting for a peer.
    Advertising,
    /// A peer is connected on the given handle.
    Connected(ConnHandle),
    /// Peer gone (or advertising failed); advertising will resume on the
    /// next adv-complete event or explicit `start_advertising`.
    AwaitingAdvertise,
}

/// Advertising restart policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Restart advertising after a failed connection attempt.
    pub readvertise_on_connect_failure: bool,
    /// Restart advertising right after a disconnect instead of waiting for
    /// the stack's adv-complete event.
    pub readvertise_on_disconnect: bool,
    /// Own-address type used when advertising.
    pub address_type: AddressType,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            readvertise_on_connect_failure: true,
            readvertise_on_disconnect: false,
            address_type: AddressType::Public,
        }
    }
}

/// Errors raised by the session while talking to the BLE driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    /// The driver rejected a primitive (registration or advertise start).
    TransportFailure(StatusCode),
    /// The session's cancellation token has fired.
    Cancelled,
}

impl fmt::Display for BleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportFailure(status) => write!(f, "BLE transport failure: {}", status),
            Self::Cancelled => write!(f, "BLE session cancelled"),
        }
    }
}

impl std::error::Error for BleError {}

/// Single-client BLE peripheral session.
pub struct BleSession<D: BleDriver> {
    driver: D,
    state: SessionState,
    /// Notify characteristic, fixed when the service was registered.
    notify_chr: AttrHandle,
    /// Most recent write; replaced, never appended.
    last_written: Vec<u8>,
    advertising_active: bool,
    policy: SessionPolicy,
    read_source: ReadSource,
    /// Continuation handed to the driver with every advertise call.
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    notifier: Notifier,
}

impl<D: BleDriver> BleSession<D> {
    /// Register the GATT service with `driver` and create an idle session.
    ///
    /// `sink` receives GAP and GATT events from the driver. It is wrapped so
    /// that nothing is delivered once `cancel` fires.
    pub fn new(
        mut driver: D,
        policy: SessionPolicy,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Result<Self, BleError> {
        let sink: Arc<dyn EventSink> = Arc::new(CancellableSink::new(sink, cancel.clone()));
        let notify_chr = driver
            .register_gatt(sink.clone())
            .map_err(BleError::TransportFailure)?;
        driver
            .set_read_value(notify_chr, DEFAULT_READ_PAYLOAD)
            .map_err(BleError::TransportFailure)?;

        Ok(Self {
            driver,
            state: SessionState::Idle,
            notify_chr,
            last_written: Vec::new(),
            advertising_active: false,
            policy,
            read_source: Box::new(|_| DEFAULT_READ_PAYLOAD.to_vec()),
            sink,
            cancel,
            notifier: Notifier::new(),
        })
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Handle of the connected peer, if any.
    pub fn connection_handle(&self) -> Option<ConnHandle> {
        match self.state {
            SessionState::Connected(conn) => Some(conn),
            _ => None,
        }
    }

    /// Check if a peer is connected.
    pub fn is_connected(&self) -> bool {
        self.connection_handle().is_some()
    }

    /// Whether an advertising period is running.
    pub fn advertising_active(&self) -> bool {
        self.advertising_active
    }

    /// Handle of the read/notify characteristic.
    pub fn notify_characteristic(&self) -> AttrHandle {
        self.notify_chr
    }

    /// Most recent payload written by the peer.
    pub fn last_written(&self) -> &[u8] {
        &self.last_written
    }

    /// Restart policy in effect.
    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    /// Replace the restart policy.
    pub fn set_policy(&mut self, policy: SessionPolicy) {
        self.policy = policy;
    }

    /// Install the source of read responses.
    pub fn set_read_source<F>(&mut self, source: F)
    where
        F: FnMut(ConnHandle) -> Vec<u8> + Send + 'static,
    {
        self.read_source = Box::new(source);
        if let Some(conn) = self.connection_handle() {
            self.publish_read_value(conn);
        }
    }

    /// Hand the read response for `conn` to the driver, so a stack that
    /// answers reads on its own task never waits on the session.
    fn publish_read_value(&mut self, conn: ConnHandle) {
        let data = (self.read_source)(conn);
        if let Err(status) = self.driver.set_read_value(self.notify_chr, &data) {
            warn!("Failed to store read value: {}", status);
        }
    }

    /// Notification counters.
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// The underlying driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Start (or restart) advertising.
    ///
    /// Advertises the driver's device name as a complete local name,
    /// undirected connectable and general discoverable, with no timeout.
    /// Returns [`BleError::Cancelled`] without touching the driver once the
    /// session's token has fired.
    pub fn start_advertising(&mut self) -> Result<(), BleError> {
        if self.cancel.is_cancelled() {
            return Err(BleError::Cancelled);
        }

        let fields = AdvFields {
            name: self.driver.device_name(),
            name_is_complete: true,
        };
        let params = AdvParams::connectable();

        match self.driver.advertise_start(
            self.policy.address_type,
            &fields,
            &params,
            AdvertiseDuration::Forever,
            self.sink.clone(),
        ) {
            Ok(()) => {
                self.advertising_active = true;
                if !self.is_connected() {
                    self.state = SessionState::Advertising;
                }
                info!("Advertising as '{}'", fields.name);
                Ok(())
            }
            Err(status) => {
                self.advertising_active = false;
                if self.state == SessionState::Advertising {
                    self.state = SessionState::AwaitingAdvertise;
                }
                warn!("Failed to start advertising: {}", status);
                Err(BleError::TransportFailure(status))
            }
        }
    }

    /// Feed a GAP event into the machine.
    pub fn on_event(&mut self, event: GapEvent) -> Result<(), BleError> {
        match event {
            GapEvent::Connect { status, conn } => self.on_connect(status, conn),
            GapEvent::Disconnect { conn, reason } => self.on_disconnect(conn, reason),
            GapEvent::AdvComplete { reason } => self.on_adv_complete(reason),
        }
    }

    /// A connection attempt finished.
    ///
    /// On success the peer becomes the session's single client, replacing any
    /// previous handle. On failure the session stays on the advertising side
    /// and, per policy, advertises again.
    pub fn on_connect(&mut self, status: StatusCode, conn: ConnHandle) -> Result<(), BleError> {
        // The stack stops advertising whenever a connect event is raised.
        self.advertising_active = false;

        if status.is_ok() {
            if let SessionState::Connected(previous) = self.state {
                warn!("New connection {} replaces {}", conn, previous);
            }
            info!("BLE connected: {}", conn);
            self.state = SessionState::Connected(conn);
            self.publish_read_value(conn);
            return Ok(());
        }

        warn!("BLE connection failed: {}", status);
        if self.is_connected() {
            return Ok(());
        }
        if self.policy.readvertise_on_connect_failure {
            self.state = SessionState::Advertising;
            self.start_advertising()
        } else {
            self.state = SessionState::AwaitingAdvertise;
            Ok(())
        }
    }

    /// The peer disconnected.
    pub fn on_disconnect(&mut self, conn: ConnHandle, reason: i32) -> Result<(), BleError> {
        match self.state {
            SessionState::Connected(current) if current == conn => {}
            SessionState::Connected(current) => {
                debug!("Ignoring disconnect for {} (connected: {})", conn, current);
                return Ok(());
            }
            _ => {
                debug!("Ignoring disconnect for {} while not connected", conn);
                return Ok(());
            }
        }

        info!("BLE disconnected: {} (reason {})", conn, reason);
        self.state = SessionState::AwaitingAdvertise;

        if self.policy.readvertise_on_disconnect {
            self.start_advertising()
        } else {
            Ok(())
        }
    }

    /// An advertising period ended; advertise again.
    pub fn on_adv_complete(&mut self, reason: i32) -> Result<(), BleError> {
        debug!("Advertising complete (reason {})", reason);
        self.advertising_active = false;
        self.start_advertising()
    }

    /// The peer wrote to the write characteristic.
    ///
    /// The payload replaces the previous one. Neither the payload length nor
    /// the writer's connection handle is checked, and the access always
    /// succeeds.
    pub fn on_write_received(
        &mut self,
        conn: ConnHandle,
        attr: AttrHandle,
        payload: Vec<u8>,
    ) -> StatusCode {
        if self.connection_handle() != Some(conn) {
            debug!("Write from {} which is not the tracked peer", conn);
        }
        debug!("Write on {:?}: {} bytes", attr, payload.len());
        self.last_written = payload;
        StatusCode::OK
    }

    /// The peer read the read/notify characteristic; append the response
    /// to `out`.
    pub fn on_read_requested(
        &mut self,
        conn: ConnHandle,
        attr: AttrHandle,
        out: &mut Vec<u8>,
    ) -> StatusCode {
        let data = (self.read_source)(conn);
        debug!("Read on {:?}: serving {} bytes", attr, data.len());
        out.extend_from_slice(&data);
        StatusCode::OK
    }

    /// Notify the connected peer on the read/notify characteristic.
    pub fn notify(&mut self, payload: &[u8]) -> Result<(), SendError> {
        let conn = self.connection_handle();
        self.notifier
            .dispatch(&mut self.driver, conn, self.notify_chr, payload)
    }
}
