//! Radio events and the sink the drivers report them to.
//!
//! Each stack callback (GAP event switch, GATT access callback, Wi-Fi and
//! IP event handlers) is translated by its driver into one of the enums
//! below and pushed into an [`EventSink`]. The sink is the only way events
//! reach the state machines, which keeps them testable without a radio.

use super::ble::{AttrHandle, ConnHandle};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Raw status code returned by a driver primitive.
///
/// Mirrors `esp_err_t` / NimBLE return codes: zero is success, anything
/// else is a driver-specific failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub i32);

impl StatusCode {
    /// Success.
    pub const OK: Self = Self(0);
    /// Generic failure (`ESP_FAIL`).
    pub const FAIL: Self = Self(-1);
    /// Invalid argument (`ESP_ERR_INVALID_ARG`).
    pub const INVALID_ARG: Self = Self(0x102);

    /// Check if this code reports success.
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Convert into a `Result`, treating non-zero as failure.
    pub fn into_result(self) -> Result<(), StatusCode> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {}", self.0)
    }
}

/// GAP events delivered by the BLE stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapEvent {
    /// A connection attempt finished. `status` is zero on success.
    Connect { status: StatusCode, conn: ConnHandle },
    /// The peer disconnected.
    Disconnect { conn: ConnHandle, reason: i32 },
    /// An advertising period ended (timeout or stopped by the stack).
    AdvComplete { reason: i32 },
}

/// Station-mode Wi-Fi events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiEvent {
    /// The station interface started.
    StaStart,
    /// Associated with the access point (no IP yet).
    StaConnected,
    /// Association lost or failed. `reason` is the 802.11 reason code when
    /// the driver provides one.
    StaDisconnected { reason: Option<u16> },
}

/// IP-layer events for the station interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpEvent {
    /// DHCP assigned an address.
    StaGotIp { ip: Ipv4Addr },
}

/// Every event a driver can raise, as one tagged union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// BLE GAP event.
    Gap(GapEvent),
    /// Data written to the write characteristic.
    GattWrite {
        conn: ConnHandle,
        attr: AttrHandle,
        payload: Vec<u8>,
    },
    /// Wi-Fi station event.
    Wifi(WifiEvent),
    /// IP event.
    Ip(IpEvent),
}

/// Receiver for driver events.
///
/// Implementations must be callable from the driver's own execution
/// context (NimBLE host task, ESP-IDF event loop task), hence
/// `Send + Sync`.
pub trait EventSink: Send + Sync {
    /// A GAP event occurred.
    fn on_ble_gap_event(&self, event: GapEvent);

    /// The peer wrote to the write characteristic.
    fn on_gatt_write(&self, conn: ConnHandle, attr: AttrHandle, payload: Vec<u8>);

    /// The peer read the notify/read characteristic. Returns the bytes to
    /// serve; the stack answers synchronously.
    ///
    /// Only drivers that do not hold a stack lock while reading call this.
    /// Others serve the value stored with `BleDriver::set_read_value`.
    fn on_gatt_read(&self, conn: ConnHandle, attr: AttrHandle) -> Vec<u8>;

    /// A Wi-Fi station event occurred.
    fn on_wifi_event(&self, event: WifiEvent);

    /// An IP event occurred.
    fn on_ip_event(&self, event: IpEvent);
}

/// Sink wrapper that drops events once its token is cancelled.
///
/// This is the continuation the state machines hand to the drivers. The
/// token is checked at the top of every callback, so a shutdown sequence
/// stops driver events from reaching the machines even though the stack
/// itself cannot be cancelled mid-flight.
pub struct CancellableSink {
    inner: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl CancellableSink {
    /// Wrap `inner`, guarded by `cancel`.
    pub fn new(inner: Arc<dyn EventSink>, cancel: CancellationToken) -> Self {
        Self { inner, cancel }
    }

    /// Whether the guarding token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl EventSink for CancellableSink {
    fn on_ble_gap_event(&self, event: GapEvent) {
        if self.is_cancelled() {
            log::debug!("Dropping GAP event after shutdown: {:?}", event);
            return;
        }
        self.inner.on_ble_gap_event(event);
    }

    fn on_gatt_write(&self, conn: ConnHandle, attr: AttrHandle, payload: Vec<u8>) {
        if self.is_cancelled() {
            return;
        }
        self.inner.on_gatt_write(conn, attr, payload);
    }

    fn on_gatt_read(&self, conn: ConnHandle, attr: AttrHandle) -> Vec<u8> {
        if self.is_cancelled() {
            return Vec::new();
        }
        self.inner.on_gatt_read(conn, attr)
    }

    fn on_wifi_event(&self, event: WifiEvent) {
        if self.is_cancelled() {
            log::debug!("Dropping Wi-Fi event after shutdown: {:?}", event);
            return;
        }
        self.inner.on_wifi_event(event);
    }

    fn on_ip_event(&self, event: IpEvent) {
        if self.is_cancelled() {
            return;
        }
        self.inner.on_ip_event(event);
    }
}

/// Sink that discards everything. Useful when a machine is driven purely
/// by direct `on_event` calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_ble_gap_event(&self, _event: GapEvent) {}
    fn on_gatt_write(&self, _conn: ConnHandle, _attr: AttrHandle, _payload: Vec<u8>) {}
    fn on_gatt_read(&self, _conn: ConnHandle, _attr: AttrHandle) -> Vec<u8> {
        Vec::new()
    }
    fn on_wifi_event(&self, _event: WifiEvent) {}
    fn on_ip_event(&self, _event: IpEvent) {}
}
