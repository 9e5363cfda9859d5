//! BLE GATT peripheral and Wi-Fi station library for ESP32.
//!
//! The state machines and drivers' interface are platform-independent and
//! tested on the host with loopback drivers; the `esp32` feature adds the
//! esp32-nimble and esp-idf-svc backed drivers.
//!
//! # Modules
//!
//! - [`transport`] - driver traits, radio events and the event sink
//! - [`ble`] - single-client GATT session and notifications
//! - [`wifi`] - station link with bounded reconnects, and scanning
//! - [`dispatch`] - the task that owns both machines
//! - [`config`] - runtime configuration and credentials

pub mod ble;
pub mod config;
pub mod dispatch;
pub mod transport;
pub mod wifi;

// Re-export commonly used items
pub use ble::{BleError, BleSession, SendError, SessionPolicy, SessionState};
pub use config::{ShimConfig, ShimConfigError};
pub use dispatch::{DispatchError, Dispatcher, ShimHandle, ShimStatus, StatusUpdate};
pub use transport::{BleDriver, EventSink, RadioEvent, StatusCode, WifiDriver};
pub use wifi::{ConfigError, LinkConfig, LinkState, WifiConfig, WifiError, WifiLink};
