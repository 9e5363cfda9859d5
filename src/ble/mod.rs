//! BLE peripheral session.
//!
//! This module contains the single-client GATT peripheral: the session state
//! machine, the notification dispatcher and the drivers that back it.
//!
//! # Components
//!
//! - [`session`] - connection lifecycle and advertising restart policy
//! - [`notify`] - outbound notifications on the read/notify characteristic
//! - [`host`] - loopback driver for host builds and tests
//! - [`nimble`] - esp32-nimble driver (ESP32 only)

mod host;
mod notify;
mod session;

#[cfg(feature = "esp32")]
mod nimble;

pub use host::{AdvertiseCall, HostBle, NotifyCall, HOST_NOTIFY_HANDLE, HOST_WRITE_HANDLE};
pub use notify::{Notifier, SendError};
pub use session::{
    BleError, BleSession, ReadSource, SessionPolicy, SessionState, DEFAULT_READ_PAYLOAD,
};

#[cfg(feature = "esp32")]
pub use nimble::NimbleDriver;
