//! Wi-Fi station link.
//!
//! # Components
//!
//! - [`config`] - credential validation with zeroize-on-drop
//! - [`link`] - station state machine with bounded reconnects
//! - [`scan`] - blocking access-point scan
//! - [`host`] - loopback driver for host builds and tests
//! - [`esp`] - ESP-IDF driver wrapper (ESP32 only)

mod config;
mod host;
mod link;
mod scan;

#[cfg(feature = "esp32")]
mod esp;

pub use config::{
    ConfigError, CredentialField, WifiConfig, MAX_PASSWORD_LEN, MAX_SSID_LEN, MIN_PASSWORD_LEN,
};
pub use host::{HostWifi, WifiCall};
pub use link::{LinkConfig, LinkState, WifiError, WifiLink, DEFAULT_MAX_RETRIES};
pub use scan::{scan, ScanError, DEFAULT_SCAN_CAPACITY};

#[cfg(feature = "esp32")]
pub use esp::EspWifiDriver;
