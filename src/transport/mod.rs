//! Transport driver interface.
//!
//! The radio stacks (NimBLE for Bluetooth, the ESP-IDF Wi-Fi driver) sit
//! below this boundary. The state machines in [`crate::ble`] and
//! [`crate::wifi`] only ever talk to the traits defined here, and the
//! drivers only ever report back through an [`EventSink`].
//!
//! # Components
//!
//! - [`events`] - tagged-union radio events and the [`EventSink`] trait
//! - [`ble`] - [`BleDriver`] and advertising parameters
//! - [`wifi`] - [`WifiDriver`], scan configuration and access-point records
//!
//! Implementations live next to the state machines that consume them:
//! `ble::HostBle` / `wifi::HostWifi` for the host, and the esp32-nimble and
//! esp-idf-svc backed drivers behind the `esp32` feature.

mod ble;
mod events;
mod wifi;

pub use ble::{
    AddressType, AdvFields, AdvParams, AdvertiseDuration, AttrHandle, BleDriver, ConnHandle,
    ConnMode, DiscMode, MessageBuffer,
};
pub use events::{
    CancellableSink, EventSink, GapEvent, IpEvent, NullSink, RadioEvent, StatusCode, WifiEvent,
};
pub use wifi::{ScanConfig, ScanRecord, WifiDriver, WifiMode};
