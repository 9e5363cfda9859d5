//! Station-mode Wi-Fi driver primitives.

use super::events::{EventSink, StatusCode};
use std::sync::Arc;

/// Wi-Fi operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiMode {
    /// Client joining an existing access point.
    Station,
}

/// Scan filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Only report this SSID.
    pub ssid: Option<String>,
    /// Only scan this channel (`None` = all channels).
    pub channel: Option<u8>,
    /// Include networks that hide their SSID.
    pub show_hidden: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            ssid: None,
            channel: None,
            show_hidden: true,
        }
    }
}

/// One access point seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord {
    /// Network name (may be empty for hidden networks).
    pub ssid: String,
    /// Signal strength in dBm.
    pub rssi: i8,
    /// Primary channel.
    pub channel: u8,
}

/// Station-mode Wi-Fi driver.
///
/// Implemented over `esp_idf_svc::wifi::EspWifi` on the device and by
/// `wifi::HostWifi` on the host. `connect` only initiates association; the
/// outcome arrives later as events on the subscribed sink.
pub trait WifiDriver: Send {
    /// Route station and IP events to `sink`.
    fn subscribe(&mut self, sink: Arc<dyn EventSink>) -> Result<(), StatusCode>;

    /// Select the operating mode.
    fn set_mode(&mut self, mode: WifiMode) -> Result<(), StatusCode>;

    /// Store station credentials.
    fn set_config(&mut self, ssid: &str, passphrase: &str) -> Result<(), StatusCode>;

    /// Start the driver.
    fn start(&mut self) -> Result<(), StatusCode>;

    /// Begin association with the configured access point.
    fn connect(&mut self) -> Result<(), StatusCode>;

    /// Start a scan. With `blocking`, returns once the scan is done.
    fn scan_start(&mut self, config: &ScanConfig, blocking: bool) -> Result<(), StatusCode>;

    /// Fetch at most `max_count` records from the last scan.
    fn scan_get_records(&mut self, max_count: usize) -> Result<Vec<ScanRecord>, StatusCode>;
}
