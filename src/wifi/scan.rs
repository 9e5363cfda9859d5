//! Access-point scan.

use crate::transport::{ScanConfig, ScanRecord, StatusCode, WifiDriver};
use log::{debug, info, warn};
use std::fmt;

/// Records kept from one scan by default.
pub const DEFAULT_SCAN_CAPACITY: usize = 3;

/// Scan failures, by the primitive that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanError {
    /// Starting the scan failed.
    Start(StatusCode),
    /// Fetching the records failed.
    Records(StatusCode),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start(status) => write!(f, "scan start failed: {}", status),
            Self::Records(status) => write!(f, "reading scan records failed: {}", status),
        }
    }
}

impl std::error::Error for ScanError {}

/// Run one blocking scan (all channels, hidden networks included) and
/// return at most `max_records` access points.
///
/// `max_records == 0` returns an empty list without touching the driver.
pub fn scan<D: WifiDriver + ?Sized>(
    driver: &mut D,
    max_records: usize,
) -> Result<Vec<ScanRecord>, ScanError> {
    if max_records == 0 {
        return Ok(Vec::new());
    }

    let config = ScanConfig::default();
    driver.scan_start(&config, true).map_err(|status| {
        warn!("WiFi scan failed to start: {}", status);
        ScanError::Start(status)
    })?;

    let mut records = driver.scan_get_records(max_records).map_err(|status| {
        warn!("Reading scan results failed: {}", status);
        ScanError::Records(status)
    })?;
    records.truncate(max_records);

    info!("Scan found {} access point(s)", records.len());
    for record in &records {
        debug!(
            "  '{}' rssi {} dBm, channel {}",
            record.ssid, record.rssi, record.channel
        );
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wifi::{HostWifi, WifiCall};

    fn ap(ssid: &str, rssi: i8) -> ScanRecord {
        ScanRecord {
            ssid: ssid.to_string(),
            rssi,
            channel: 6,
        }
    }

    #[test]
    fn test_scan_returns_at_most_max_records() {
        let mut driver = HostWifi::new();
        driver.set_access_points(vec![ap("a", -30), ap("b", -50), ap("c", -70), ap("d", -90)]);

        let records = scan(&mut driver, DEFAULT_SCAN_CAPACITY).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].ssid, "a");

        assert_eq!(
            driver.calls(),
            vec![
                WifiCall::ScanStart { blocking: true },
                WifiCall::ScanGetRecords { max_count: 3 },
            ]
        );
    }

    #[test]
    fn test_scan_with_fewer_access_points() {
        let mut driver = HostWifi::new();
        driver.set_access_points(vec![ap("only", -40)]);
        assert_eq!(scan(&mut driver, 3).unwrap(), vec![ap("only", -40)]);
    }

    #[test]
    fn test_zero_capacity_skips_driver() {
        let mut driver = HostWifi::new();
        driver.set_access_points(vec![ap("a", -30)]);
        assert!(scan(&mut driver, 0).unwrap().is_empty());
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn test_scan_start_failure() {
        let mut driver = HostWifi::new();
        driver.set_scan_start_failure(Some(StatusCode(0x3002)));

        let result = scan(&mut driver, 3);
        assert_eq!(result, Err(ScanError::Start(StatusCode(0x3002))));
        // Records are never fetched after a failed start.
        assert_eq!(driver.calls().len(), 1);
    }

    #[test]
    fn test_scan_records_failure() {
        let mut driver = HostWifi::new();
        driver.set_scan_records_failure(Some(StatusCode::FAIL));
        assert_eq!(
            scan(&mut driver, 3),
            Err(ScanError::Records(StatusCode::FAIL))
        );
    }
}
