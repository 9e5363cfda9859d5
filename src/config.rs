//! Runtime configuration.
//!
//! [`ShimConfig`] gathers the tunables of both machines. Wi-Fi credentials
//! are kept apart and read once at startup by [`wifi_credentials`].

use crate::ble::SessionPolicy;
use crate::wifi::{ConfigError, LinkConfig, WifiConfig, DEFAULT_SCAN_CAPACITY};
use std::fmt;
use std::time::Duration;

/// Default GAP device name.
pub const DEFAULT_DEVICE_NAME: &str = "BLE-Server";

/// Longest name that fits a legacy advertisement next to the flags field
/// (31 bytes minus 3 for flags and 2 for the name header).
pub const MAX_DEVICE_NAME_LEN: usize = 26;

/// Upper bound on the reconnect budget.
pub const MAX_RETRY_LIMIT: u8 = 20;

/// Upper bound on records kept from one scan.
pub const MAX_SCAN_CAPACITY: usize = 20;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShimConfigError {
    /// A value is out of range.
    InvalidConfig(&'static str),
}

impl fmt::Display for ShimConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ShimConfigError {}

/// Peripheral and station configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimConfig {
    /// Name advertised over BLE.
    pub device_name: String,
    /// Advertising restart policy.
    pub session: SessionPolicy,
    /// Reconnect budget.
    pub link: LinkConfig,
    /// Records kept from one scan.
    pub scan_capacity: usize,
    /// Period of the status notification sent to the connected peer.
    pub notify_interval: Duration,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            session: SessionPolicy::default(),
            link: LinkConfig::default(),
            scan_capacity: DEFAULT_SCAN_CAPACITY,
            notify_interval: Duration::from_secs(5),
        }
    }
}

impl ShimConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ShimConfigError> {
        if self.device_name.is_empty() {
            return Err(ShimConfigError::InvalidConfig("device_name must not be empty"));
        }
        if self.device_name.len() > MAX_DEVICE_NAME_LEN {
            return Err(ShimConfigError::InvalidConfig(
                "device_name must be <= 26 bytes",
            ));
        }
        if self.link.max_retries > MAX_RETRY_LIMIT {
            return Err(ShimConfigError::InvalidConfig("max_retries must be <= 20"));
        }
        if self.scan_capacity > MAX_SCAN_CAPACITY {
            return Err(ShimConfigError::InvalidConfig(
                "scan_capacity must be <= 20",
            ));
        }
        if self.notify_interval.is_zero() {
            return Err(ShimConfigError::InvalidConfig(
                "notify_interval must be > 0",
            ));
        }
        Ok(())
    }
}

/// Station credentials from the environment.
///
/// On the host these are the `WIFI_SSID` and `WIFI_PASSWORD` variables; on
/// ESP32 they are baked in at compile time. Returns `Ok(None)` when no SSID
/// is set. A missing password means an open network.
pub fn wifi_credentials() -> Result<Option<WifiConfig>, ConfigError> {
    #[cfg(not(feature = "esp32"))]
    let (ssid, password) = (
        std::env::var("WIFI_SSID").ok(),
        std::env::var("WIFI_PASSWORD").ok(),
    );

    #[cfg(feature = "esp32")]
    let (ssid, password) = (
        option_env!("WIFI_SSID").map(str::to_string),
        option_env!("WIFI_PASSWORD").map(str::to_string),
    );

    credentials_from(ssid, password)
}

fn credentials_from(
    ssid: Option<String>,
    password: Option<String>,
) -> Result<Option<WifiConfig>, ConfigError> {
    match ssid {
        Some(ssid) if !ssid.is_empty() => {
            WifiConfig::new(ssid, password.unwrap_or_default()).map(Some)
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ShimConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.device_name, "BLE-Server");
        assert_eq!(config.link.max_retries, 5);
        assert_eq!(config.scan_capacity, 3);
    }

    #[test]
    fn test_validation_bounds() {
        let long_name = ShimConfig {
            device_name: "n".repeat(MAX_DEVICE_NAME_LEN + 1),
            ..Default::default()
        };
        assert!(long_name.validate().is_err());

        let too_many_retries = ShimConfig {
            link: LinkConfig { max_retries: 21 },
            ..Default::default()
        };
        assert!(too_many_retries.validate().is_err());

        let no_retries = ShimConfig {
            link: LinkConfig { max_retries: 0 },
            ..Default::default()
        };
        assert!(no_retries.validate().is_ok());

        let zero_interval = ShimConfig {
            notify_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(zero_interval.validate().is_err());
    }

    #[test]
    fn test_credentials_from_values() {
        assert_eq!(credentials_from(None, Some("password123".into())), Ok(None));
        assert_eq!(credentials_from(Some(String::new()), None), Ok(None));

        let open = credentials_from(Some("Cafe".into()), None).unwrap().unwrap();
        assert!(open.is_open());

        let secured = credentials_from(Some("HomeNet".into()), Some("password123".into()))
            .unwrap()
            .unwrap();
        assert_eq!(secured.ssid, "HomeNet");

        assert!(matches!(
            credentials_from(Some("HomeNet".into()), Some("short".into())),
            Err(ConfigError::PassphraseTooShort { .. })
        ));
    }
}
