//! Station credentials.
//!
//! Credentials are supplied with each connect request and live only in
//! memory. The password is zeroed when the value is dropped and never
//! printed.
//!
//! # Example
//!
//! ```
//! use gatt_wifi_esp32::wifi::{ConfigError, WifiConfig};
//!
//! let config = WifiConfig::new("MyNetwork", "MyPassword").unwrap();
//! assert!(!config.is_open());
//!
//! let too_long = "x".repeat(33);
//! assert!(matches!(
//!     WifiConfig::new(too_long, "MyPassword"),
//!     Err(ConfigError::FieldTooLong { .. })
//! ));
//! ```

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Maximum SSID length per IEEE 802.11 (size of the driver's SSID field).
pub const MAX_SSID_LEN: usize = 32;

/// Maximum WPA2 passphrase length (size of the driver's password field).
pub const MAX_PASSWORD_LEN: usize = 64;

/// Minimum WPA2 passphrase length.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Credentials for joining an access point.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct WifiConfig {
    /// Network SSID (1-32 bytes).
    pub ssid: String,
    /// WPA2 passphrase (8-63 printable bytes) or 64 hex digit PSK, empty
    /// for open networks.
    pub password: String,
}

impl WifiConfig {
    /// Build and validate credentials.
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Result<Self, ConfigError> {
        let config = Self {
            ssid: ssid.into(),
            password: password.into(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Credentials for an open network.
    pub fn open(ssid: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(ssid, String::new())
    }

    /// Check the credentials against what the station driver accepts.
    ///
    /// Both values end up in fixed-size C string fields, so they must fit
    /// and must not contain NUL. A 64-byte password is taken as a raw PSK
    /// and must be hex; anything shorter is a WPA2 passphrase of printable
    /// ASCII.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_field(CredentialField::Ssid, &self.ssid, MAX_SSID_LEN)?;
        if self.ssid.is_empty() {
            return Err(ConfigError::EmptySsid);
        }

        check_field(CredentialField::Password, &self.password, MAX_PASSWORD_LEN)?;
        let password = self.password.as_bytes();
        match password.len() {
            // Open network.
            0 => Ok(()),
            len if len < MIN_PASSWORD_LEN => Err(ConfigError::PassphraseTooShort { len }),
            MAX_PASSWORD_LEN if !password.iter().all(u8::is_ascii_hexdigit) => {
                Err(ConfigError::InvalidPsk)
            }
            _ if !password.iter().all(|b| (b' '..=b'~').contains(b)) => {
                Err(ConfigError::NonPrintablePassphrase)
            }
            _ => Ok(()),
        }
    }

    /// Check if this is an open network.
    pub fn is_open(&self) -> bool {
        self.password.is_empty()
    }
}

impl fmt::Debug for WifiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiConfig")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Which credential a [`ConfigError`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialField {
    Ssid,
    Password,
}

impl fmt::Display for CredentialField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ssid => write!(f, "SSID"),
            Self::Password => write!(f, "password"),
        }
    }
}

fn check_field(field: CredentialField, value: &str, max: usize) -> Result<(), ConfigError> {
    if value.len() > max {
        return Err(ConfigError::FieldTooLong {
            field,
            len: value.len(),
            max,
        });
    }
    if value.contains('\0') {
        return Err(ConfigError::InteriorNul(field));
    }
    Ok(())
}

/// Credential validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// SSID is empty.
    EmptySsid,
    /// Value does not fit the driver's field.
    FieldTooLong {
        field: CredentialField,
        len: usize,
        max: usize,
    },
    /// Value contains a NUL byte.
    InteriorNul(CredentialField),
    /// WPA2 passphrase under the 8-byte minimum.
    PassphraseTooShort { len: usize },
    /// 64-byte key that is not hex.
    InvalidPsk,
    /// Passphrase contains bytes outside printable ASCII.
    NonPrintablePassphrase,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySsid => write!(f, "empty SSID"),
            Self::FieldTooLong { field, len, max } => {
                write!(f, "{} is {} bytes, driver holds {}", field, len, max)
            }
            Self::InteriorNul(field) => write!(f, "{} contains a NUL byte", field),
            Self::PassphraseTooShort { len } => write!(
                f,
                "WPA2 passphrase is {} bytes, needs at least {}",
                len, MIN_PASSWORD_LEN
            ),
            Self::InvalidPsk => write!(f, "64-byte key must be 64 hex digits"),
            Self::NonPrintablePassphrase => {
                write!(f, "WPA2 passphrase must be printable ASCII")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Length Tests ====================

    #[test]
    fn test_limits_are_inclusive() {
        assert!(WifiConfig::new("a".repeat(MAX_SSID_LEN), "12345678").is_ok());
        assert!(WifiConfig::new("net", "p".repeat(MAX_PASSWORD_LEN - 1)).is_ok());
        assert!(WifiConfig::new("net", "p".repeat(MIN_PASSWORD_LEN)).is_ok());
    }

    #[test]
    fn test_oversized_credentials_rejected() {
        assert_eq!(
            WifiConfig::new("a".repeat(33), "password123"),
            Err(ConfigError::FieldTooLong {
                field: CredentialField::Ssid,
                len: 33,
                max: 32
            })
        );
        assert_eq!(
            WifiConfig::new("net", "p".repeat(65)),
            Err(ConfigError::FieldTooLong {
                field: CredentialField::Password,
                len: 65,
                max: 64
            })
        );
    }

    #[test]
    fn test_short_password_and_empty_ssid_rejected() {
        assert_eq!(WifiConfig::new("", "password123"), Err(ConfigError::EmptySsid));
        assert_eq!(
            WifiConfig::new("net", "short"),
            Err(ConfigError::PassphraseTooShort { len: 5 })
        );
    }

    #[test]
    fn test_ssid_length_counts_bytes() {
        // 11 x 3-byte characters = 33 bytes
        let ssid = "€".repeat(11);
        assert!(matches!(
            WifiConfig::new(ssid, "password123"),
            Err(ConfigError::FieldTooLong { len: 33, .. })
        ));
    }

    // ==================== Content Tests ====================

    #[test]
    fn test_raw_psk_must_be_hex() {
        let psk = "0123456789abcdef".repeat(4);
        assert!(WifiConfig::new("net", psk).is_ok());
        assert_eq!(
            WifiConfig::new("net", "g".repeat(MAX_PASSWORD_LEN)),
            Err(ConfigError::InvalidPsk)
        );
    }

    #[test]
    fn test_passphrase_must_be_printable() {
        assert!(WifiConfig::new("net", "pass word~!").is_ok());
        assert_eq!(
            WifiConfig::new("net", "pässwörd"),
            Err(ConfigError::NonPrintablePassphrase)
        );
        assert_eq!(
            WifiConfig::new("net", "pass\tword"),
            Err(ConfigError::NonPrintablePassphrase)
        );
    }

    #[test]
    fn test_nul_rejected_in_either_field() {
        assert_eq!(
            WifiConfig::new("Home\0Net", "password123"),
            Err(ConfigError::InteriorNul(CredentialField::Ssid))
        );
        assert_eq!(
            WifiConfig::new("HomeNet", "pass\0word"),
            Err(ConfigError::InteriorNul(CredentialField::Password))
        );
    }

    #[test]
    fn test_open_network() {
        let config = WifiConfig::open("CoffeeShop").unwrap();
        assert!(config.is_open());
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = WifiConfig::new("HomeNet", "hunter2hunter2").unwrap();
        let debug = format!("{:?}", config);
        assert!(debug.contains("HomeNet"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_zeroize_clears_fields() {
        let mut config = WifiConfig::new("HomeNet", "hunter2hunter2").unwrap();
        config.zeroize();
        assert!(config.ssid.is_empty());
        assert!(config.password.is_empty());
    }
}
