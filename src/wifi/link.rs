//! Station link state machine with bounded reconnects.
//!
//! ```text
//! Idle ──connect()──▶ Connecting ──got ip──▶ Connected
//!                        ▲    │                  │
//!              retry ok  │    │ disconnect       │ disconnect
//!                        │    ▼                  ▼
//!                     Disconnected ◀─────────────┘
//!                        │
//!                        └── retries exhausted ──▶ Idle
//! ```
//!
//! Association alone (`StaConnected`) keeps the link in `Connecting`; the
//! link is `Connected` only once DHCP has assigned an address. Every
//! disconnect re-issues `connect` until `max_retries` reconnects have been
//! spent, after which the link goes idle and reports
//! [`WifiError::RetriesExhausted`] once. The budget is refilled only by a
//! successful connection.

use super::config::{ConfigError, WifiConfig};
use super::scan::{self, ScanError};
use crate::transport::{
    CancellableSink, EventSink, IpEvent, RadioEvent, ScanRecord, StatusCode, WifiDriver,
    WifiEvent, WifiMode,
};
use log::{debug, info, warn};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Reconnect budget used by [`LinkConfig::default`].
pub const DEFAULT_MAX_RETRIES: u8 = 5;

/// Link tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// Reconnects attempted after disconnects before giving up.
    pub max_retries: u8,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Station link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection wanted, or retries exhausted.
    Idle,
    /// Association or DHCP in progress.
    Connecting,
    /// Associated with an address.
    Connected,
    /// Link lost; a reconnect could not be issued.
    Disconnected,
}

/// Errors returned by [`WifiLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiError {
    /// Credentials rejected before reaching the driver.
    Config(ConfigError),
    /// A driver primitive returned a non-zero status.
    TransportFailure(StatusCode),
    /// Every reconnect in the budget was spent.
    RetriesExhausted { attempts: u8 },
    /// The link's cancellation token has fired.
    Cancelled,
    /// Scan failed.
    Scan(ScanError),
}

impl fmt::Display for WifiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "invalid credentials: {}", e),
            Self::TransportFailure(status) => write!(f, "WiFi transport failure: {}", status),
            Self::RetriesExhausted { attempts } => {
                write!(f, "failed to connect after {} retries", attempts)
            }
            Self::Cancelled => write!(f, "WiFi link cancelled"),
            Self::Scan(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for WifiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Scan(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for WifiError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<ScanError> for WifiError {
    fn from(e: ScanError) -> Self {
        Self::Scan(e)
    }
}

/// Station-mode link.
pub struct WifiLink<D: WifiDriver> {
    driver: D,
    config: LinkConfig,
    credentials: Option<WifiConfig>,
    state: LinkState,
    retry_count: u8,
    associated: bool,
    ip: Option<Ipv4Addr>,
    /// 802.11 reason code of the last disconnect, when the driver gave one.
    last_disconnect_reason: Option<u16>,
    last_scan: Vec<ScanRecord>,
    cancel: CancellationToken,
}

impl<D: WifiDriver> WifiLink<D> {
    /// Subscribe `sink` to the driver's station and IP events and create an
    /// idle link.
    pub fn new(
        mut driver: D,
        config: LinkConfig,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Result<Self, WifiError> {
        let sink: Arc<dyn EventSink> = Arc::new(CancellableSink::new(sink, cancel.clone()));
        driver
            .subscribe(sink)
            .map_err(WifiError::TransportFailure)?;

        Ok(Self {
            driver,
            config,
            credentials: None,
            state: LinkState::Idle,
            retry_count: 0,
            associated: false,
            ip: None,
            last_disconnect_reason: None,
            last_scan: Vec::new(),
            cancel,
        })
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Check if the link has an address.
    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Reconnects spent since the last successful connection.
    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    /// Link configuration.
    pub fn config(&self) -> LinkConfig {
        self.config
    }

    /// Address assigned by DHCP while connected.
    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.ip
    }

    /// Whether the station is associated (possibly still waiting for DHCP).
    pub fn is_associated(&self) -> bool {
        self.associated
    }

    /// SSID of the last accepted credentials.
    pub fn ssid(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.ssid.as_str())
    }

    /// Reason code reported with the last disconnect.
    pub fn last_disconnect_reason(&self) -> Option<u16> {
        self.last_disconnect_reason
    }

    /// Records from the most recent successful scan.
    pub fn last_scan(&self) -> &[ScanRecord] {
        &self.last_scan
    }

    /// The underlying driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Configure station mode with the given credentials and begin
    /// association.
    ///
    /// Credentials are validated before any driver call. The result only
    /// says association was initiated; the outcome arrives as events.
    pub fn connect(&mut self, ssid: &str, passphrase: &str) -> Result<(), WifiError> {
        if self.cancel.is_cancelled() {
            return Err(WifiError::Cancelled);
        }

        let credentials = WifiConfig::new(ssid, passphrase)?;
        info!("Connecting to WiFi: {}", credentials.ssid);

        self.driver
            .set_mode(WifiMode::Station)
            .map_err(WifiError::TransportFailure)?;
        self.driver
            .set_config(&credentials.ssid, &credentials.password)
            .map_err(WifiError::TransportFailure)?;
        self.driver.start().map_err(WifiError::TransportFailure)?;

        self.credentials = Some(credentials);
        self.associated = false;
        self.ip = None;

        match self.driver.connect() {
            Ok(()) => {
                self.state = LinkState::Connecting;
                Ok(())
            }
            Err(status) => {
                warn!("WiFi connect failed to start: {}", status);
                self.state = LinkState::Disconnected;
                Err(WifiError::TransportFailure(status))
            }
        }
    }

    /// Feed a Wi-Fi or IP event into the machine. BLE events are ignored.
    pub fn on_event(&mut self, event: RadioEvent) -> Result<LinkState, WifiError> {
        match event {
            RadioEvent::Wifi(event) => self.on_wifi_event(event),
            RadioEvent::Ip(event) => self.on_ip_event(event),
            RadioEvent::Gap(_) | RadioEvent::GattWrite { .. } => Ok(self.state),
        }
    }

    /// Handle a station event.
    pub fn on_wifi_event(&mut self, event: WifiEvent) -> Result<LinkState, WifiError> {
        match event {
            WifiEvent::StaStart => {
                debug!("WiFi station started");
                Ok(self.state)
            }
            WifiEvent::StaConnected => {
                if self.state == LinkState::Connecting {
                    info!("WiFi associated, waiting for address");
                    self.associated = true;
                } else {
                    debug!("Ignoring association in state {:?}", self.state);
                }
                Ok(self.state)
            }
            WifiEvent::StaDisconnected { reason } => self.on_disconnected(reason),
        }
    }

    /// Handle an IP event.
    pub fn on_ip_event(&mut self, event: IpEvent) -> Result<LinkState, WifiError> {
        match event {
            IpEvent::StaGotIp { ip } => match self.state {
                LinkState::Connecting | LinkState::Connected => {
                    info!("WiFi connected, IP: {}", ip);
                    self.state = LinkState::Connected;
                    self.associated = true;
                    self.ip = Some(ip);
                    self.retry_count = 0;
                    Ok(self.state)
                }
                _ => {
                    debug!("Ignoring address {} in state {:?}", ip, self.state);
                    Ok(self.state)
                }
            },
        }
    }

    fn on_disconnected(&mut self, reason: Option<u16>) -> Result<LinkState, WifiError> {
        if self.state == LinkState::Idle {
            debug!("Ignoring disconnect while idle (reason {:?})", reason);
            return Ok(self.state);
        }

        warn!("WiFi disconnected (reason {:?})", reason);
        self.last_disconnect_reason = reason;
        self.state = LinkState::Disconnected;
        self.associated = false;
        self.ip = None;

        if self.cancel.is_cancelled() {
            info!("WiFi link shutting down, not reconnecting");
            self.state = LinkState::Idle;
            return Ok(self.state);
        }

        if self.retry_count >= self.config.max_retries {
            warn!(
                "Failed to connect to WiFi after {} retries",
                self.retry_count
            );
            self.state = LinkState::Idle;
            return Err(WifiError::RetriesExhausted {
                attempts: self.retry_count,
            });
        }

        self.retry_count += 1;
        info!(
            "Retrying WiFi connection ({}/{})",
            self.retry_count, self.config.max_retries
        );
        match self.driver.connect() {
            Ok(()) => {
                self.state = LinkState::Connecting;
                Ok(self.state)
            }
            Err(status) => {
                warn!("WiFi reconnect failed: {}", status);
                Err(WifiError::TransportFailure(status))
            }
        }
    }

    /// Scan for access points, keeping at most `max_records` of them.
    ///
    /// The result replaces the previous scan; a failed scan clears it.
    pub fn scan(&mut self, max_records: usize) -> Result<&[ScanRecord], WifiError> {
        match scan::scan(&mut self.driver, max_records) {
            Ok(records) => {
                self.last_scan = records;
                Ok(&self.last_scan)
            }
            Err(e) => {
                self.last_scan.clear();
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NullSink;
    use crate::wifi::{HostWifi, WifiCall};

    const IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 42);

    fn link_with(config: LinkConfig) -> (WifiLink<HostWifi>, HostWifi, CancellationToken) {
        let driver = HostWifi::new();
        let stub = driver.clone();
        let cancel = CancellationToken::new();
        let link = WifiLink::new(driver, config, Arc::new(NullSink), cancel.clone()).unwrap();
        (link, stub, cancel)
    }

    fn connecting_link() -> (WifiLink<HostWifi>, HostWifi) {
        let (mut link, stub, _cancel) = link_with(LinkConfig::default());
        link.connect("HomeNet", "password123").unwrap();
        (link, stub)
    }

    fn lost() -> WifiEvent {
        WifiEvent::StaDisconnected { reason: Some(201) }
    }

    // ==================== Connect Tests ====================

    #[test]
    fn test_connect_configures_station_then_connects() {
        let (link, stub) = connecting_link();
        assert_eq!(link.state(), LinkState::Connecting);
        assert_eq!(link.ssid(), Some("HomeNet"));
        assert_eq!(
            stub.calls(),
            vec![
                WifiCall::SetMode(WifiMode::Station),
                WifiCall::SetConfig {
                    ssid: "HomeNet".into()
                },
                WifiCall::Start,
                WifiCall::Connect,
            ]
        );
    }

    #[test]
    fn test_invalid_credentials_never_reach_driver() {
        let (mut link, stub, _cancel) = link_with(LinkConfig::default());
        let result = link.connect(&"s".repeat(33), "password123");
        assert!(matches!(
            result,
            Err(WifiError::Config(ConfigError::FieldTooLong { .. }))
        ));
        assert!(stub.calls().is_empty());
        assert_eq!(link.state(), LinkState::Idle);
    }

    #[test]
    fn test_connect_primitive_failure() {
        let (mut link, stub, _cancel) = link_with(LinkConfig::default());
        stub.fail_next_connect(StatusCode(0x3001));
        assert_eq!(
            link.connect("HomeNet", "password123"),
            Err(WifiError::TransportFailure(StatusCode(0x3001)))
        );
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_association_alone_is_not_connected() {
        let (mut link, _stub) = connecting_link();
        link.on_wifi_event(WifiEvent::StaConnected).unwrap();
        assert_eq!(link.state(), LinkState::Connecting);
        assert!(link.is_associated());
        assert_eq!(link.ip(), None);

        link.on_ip_event(IpEvent::StaGotIp { ip: IP }).unwrap();
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(link.ip(), Some(IP));
    }

    #[test]
    fn test_got_ip_while_idle_is_ignored() {
        let (mut link, _stub, _cancel) = link_with(LinkConfig::default());
        let state = link.on_ip_event(IpEvent::StaGotIp { ip: IP }).unwrap();
        assert_eq!(state, LinkState::Idle);
        assert_eq!(link.ip(), None);
    }

    // ==================== Retry Tests ====================

    #[test]
    fn test_disconnect_after_connected_reconnects() {
        let (mut link, stub) = connecting_link();
        link.on_ip_event(IpEvent::StaGotIp { ip: IP }).unwrap();

        let state = link.on_wifi_event(lost()).unwrap();
        assert_eq!(state, LinkState::Connecting);
        assert_eq!(link.retry_count(), 1);
        assert_eq!(link.ip(), None);
        assert_eq!(stub.connect_count(), 2);
    }

    #[test]
    fn test_disconnect_reason_is_kept() {
        let (mut link, _stub) = connecting_link();
        assert_eq!(link.last_disconnect_reason(), None);

        link.on_wifi_event(lost()).unwrap();
        assert_eq!(link.last_disconnect_reason(), Some(201));

        link.on_wifi_event(WifiEvent::StaDisconnected { reason: Some(15) })
            .unwrap();
        assert_eq!(link.last_disconnect_reason(), Some(15));
    }

    #[test]
    fn test_retries_exhaust_then_idle() {
        let (mut link, stub) = connecting_link();

        for attempt in 1..=5u8 {
            assert_eq!(link.on_wifi_event(lost()), Ok(LinkState::Connecting));
            assert_eq!(link.retry_count(), attempt);
        }
        assert_eq!(stub.connect_count(), 6);

        assert_eq!(
            link.on_wifi_event(lost()),
            Err(WifiError::RetriesExhausted { attempts: 5 })
        );
        assert_eq!(link.state(), LinkState::Idle);
        assert_eq!(stub.connect_count(), 6);

        // Exhaustion is reported once; later disconnects are ignored.
        assert_eq!(link.on_wifi_event(lost()), Ok(LinkState::Idle));
        assert_eq!(stub.connect_count(), 6);
    }

    #[test]
    fn test_zero_retry_budget_gives_up_immediately() {
        let (mut link, stub, _cancel) = link_with(LinkConfig { max_retries: 0 });
        link.connect("HomeNet", "password123").unwrap();

        assert_eq!(
            link.on_wifi_event(lost()),
            Err(WifiError::RetriesExhausted { attempts: 0 })
        );
        assert_eq!(stub.connect_count(), 1);
    }

    #[test]
    fn test_successful_connection_refills_budget() {
        let (mut link, _stub) = connecting_link();
        for _ in 0..3 {
            link.on_wifi_event(lost()).unwrap();
        }
        assert_eq!(link.retry_count(), 3);

        link.on_ip_event(IpEvent::StaGotIp { ip: IP }).unwrap();
        assert_eq!(link.retry_count(), 0);

        for _ in 0..5 {
            assert!(link.on_wifi_event(lost()).is_ok());
        }
        assert_eq!(link.state(), LinkState::Connecting);
    }

    #[test]
    fn test_retry_count_bounded_over_long_sequences() {
        let mut rng: u32 = 0xC0FF_EE00;
        let mut next = move || {
            rng = rng.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            rng >> 16
        };

        let (mut link, _stub) = connecting_link();
        for _ in 0..1000 {
            let _ = match next() % 5 {
                0 => link.on_wifi_event(WifiEvent::StaConnected),
                1 => link.on_ip_event(IpEvent::StaGotIp { ip: IP }),
                2 if link.state() == LinkState::Idle => link
                    .connect("HomeNet", "password123")
                    .map(|()| link.state()),
                _ => link.on_wifi_event(lost()),
            };
            assert!(link.retry_count() <= link.config().max_retries);
            assert_eq!(link.ip().is_some(), link.state() == LinkState::Connected);
        }
    }

    #[test]
    fn test_failed_reconnect_is_surfaced() {
        let (mut link, stub) = connecting_link();
        stub.fail_next_connect(StatusCode::FAIL);

        assert_eq!(
            link.on_wifi_event(lost()),
            Err(WifiError::TransportFailure(StatusCode::FAIL))
        );
        assert_eq!(link.state(), LinkState::Disconnected);

        // The next disconnect spends another retry.
        assert_eq!(link.on_wifi_event(lost()), Ok(LinkState::Connecting));
        assert_eq!(link.retry_count(), 2);
    }

    // ==================== Cancellation Tests ====================

    #[test]
    fn test_cancelled_link_stops_reconnecting() {
        let (mut link, stub, cancel) = link_with(LinkConfig::default());
        link.connect("HomeNet", "password123").unwrap();

        cancel.cancel();
        assert_eq!(link.on_wifi_event(lost()), Ok(LinkState::Idle));
        assert_eq!(stub.connect_count(), 1);
        assert_eq!(
            link.connect("HomeNet", "password123"),
            Err(WifiError::Cancelled)
        );
    }

    // ==================== Scan Tests ====================

    #[test]
    fn test_scan_replaces_previous_results() {
        let (mut link, stub, _cancel) = link_with(LinkConfig::default());
        stub.set_access_points(vec![ScanRecord {
            ssid: "first".into(),
            rssi: -50,
            channel: 1,
        }]);
        assert_eq!(link.scan(3).unwrap().len(), 1);

        stub.set_scan_start_failure(Some(StatusCode::FAIL));
        assert_eq!(
            link.scan(3),
            Err(WifiError::Scan(ScanError::Start(StatusCode::FAIL)))
        );
        assert!(link.last_scan().is_empty());
    }
}
