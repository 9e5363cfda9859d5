//! Host Wi-Fi driver.
//!
//! On the host the OS owns networking. This driver records every primitive
//! the link calls, can answer a connect with the association and DHCP events
//! a real station would raise, and serves a configurable access-point list
//! for scans. Clones share state.

use crate::transport::{
    EventSink, IpEvent, ScanConfig, ScanRecord, StatusCode, WifiDriver, WifiEvent, WifiMode,
};
use log::info;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiCall {
    SetMode(WifiMode),
    SetConfig { ssid: String },
    Start,
    Connect,
    ScanStart { blocking: bool },
    ScanGetRecords { max_count: usize },
}

#[derive(Default)]
struct HostWifiState {
    sink: Option<Arc<dyn EventSink>>,
    calls: Vec<WifiCall>,
    connect_failures: VecDeque<StatusCode>,
    scan_start_failure: Option<StatusCode>,
    scan_records_failure: Option<StatusCode>,
    access_points: Vec<ScanRecord>,
    /// When set, a successful connect immediately reports association and
    /// this address.
    auto_associate: Option<Ipv4Addr>,
}

/// Loopback Wi-Fi driver.
#[derive(Clone, Default)]
pub struct HostWifi {
    state: Arc<Mutex<HostWifiState>>,
}

impl HostWifi {
    /// Create a driver that only records calls; events are raised by hand.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a driver that "associates" on every connect, reporting the
    /// host's primary local address (or loopback when it cannot be found).
    pub fn with_os_network() -> Self {
        let driver = Self::new();
        let ip = detect_local_ipv4().unwrap_or(Ipv4Addr::LOCALHOST);
        driver.state().auto_associate = Some(ip);
        driver
    }

    fn state(&self) -> MutexGuard<'_, HostWifiState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Access points returned by scans.
    pub fn set_access_points(&self, access_points: Vec<ScanRecord>) {
        self.state().access_points = access_points;
    }

    /// Make the next `connect` fail with `status`.
    pub fn fail_next_connect(&self, status: StatusCode) {
        self.state().connect_failures.push_back(status);
    }

    /// Make `scan_start` fail with `status` (`None` restores success).
    pub fn set_scan_start_failure(&self, status: Option<StatusCode>) {
        self.state().scan_start_failure = status;
    }

    /// Make `scan_get_records` fail with `status` (`None` restores success).
    pub fn set_scan_records_failure(&self, status: Option<StatusCode>) {
        self.state().scan_records_failure = status;
    }

    /// All driver calls so far.
    pub fn calls(&self) -> Vec<WifiCall> {
        self.state().calls.clone()
    }

    /// Number of `connect` calls so far.
    pub fn connect_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| **call == WifiCall::Connect)
            .count()
    }

    /// Raise a station event.
    pub fn emit_wifi(&self, event: WifiEvent) {
        let sink = self.state().sink.clone();
        if let Some(sink) = sink {
            sink.on_wifi_event(event);
        }
    }

    /// Raise an IP event.
    pub fn emit_ip(&self, event: IpEvent) {
        let sink = self.state().sink.clone();
        if let Some(sink) = sink {
            sink.on_ip_event(event);
        }
    }
}

impl WifiDriver for HostWifi {
    fn subscribe(&mut self, sink: Arc<dyn EventSink>) -> Result<(), StatusCode> {
        self.state().sink = Some(sink);
        Ok(())
    }

    fn set_mode(&mut self, mode: WifiMode) -> Result<(), StatusCode> {
        self.state().calls.push(WifiCall::SetMode(mode));
        Ok(())
    }

    fn set_config(&mut self, ssid: &str, _passphrase: &str) -> Result<(), StatusCode> {
        self.state().calls.push(WifiCall::SetConfig {
            ssid: ssid.to_string(),
        });
        Ok(())
    }

    fn start(&mut self) -> Result<(), StatusCode> {
        self.state().calls.push(WifiCall::Start);
        self.emit_wifi(WifiEvent::StaStart);
        Ok(())
    }

    fn connect(&mut self) -> Result<(), StatusCode> {
        let auto_associate = {
            let mut state = self.state();
            state.calls.push(WifiCall::Connect);
            if let Some(status) = state.connect_failures.pop_front() {
                return Err(status);
            }
            state.auto_associate
        };

        if let Some(ip) = auto_associate {
            info!("[host-wifi] associated, address {}", ip);
            self.emit_wifi(WifiEvent::StaConnected);
            self.emit_ip(IpEvent::StaGotIp { ip });
        }
        Ok(())
    }

    fn scan_start(&mut self, _config: &ScanConfig, blocking: bool) -> Result<(), StatusCode> {
        let mut state = self.state();
        state.calls.push(WifiCall::ScanStart { blocking });
        match state.scan_start_failure {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn scan_get_records(&mut self, max_count: usize) -> Result<Vec<ScanRecord>, StatusCode> {
        let mut state = self.state();
        state.calls.push(WifiCall::ScanGetRecords { max_count });
        if let Some(status) = state.scan_records_failure {
            return Err(status);
        }
        Ok(state.access_points.iter().take(max_count).cloned().collect())
    }
}

/// Primary local IPv4 address.
///
/// Connects a UDP socket to a public address (nothing is sent) and reads
/// back the local address the OS picked for the default route.
fn detect_local_ipv4() -> Option<Ipv4Addr> {
    use std::net::UdpSocket;

    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}
