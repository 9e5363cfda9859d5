//! ESP-IDF Wi-Fi driver wrapper.
//!
//! Uses the non-blocking `EspWifi` so `connect` only initiates association;
//! station and DHCP outcomes come back through system event loop
//! subscriptions and are forwarded to the sink.

use crate::transport::{
    EventSink, IpEvent, ScanConfig, ScanRecord, StatusCode, WifiDriver, WifiEvent, WifiMode,
};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::{EspSubscription, EspSystemEventLoop, System};
use esp_idf_svc::netif::IpEvent as EspIpEvent;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::config::ScanConfig as EspScanConfig;
use esp_idf_svc::wifi::{
    AuthMethod, ClientConfiguration, Configuration, EspWifi, WifiEvent as EspWifiEvent,
};
use esp_idf_sys::EspError;
use log::info;
use std::sync::Arc;

fn status(e: EspError) -> StatusCode {
    StatusCode(e.code())
}

/// Station driver over `EspWifi`.
pub struct EspWifiDriver {
    wifi: EspWifi<'static>,
    sysloop: EspSystemEventLoop,
    subscriptions: Vec<EspSubscription<'static, System>>,
}

impl EspWifiDriver {
    /// Create the driver on `modem`. The driver keeps calibration data in
    /// `nvs` when given.
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: Option<EspDefaultNvsPartition>,
    ) -> Result<Self, StatusCode> {
        let wifi = EspWifi::new(modem, sysloop.clone(), nvs).map_err(status)?;
        Ok(Self {
            wifi,
            sysloop,
            subscriptions: Vec::new(),
        })
    }
}

impl WifiDriver for EspWifiDriver {
    fn subscribe(&mut self, sink: Arc<dyn EventSink>) -> Result<(), StatusCode> {
        let wifi_sink = sink.clone();
        let wifi_sub = self
            .sysloop
            .subscribe::<EspWifiEvent, _>(move |event| match event {
                EspWifiEvent::StaStarted => wifi_sink.on_wifi_event(WifiEvent::StaStart),
                EspWifiEvent::StaConnected(_) => wifi_sink.on_wifi_event(WifiEvent::StaConnected),
                EspWifiEvent::StaDisconnected(disconnected) => {
                    wifi_sink.on_wifi_event(WifiEvent::StaDisconnected {
                        reason: Some(u16::from(disconnected.reason())),
                    })
                }
                _ => {}
            })
            .map_err(status)?;

        let ip_sub = self
            .sysloop
            .subscribe::<EspIpEvent, _>(move |event| {
                if let EspIpEvent::DhcpIpAssigned(assignment) = event {
                    sink.on_ip_event(IpEvent::StaGotIp {
                        ip: assignment.ip(),
                    });
                }
            })
            .map_err(status)?;

        self.subscriptions = vec![wifi_sub, ip_sub];
        Ok(())
    }

    fn set_mode(&mut self, mode: WifiMode) -> Result<(), StatusCode> {
        // Station is the only mode; it is applied with the configuration.
        match mode {
            WifiMode::Station => Ok(()),
        }
    }

    fn set_config(&mut self, ssid: &str, passphrase: &str) -> Result<(), StatusCode> {
        let auth_method = if passphrase.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };
        let ssid = ssid.try_into().map_err(|_| StatusCode::INVALID_ARG)?;
        let password = passphrase.try_into().map_err(|_| StatusCode::INVALID_ARG)?;

        let config = Configuration::Client(ClientConfiguration {
            ssid,
            password,
            auth_method,
            ..Default::default()
        });
        self.wifi.set_configuration(&config).map_err(status)
    }

    fn start(&mut self) -> Result<(), StatusCode> {
        if self.wifi.is_started().unwrap_or(false) {
            return Ok(());
        }
        self.wifi.start().map_err(status)
    }

    fn connect(&mut self) -> Result<(), StatusCode> {
        self.wifi.connect().map_err(status)
    }

    fn scan_start(&mut self, config: &ScanConfig, blocking: bool) -> Result<(), StatusCode> {
        let ssid = match config.ssid.as_deref() {
            Some(ssid) => Some(ssid.try_into().map_err(|_| StatusCode::INVALID_ARG)?),
            None => None,
        };
        let scan_config = EspScanConfig {
            ssid,
            channel: config.channel,
            show_hidden: config.show_hidden,
            ..Default::default()
        };
        self.wifi.start_scan(&scan_config, blocking).map_err(status)
    }

    fn scan_get_records(&mut self, max_count: usize) -> Result<Vec<ScanRecord>, StatusCode> {
        let records: Vec<ScanRecord> = self
            .wifi
            .get_scan_result()
            .map_err(status)?
            .into_iter()
            .take(max_count)
            .map(|ap| ScanRecord {
                ssid: ap.ssid.as_str().to_string(),
                rssi: ap.signal_strength,
                channel: ap.channel,
            })
            .collect();
        info!("Read {} scan record(s)", records.len());
        Ok(records)
    }
}
