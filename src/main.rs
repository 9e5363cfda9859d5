//! GATT peripheral and Wi-Fi station node.
//!
//! Runs on both ESP32 and host platforms:
//! - **Host**: `WIFI_SSID=... WIFI_PASSWORD=... cargo run`
//! - **ESP32**: `cargo espflash flash --features esp32 --release`
//!
//! The node advertises the GATT service, joins the configured access point,
//! scans once, then notifies the connected peer with a heartbeat until shut
//! down.

use gatt_wifi_esp32::ble::SendError;
use gatt_wifi_esp32::config::{wifi_credentials, ShimConfig};
use gatt_wifi_esp32::dispatch::{DispatchError, Dispatcher, ShimHandle, StatusUpdate};
use log::{debug, error, info, warn};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

// ESP32: Initialize ESP-IDF before anything else
#[cfg(feature = "esp32")]
fn platform_init() {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    info!("ESP-IDF initialized");
}

// Host: Just initialize env_logger
#[cfg(not(feature = "esp32"))]
fn platform_init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[cfg(feature = "esp32")]
fn create_dispatcher(
    config: &ShimConfig,
    cancel: CancellationToken,
) -> Result<
    (
        Dispatcher<gatt_wifi_esp32::ble::NimbleDriver, gatt_wifi_esp32::wifi::EspWifiDriver>,
        ShimHandle,
    ),
    DispatchError,
> {
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use gatt_wifi_esp32::ble::{BleError, NimbleDriver};
    use gatt_wifi_esp32::transport::StatusCode;
    use gatt_wifi_esp32::wifi::{EspWifiDriver, WifiError};

    let esp = |e: esp_idf_sys::EspError| {
        DispatchError::Wifi(WifiError::TransportFailure(StatusCode(e.code())))
    };
    let peripherals = Peripherals::take().map_err(esp)?;
    let sysloop = EspSystemEventLoop::take().map_err(esp)?;
    let nvs = EspDefaultNvsPartition::take().map_err(esp)?;

    let wifi = EspWifiDriver::new(peripherals.modem, sysloop, Some(nvs))
        .map_err(|status| DispatchError::Wifi(WifiError::TransportFailure(status)))?;
    let ble = NimbleDriver::new(config.device_name.clone())
        .map_err(|status| DispatchError::Ble(BleError::TransportFailure(status)))?;

    Dispatcher::new(ble, wifi, config, cancel)
}

#[cfg(not(feature = "esp32"))]
fn create_dispatcher(
    config: &ShimConfig,
    cancel: CancellationToken,
) -> Result<
    (
        Dispatcher<gatt_wifi_esp32::ble::HostBle, gatt_wifi_esp32::wifi::HostWifi>,
        ShimHandle,
    ),
    DispatchError,
> {
    use gatt_wifi_esp32::ble::HostBle;
    use gatt_wifi_esp32::wifi::HostWifi;

    let ble = HostBle::new(config.device_name.clone());
    let wifi = HostWifi::with_os_network();
    Dispatcher::new(ble, wifi, config, cancel)
}

/// Log status updates and notify the peer periodically.
async fn run_app(
    handle: ShimHandle,
    mut updates: broadcast::Receiver<StatusUpdate>,
    notify_interval: Duration,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let mut heartbeat = tokio::time::interval(notify_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // Skip first

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("App task shutting down");
                break;
            }

            _ = heartbeat.tick() => {
                let payload = format!("uptime {}s", started.elapsed().as_secs());
                match handle.notify(payload).await {
                    Ok(()) => debug!("Heartbeat sent"),
                    Err(DispatchError::Send(SendError::NoActiveConnection)) => {}
                    Err(e) => warn!("Heartbeat failed: {}", e),
                }
            }

            result = updates.recv() => {
                match result {
                    Ok(update) => log_update(&update),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} status updates", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

fn log_update(update: &StatusUpdate) {
    match update {
        StatusUpdate::BleConnected(conn) => info!("Peer connected: {}", conn),
        StatusUpdate::BleDisconnected(conn) => info!("Peer disconnected: {}", conn),
        StatusUpdate::DataReceived(data) => {
            info!(
                "Peer wrote {} bytes: {}",
                data.len(),
                String::from_utf8_lossy(data)
            );
        }
        StatusUpdate::AdvertisingFailed(e) => warn!("Advertising failed: {}", e),
        StatusUpdate::WifiConnected { ip } => info!("WiFi up, IP: {}", ip),
        StatusUpdate::WifiDisconnected => warn!("WiFi down"),
        StatusUpdate::WifiRetriesExhausted { attempts } => {
            error!("WiFi gave up after {} retries", attempts);
        }
        StatusUpdate::WifiFailed(e) => warn!("WiFi error: {}", e),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    platform_init();

    info!("=== GATT/WiFi node starting ===");

    #[cfg(feature = "esp32")]
    info!("Platform: ESP32");
    #[cfg(not(feature = "esp32"))]
    info!("Platform: Host");

    let config = ShimConfig::default();
    if let Err(e) = config.validate() {
        error!("{}", e);
        return;
    }

    let cancel = CancellationToken::new();
    let (dispatcher, handle) = match create_dispatcher(&config, cancel.clone()) {
        Ok(pair) => pair,
        Err(e) => {
            error!("Failed to initialize radios: {}", e);
            return;
        }
    };
    let updates = handle.subscribe();
    let dispatch_task = tokio::spawn(dispatcher.run());

    if let Err(e) = handle.start_advertising().await {
        warn!("Failed to start advertising: {}", e);
    }

    match wifi_credentials() {
        Ok(Some(credentials)) => {
            if let Err(e) = handle
                .connect_wifi(&credentials.ssid, &credentials.password)
                .await
            {
                warn!("WiFi connect failed: {}", e);
            }
        }
        Ok(None) => info!("No WiFi credentials configured (set WIFI_SSID)"),
        Err(e) => warn!("Ignoring WiFi credentials: {}", e),
    }

    match handle.scan(config.scan_capacity).await {
        Ok(records) => {
            for record in records {
                info!(
                    "AP '{}' rssi {} dBm, channel {}",
                    record.ssid, record.rssi, record.channel
                );
            }
        }
        Err(e) => warn!("Scan failed: {}", e),
    }

    let app_task = tokio::spawn(run_app(
        handle.clone(),
        updates,
        config.notify_interval,
        cancel.clone(),
    ));

    // Wait for shutdown
    #[cfg(not(feature = "esp32"))]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            cancel.cancel();
        }
        result = dispatch_task => {
            if let Err(e) = result {
                error!("Dispatcher task error: {}", e);
            }
        }
    }

    #[cfg(feature = "esp32")]
    if let Err(e) = dispatch_task.await {
        error!("Dispatcher task error: {}", e);
    }

    cancel.cancel();
    if let Err(e) = app_task.await {
        error!("App task error: {}", e);
    }

    info!("Shutdown complete");
}
