//! Event dispatch task.
//!
//! The radio stacks call back from their own tasks. Rather than share the
//! state machines behind locks, every callback is turned into a message on
//! one queue, and a single task owns both the [`BleSession`] and the
//! [`WifiLink`] and applies messages in arrival order. Application requests
//! (notify, connect, scan) travel on the same queue, so they are ordered
//! with respect to radio events.
//!
//! ```text
//! NimBLE host task ─┐
//! ESP event loop ───┼──▶ ShimHandle ──mpsc──▶ Dispatcher::run ──broadcast──▶ StatusUpdate
//! application ──────┘
//! ```
//!
//! GATT reads routed through the handle block their (non-async) caller
//! until the dispatcher replies. The NimBLE driver serves a stored value
//! instead, since it would be blocking with the characteristic locked.

use crate::ble::{BleError, BleSession, SendError, SessionState};
use crate::config::ShimConfig;
use crate::transport::{
    AttrHandle, BleDriver, ConnHandle, EventSink, GapEvent, IpEvent, RadioEvent, ScanRecord,
    WifiDriver, WifiEvent,
};
use crate::wifi::{LinkState, WifiError, WifiLink};
use log::{debug, info, warn};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

/// Capacity of the status broadcast channel.
const STATUS_CHANNEL_CAPACITY: usize = 32;

/// Status changes reported to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    /// A BLE peer connected.
    BleConnected(ConnHandle),
    /// The BLE peer went away.
    BleDisconnected(ConnHandle),
    /// The peer wrote to the write characteristic.
    DataReceived(Vec<u8>),
    /// Advertising could not be (re)started.
    AdvertisingFailed(BleError),
    /// The station got an address.
    WifiConnected { ip: Ipv4Addr },
    /// The station lost its address.
    WifiDisconnected,
    /// The reconnect budget was spent; the link is idle.
    WifiRetriesExhausted { attempts: u8 },
    /// Any other link failure.
    WifiFailed(WifiError),
}

/// Point-in-time view of both machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimStatus {
    pub session: SessionState,
    pub link: LinkState,
    pub retry_count: u8,
    pub ip: Option<Ipv4Addr>,
    /// 802.11 reason code of the last station disconnect.
    pub disconnect_reason: Option<u16>,
}

/// Errors returned by [`ShimHandle`] requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The dispatcher has stopped.
    Closed,
    /// BLE request failed.
    Ble(BleError),
    /// Notification failed.
    Send(SendError),
    /// Wi-Fi request failed.
    Wifi(WifiError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "event dispatcher stopped"),
            Self::Ble(e) => write!(f, "{}", e),
            Self::Send(e) => write!(f, "{}", e),
            Self::Wifi(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Closed => None,
            Self::Ble(e) => Some(e),
            Self::Send(e) => Some(e),
            Self::Wifi(e) => Some(e),
        }
    }
}

impl From<BleError> for DispatchError {
    fn from(e: BleError) -> Self {
        Self::Ble(e)
    }
}

impl From<SendError> for DispatchError {
    fn from(e: SendError) -> Self {
        Self::Send(e)
    }
}

impl From<WifiError> for DispatchError {
    fn from(e: WifiError) -> Self {
        Self::Wifi(e)
    }
}

enum Command {
    StartAdvertising {
        reply: oneshot::Sender<Result<(), BleError>>,
    },
    Notify {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), SendError>>,
    },
    ConnectWifi {
        ssid: String,
        passphrase: Zeroizing<String>,
        reply: oneshot::Sender<Result<(), WifiError>>,
    },
    Scan {
        max_records: usize,
        reply: oneshot::Sender<Result<Vec<ScanRecord>, WifiError>>,
    },
    LastWritten {
        reply: oneshot::Sender<Vec<u8>>,
    },
    Status {
        reply: oneshot::Sender<ShimStatus>,
    },
}

enum Message {
    Event(RadioEvent),
    Read {
        conn: ConnHandle,
        attr: AttrHandle,
        reply: oneshot::Sender<Vec<u8>>,
    },
    Command(Command),
}

/// Cloneable entry point to the dispatcher.
///
/// Drivers see it as an [`EventSink`]; the application uses its async
/// request methods.
#[derive(Clone)]
pub struct ShimHandle {
    tx: mpsc::UnboundedSender<Message>,
    updates: broadcast::Sender<StatusUpdate>,
}

impl ShimHandle {
    fn push(&self, event: RadioEvent) {
        if self.tx.send(Message::Event(event)).is_err() {
            debug!("Dispatcher stopped, dropping event");
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Command(build(reply)))
            .map_err(|_| DispatchError::Closed)?;
        rx.await.map_err(|_| DispatchError::Closed)
    }

    /// Subscribe to status updates.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.updates.subscribe()
    }

    /// Start (or restart) advertising.
    pub async fn start_advertising(&self) -> Result<(), DispatchError> {
        self.request(|reply| Command::StartAdvertising { reply })
            .await?
            .map_err(Into::into)
    }

    /// Notify the connected peer.
    pub async fn notify(&self, payload: impl Into<Vec<u8>>) -> Result<(), DispatchError> {
        let payload = payload.into();
        self.request(|reply| Command::Notify { payload, reply })
            .await?
            .map_err(Into::into)
    }

    /// Join an access point.
    pub async fn connect_wifi(&self, ssid: &str, passphrase: &str) -> Result<(), DispatchError> {
        let ssid = ssid.to_string();
        let passphrase = Zeroizing::new(passphrase.to_string());
        self.request(|reply| Command::ConnectWifi {
            ssid,
            passphrase,
            reply,
        })
        .await?
        .map_err(Into::into)
    }

    /// Scan for access points.
    pub async fn scan(&self, max_records: usize) -> Result<Vec<ScanRecord>, DispatchError> {
        self.request(|reply| Command::Scan { max_records, reply })
            .await?
            .map_err(Into::into)
    }

    /// Most recent payload written by the peer.
    pub async fn last_written(&self) -> Result<Vec<u8>, DispatchError> {
        self.request(|reply| Command::LastWritten { reply }).await
    }

    /// Current state of both machines.
    pub async fn status(&self) -> Result<ShimStatus, DispatchError> {
        self.request(|reply| Command::Status { reply }).await
    }
}

impl EventSink for ShimHandle {
    fn on_ble_gap_event(&self, event: GapEvent) {
        self.push(RadioEvent::Gap(event));
    }

    fn on_gatt_write(&self, conn: ConnHandle, attr: AttrHandle, payload: Vec<u8>) {
        self.push(RadioEvent::GattWrite {
            conn,
            attr,
            payload,
        });
    }

    fn on_gatt_read(&self, conn: ConnHandle, attr: AttrHandle) -> Vec<u8> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Message::Read { conn, attr, reply }).is_err() {
            return Vec::new();
        }
        // Called from the stack's task, never from inside the runtime.
        rx.blocking_recv().unwrap_or_default()
    }

    fn on_wifi_event(&self, event: WifiEvent) {
        self.push(RadioEvent::Wifi(event));
    }

    fn on_ip_event(&self, event: IpEvent) {
        self.push(RadioEvent::Ip(event));
    }
}

/// Owner of both state machines.
pub struct Dispatcher<B: BleDriver, W: WifiDriver> {
    session: BleSession<B>,
    link: WifiLink<W>,
    rx: mpsc::UnboundedReceiver<Message>,
    updates: broadcast::Sender<StatusUpdate>,
    cancel: CancellationToken,
}

impl<B: BleDriver, W: WifiDriver> Dispatcher<B, W> {
    /// Register the GATT service, subscribe to Wi-Fi events and return the
    /// dispatcher with a handle to it.
    pub fn new(
        ble: B,
        wifi: W,
        config: &ShimConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, ShimHandle), DispatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let handle = ShimHandle {
            tx,
            updates: updates.clone(),
        };
        let sink: Arc<dyn EventSink> = Arc::new(handle.clone());

        let session = BleSession::new(ble, config.session, sink.clone(), cancel.clone())?;
        let link = WifiLink::new(wifi, config.link, sink, cancel.clone())?;

        Ok((
            Self {
                session,
                link,
                rx,
                updates,
                cancel,
            },
            handle,
        ))
    }

    /// The BLE session.
    pub fn session(&self) -> &BleSession<B> {
        &self.session
    }

    /// The Wi-Fi link.
    pub fn link(&self) -> &WifiLink<W> {
        &self.link
    }

    /// Process messages until cancelled.
    pub async fn run(mut self) {
        info!("Event dispatcher started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Event dispatcher shutting down");
                    break;
                }

                message = self.rx.recv() => {
                    match message {
                        Some(message) => self.handle(message),
                        None => break,
                    }
                }
            }
        }
    }

    fn publish(&self, update: StatusUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Event(RadioEvent::Gap(event)) => self.handle_gap(event),
            Message::Event(RadioEvent::GattWrite {
                conn,
                attr,
                payload,
            }) => {
                self.session.on_write_received(conn, attr, payload.clone());
                self.publish(StatusUpdate::DataReceived(payload));
            }
            Message::Event(event) => self.handle_link_event(event),
            Message::Read { conn, attr, reply } => {
                let mut out = Vec::new();
                self.session.on_read_requested(conn, attr, &mut out);
                let _ = reply.send(out);
            }
            Message::Command(command) => self.handle_command(command),
        }
    }

    fn handle_gap(&mut self, event: GapEvent) {
        let before = self.session.connection_handle();
        let result = self.session.on_event(event);
        let after = self.session.connection_handle();

        if before != after {
            if let Some(previous) = before {
                self.publish(StatusUpdate::BleDisconnected(previous));
            }
            if let Some(current) = after {
                self.publish(StatusUpdate::BleConnected(current));
            }
        }

        match result {
            Ok(()) | Err(BleError::Cancelled) => {}
            Err(e) => {
                warn!("BLE event handling failed: {}", e);
                self.publish(StatusUpdate::AdvertisingFailed(e));
            }
        }
    }

    fn handle_link_event(&mut self, event: RadioEvent) {
        let was_connected = self.link.is_connected();
        let result = self.link.on_event(event);

        match (was_connected, self.link.is_connected(), self.link.ip()) {
            (false, true, Some(ip)) => self.publish(StatusUpdate::WifiConnected { ip }),
            (true, false, _) => self.publish(StatusUpdate::WifiDisconnected),
            _ => {}
        }

        match result {
            Ok(_) => {}
            Err(WifiError::RetriesExhausted { attempts }) => {
                self.publish(StatusUpdate::WifiRetriesExhausted { attempts });
            }
            Err(e) => {
                warn!("WiFi event handling failed: {}", e);
                self.publish(StatusUpdate::WifiFailed(e));
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartAdvertising { reply } => {
                let _ = reply.send(self.session.start_advertising());
            }
            Command::Notify { payload, reply } => {
                let _ = reply.send(self.session.notify(&payload));
            }
            Command::ConnectWifi {
                ssid,
                passphrase,
                reply,
            } => {
                let _ = reply.send(self.link.connect(&ssid, &passphrase));
            }
            Command::Scan { max_records, reply } => {
                let result = self.link.scan(max_records).map(<[ScanRecord]>::to_vec);
                let _ = reply.send(result);
            }
            Command::LastWritten { reply } => {
                let _ = reply.send(self.session.last_written().to_vec());
            }
            Command::Status { reply } => {
                let _ = reply.send(ShimStatus {
                    session: self.session.state(),
                    link: self.link.state(),
                    retry_count: self.link.retry_count(),
                    ip: self.link.ip(),
                    disconnect_reason: self.link.last_disconnect_reason(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{HostBle, DEFAULT_READ_PAYLOAD, HOST_NOTIFY_HANDLE};
    use crate::transport::StatusCode;
    use crate::wifi::HostWifi;
    use std::time::Duration;
    use tokio::time::timeout;

    const IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 7);

    struct Harness {
        handle: ShimHandle,
        ble: HostBle,
        wifi: HostWifi,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_with(wifi: HostWifi) -> Harness {
        let ble = HostBle::default();
        let cancel = CancellationToken::new();
        let (dispatcher, handle) = Dispatcher::new(
            ble.clone(),
            wifi.clone(),
            &ShimConfig::default(),
            cancel.clone(),
        )
        .unwrap();
        let task = tokio::spawn(dispatcher.run());
        Harness {
            handle,
            ble,
            wifi,
            cancel,
            task,
        }
    }

    fn spawn() -> Harness {
        spawn_with(HostWifi::new())
    }

    async fn next_update(rx: &mut broadcast::Receiver<StatusUpdate>) -> StatusUpdate {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for update")
            .expect("status channel closed")
    }

    // ==================== BLE Tests ====================

    #[tokio::test]
    async fn test_connect_write_notify_flow() {
        let h = spawn();
        let mut updates = h.handle.subscribe();

        h.handle.start_advertising().await.unwrap();
        h.ble.peer_connect(ConnHandle(1), StatusCode::OK);
        assert_eq!(
            next_update(&mut updates).await,
            StatusUpdate::BleConnected(ConnHandle(1))
        );

        h.ble.peer_write(ConnHandle(1), b"ping");
        assert_eq!(
            next_update(&mut updates).await,
            StatusUpdate::DataReceived(b"ping".to_vec())
        );
        assert_eq!(h.handle.last_written().await.unwrap(), b"ping");

        h.handle.notify(b"pong".to_vec()).await.unwrap();
        let sent = h.ble.notifications();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, b"pong");

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_notify_before_connect_fails() {
        let h = spawn();
        h.handle.start_advertising().await.unwrap();

        let result = h.handle.notify(b"early".to_vec()).await;
        assert_eq!(
            result,
            Err(DispatchError::Send(SendError::NoActiveConnection))
        );
        assert_eq!(h.ble.notify_attempts(), 0);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_is_reported() {
        let h = spawn();
        let mut updates = h.handle.subscribe();
        h.handle.start_advertising().await.unwrap();

        h.ble.peer_connect(ConnHandle(2), StatusCode::OK);
        h.ble.peer_disconnect(ConnHandle(2), 0x13);
        assert_eq!(
            next_update(&mut updates).await,
            StatusUpdate::BleConnected(ConnHandle(2))
        );
        assert_eq!(
            next_update(&mut updates).await,
            StatusUpdate::BleDisconnected(ConnHandle(2))
        );

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.session, SessionState::AwaitingAdvertise);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_gatt_read_from_stack_task() {
        let h = spawn();
        h.handle.start_advertising().await.unwrap();

        let ble = h.ble.clone();
        let data = tokio::task::spawn_blocking(move || ble.peer_read(ConnHandle(1)))
            .await
            .unwrap();
        assert_eq!(data, DEFAULT_READ_PAYLOAD);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_read_value_stored_on_connect() {
        let h = spawn();
        h.handle.start_advertising().await.unwrap();
        h.ble.peer_connect(ConnHandle(1), StatusCode::OK);
        // Round-trip so the connect event has been applied.
        h.handle.status().await.unwrap();

        let (chr, value) = h.ble.read_value().unwrap();
        assert_eq!(chr, HOST_NOTIFY_HANDLE);
        assert_eq!(value, DEFAULT_READ_PAYLOAD);

        // Notifications do not depend on any outstanding read.
        h.handle.notify(b"tick".to_vec()).await.unwrap();
        assert_eq!(h.ble.notifications().len(), 1);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_failed_connect_readvertises() {
        let h = spawn();
        let mut updates = h.handle.subscribe();
        h.handle.start_advertising().await.unwrap();

        h.ble.peer_connect(ConnHandle(1), StatusCode(0x3E));
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.session, SessionState::Advertising);
        assert_eq!(h.ble.advertise_count(), 2);
        assert!(updates.try_recv().is_err());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_readvertise_failure_is_reported() {
        let h = spawn();
        let mut updates = h.handle.subscribe();
        h.handle.start_advertising().await.unwrap();

        h.ble.fail_next_advertise(StatusCode(6));
        h.ble.advertising_complete();
        assert_eq!(
            next_update(&mut updates).await,
            StatusUpdate::AdvertisingFailed(BleError::TransportFailure(StatusCode(6)))
        );

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.session, SessionState::AwaitingAdvertise);
        h.cancel.cancel();
    }

    // ==================== WiFi Tests ====================

    #[tokio::test]
    async fn test_wifi_connect_reports_address() {
        let h = spawn();
        let mut updates = h.handle.subscribe();

        h.handle
            .connect_wifi("HomeNet", "password123")
            .await
            .unwrap();
        h.wifi.emit_wifi(WifiEvent::StaConnected);
        h.wifi.emit_ip(IpEvent::StaGotIp { ip: IP });

        assert_eq!(
            next_update(&mut updates).await,
            StatusUpdate::WifiConnected { ip: IP }
        );
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.link, LinkState::Connected);
        assert_eq!(status.ip, Some(IP));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_retry_exhaustion_is_reported_once() {
        let h = spawn();
        let mut updates = h.handle.subscribe();
        h.handle
            .connect_wifi("HomeNet", "password123")
            .await
            .unwrap();

        for _ in 0..10 {
            h.wifi
                .emit_wifi(WifiEvent::StaDisconnected { reason: Some(201) });
        }
        assert_eq!(
            next_update(&mut updates).await,
            StatusUpdate::WifiRetriesExhausted { attempts: 5 }
        );

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.link, LinkState::Idle);
        assert_eq!(h.wifi.connect_count(), 6);
        assert!(updates.try_recv().is_err());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_reconnect_failure_is_reported() {
        let h = spawn();
        let mut updates = h.handle.subscribe();
        h.handle
            .connect_wifi("HomeNet", "password123")
            .await
            .unwrap();

        h.wifi.fail_next_connect(StatusCode(0x3001));
        h.wifi
            .emit_wifi(WifiEvent::StaDisconnected { reason: Some(201) });
        assert_eq!(
            next_update(&mut updates).await,
            StatusUpdate::WifiFailed(WifiError::TransportFailure(StatusCode(0x3001)))
        );

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.link, LinkState::Disconnected);
        assert_eq!(status.retry_count, 1);
        assert_eq!(status.disconnect_reason, Some(201));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_invalid_credentials_rejected() {
        let h = spawn();
        let result = h.handle.connect_wifi("", "password123").await;
        assert!(matches!(result, Err(DispatchError::Wifi(WifiError::Config(_)))));
        assert!(h.wifi.calls().is_empty());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_auto_associating_driver() {
        let wifi = HostWifi::with_os_network();
        let h = spawn_with(wifi);
        let mut updates = h.handle.subscribe();

        h.handle
            .connect_wifi("HomeNet", "password123")
            .await
            .unwrap();
        assert!(matches!(
            next_update(&mut updates).await,
            StatusUpdate::WifiConnected { .. }
        ));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_scan_through_handle() {
        let h = spawn();
        h.wifi.set_access_points(vec![ScanRecord {
            ssid: "Cafe".into(),
            rssi: -61,
            channel: 11,
        }]);
        let records = h.handle.scan(3).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ssid, "Cafe");
        h.cancel.cancel();
    }

    // ==================== Shutdown Tests ====================

    #[tokio::test]
    async fn test_requests_after_shutdown_fail() {
        let h = spawn();
        h.cancel.cancel();
        h.task.await.unwrap();

        assert_eq!(h.handle.status().await, Err(DispatchError::Closed));
        assert_eq!(
            h.handle.start_advertising().await,
            Err(DispatchError::Closed)
        );
    }
}
