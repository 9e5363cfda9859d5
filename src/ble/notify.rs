//! Notification dispatcher.
//!
//! Serializes application bytes into the driver's message buffer and hands
//! them to the notify primitive for the connected peer. The buffer length is
//! always the payload's byte length.

use crate::transport::{AttrHandle, BleDriver, ConnHandle, MessageBuffer, StatusCode};
use log::{debug, warn};
use std::fmt;

/// Errors returned by [`Notifier::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// No peer is connected; the driver was not called.
    NoActiveConnection,
    /// The driver's notify primitive returned a non-zero status.
    TransportFailure(StatusCode),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoActiveConnection => write!(f, "no active BLE connection"),
            Self::TransportFailure(status) => write!(f, "notify failed: {}", status),
        }
    }
}

impl std::error::Error for SendError {}

/// Sends notifications and keeps per-send counters.
#[derive(Debug, Default)]
pub struct Notifier {
    sent: u64,
    failed: u64,
    rejected: u64,
}

impl Notifier {
    /// Create a dispatcher with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Notify `payload` on `chr` to the peer on `conn`.
    ///
    /// Fails with [`SendError::NoActiveConnection`] without calling the
    /// driver when `conn` is `None`.
    pub fn dispatch<D: BleDriver + ?Sized>(
        &mut self,
        driver: &mut D,
        conn: Option<ConnHandle>,
        chr: AttrHandle,
        payload: &[u8],
    ) -> Result<(), SendError> {
        let Some(conn) = conn else {
            self.rejected += 1;
            return Err(SendError::NoActiveConnection);
        };

        let buffer = MessageBuffer::from_flat(payload);
        let len = buffer.len();

        match driver.notify(conn, chr, buffer) {
            Ok(()) => {
                self.sent += 1;
                debug!("Notified {} bytes to {}", len, conn);
                Ok(())
            }
            Err(status) => {
                self.failed += 1;
                warn!("Notify of {} bytes to {} failed: {}", len, conn, status);
                Err(SendError::TransportFailure(status))
            }
        }
    }

    /// Notifications accepted by the driver.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Notifications the driver rejected.
    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Notifications refused because no peer was connected.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{BleSession, HostBle, SessionPolicy, HOST_NOTIFY_HANDLE};
    use crate::transport::{GapEvent, NullSink};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn connected_session() -> (BleSession<HostBle>, HostBle) {
        let driver = HostBle::default();
        let stub = driver.clone();
        let mut session = BleSession::new(
            driver,
            SessionPolicy::default(),
            Arc::new(NullSink),
            CancellationToken::new(),
        )
        .unwrap();
        session.start_advertising().unwrap();
        session
            .on_event(GapEvent::Connect {
                status: StatusCode::OK,
                conn: ConnHandle(9),
            })
            .unwrap();
        (session, stub)
    }

    #[test]
    fn test_notify_without_connection_skips_driver() {
        let mut driver = HostBle::default();
        let mut notifier = Notifier::new();

        let result = notifier.dispatch(&mut driver, None, HOST_NOTIFY_HANDLE, b"hello");
        assert_eq!(result, Err(SendError::NoActiveConnection));
        assert_eq!(driver.notify_attempts(), 0);
        assert_eq!(notifier.rejected(), 1);
    }

    #[test]
    fn test_notify_uses_payload_length() {
        let (mut session, stub) = connected_session();
        session.notify(b"hello").unwrap();

        let sent = stub.notifications();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload.len(), 5);
        assert_eq!(sent[0].payload, b"hello");
        assert_eq!(sent[0].conn, ConnHandle(9));
        assert_eq!(sent[0].chr, HOST_NOTIFY_HANDLE);
        assert_eq!(session.notifier().sent(), 1);
    }

    #[test]
    fn test_notify_transport_failure() {
        let (mut session, stub) = connected_session();
        stub.set_notify_failure(Some(StatusCode(14)));

        let result = session.notify(b"data");
        assert_eq!(result, Err(SendError::TransportFailure(StatusCode(14))));
        assert_eq!(session.notifier().failed(), 1);
        assert!(stub.notifications().is_empty());
    }

    #[test]
    fn test_notify_after_disconnect_fails() {
        let (mut session, stub) = connected_session();
        session
            .on_event(GapEvent::Disconnect {
                conn: ConnHandle(9),
                reason: 0x13,
            })
            .unwrap();

        assert_eq!(session.notify(b"late"), Err(SendError::NoActiveConnection));
        assert_eq!(stub.notify_attempts(), 0);
    }

    #[test]
    fn test_empty_payload_is_sent() {
        let (mut session, stub) = connected_session();
        session.notify(&[]).unwrap();
        assert_eq!(stub.notifications()[0].payload.len(), 0);
    }
}
