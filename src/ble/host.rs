//! Host BLE driver.
//!
//! There is no radio on the host. This driver records every primitive the
//! session calls and lets the caller play the part of the peer (connect,
//! write, read, disconnect) by pushing events into the registered sinks.
//! Clones share state, so a test can keep one handle while the session owns
//! another.

use crate::config::DEFAULT_DEVICE_NAME;
use crate::transport::{
    AddressType, AdvFields, AdvParams, AdvertiseDuration, AttrHandle, BleDriver, ConnHandle,
    EventSink, GapEvent, MessageBuffer, StatusCode,
};
use log::info;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Handle the host driver assigns to the read/notify characteristic.
pub const HOST_NOTIFY_HANDLE: AttrHandle = AttrHandle(0x0003);

/// Handle the host driver assigns to the write characteristic.
pub const HOST_WRITE_HANDLE: AttrHandle = AttrHandle(0x0005);

/// One recorded `advertise_start` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseCall {
    pub addr_type: AddressType,
    pub fields: AdvFields,
    pub params: AdvParams,
    pub duration: AdvertiseDuration,
}

/// One recorded `notify` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyCall {
    pub conn: ConnHandle,
    pub chr: AttrHandle,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct HostBleState {
    gatt_sink: Option<Arc<dyn EventSink>>,
    adv_sink: Option<Arc<dyn EventSink>>,
    advertisements: Vec<AdvertiseCall>,
    notifications: Vec<NotifyCall>,
    notify_attempts: usize,
    /// Statuses returned by the next `advertise_start` calls, front first.
    advertise_failures: VecDeque<StatusCode>,
    notify_status: Option<StatusCode>,
    read_value: Option<(AttrHandle, Vec<u8>)>,
}

/// Loopback BLE driver.
#[derive(Clone)]
pub struct HostBle {
    name: String,
    state: Arc<Mutex<HostBleState>>,
}

impl HostBle {
    /// Create a driver advertising as `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(HostBleState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostBleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `advertise_start` fail with `status`.
    pub fn fail_next_advertise(&self, status: StatusCode) {
        self.state().advertise_failures.push_back(status);
    }

    /// Make every following `notify` fail with `status` (`None` restores
    /// success).
    pub fn set_notify_failure(&self, status: Option<StatusCode>) {
        self.state().notify_status = status;
    }

    /// All advertise calls so far.
    pub fn advertisements(&self) -> Vec<AdvertiseCall> {
        self.state().advertisements.clone()
    }

    /// Number of advertise calls so far.
    pub fn advertise_count(&self) -> usize {
        self.state().advertisements.len()
    }

    /// Number of `notify` calls, failed ones included.
    pub fn notify_attempts(&self) -> usize {
        self.state().notify_attempts
    }

    /// All notifications sent so far.
    pub fn notifications(&self) -> Vec<NotifyCall> {
        self.state().notifications.clone()
    }

    /// Last value stored with `set_read_value`.
    pub fn read_value(&self) -> Option<(AttrHandle, Vec<u8>)> {
        self.state().read_value.clone()
    }

    /// Peer connects (or fails to) through the current advertising period.
    pub fn peer_connect(&self, conn: ConnHandle, status: StatusCode) {
        self.emit_gap(GapEvent::Connect { status, conn });
    }

    /// Peer disconnects.
    pub fn peer_disconnect(&self, conn: ConnHandle, reason: i32) {
        self.emit_gap(GapEvent::Disconnect { conn, reason });
    }

    /// The current advertising period ends.
    pub fn advertising_complete(&self) {
        self.emit_gap(GapEvent::AdvComplete { reason: 0 });
    }

    /// Peer writes to the write characteristic.
    pub fn peer_write(&self, conn: ConnHandle, payload: &[u8]) {
        let sink = self.state().gatt_sink.clone();
        if let Some(sink) = sink {
            sink.on_gatt_write(conn, HOST_WRITE_HANDLE, payload.to_vec());
        }
    }

    /// Peer reads the read/notify characteristic.
    pub fn peer_read(&self, conn: ConnHandle) -> Vec<u8> {
        let sink = self.state().gatt_sink.clone();
        sink.map(|sink| sink.on_gatt_read(conn, HOST_NOTIFY_HANDLE))
            .unwrap_or_default()
    }

    fn emit_gap(&self, event: GapEvent) {
        // Release the lock before calling out: the sink may call straight
        // back into the driver.
        let sink = self.state().adv_sink.clone();
        if let Some(sink) = sink {
            sink.on_ble_gap_event(event);
        }
    }
}

impl Default for HostBle {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_NAME)
    }
}

impl BleDriver for HostBle {
    fn register_gatt(&mut self, sink: Arc<dyn EventSink>) -> Result<AttrHandle, StatusCode> {
        self.state().gatt_sink = Some(sink);
        info!(
            "[host-ble] GATT service registered (notify {:?}, write {:?})",
            HOST_NOTIFY_HANDLE, HOST_WRITE_HANDLE
        );
        Ok(HOST_NOTIFY_HANDLE)
    }

    fn device_name(&self) -> String {
        self.name.clone()
    }

    fn advertise_start(
        &mut self,
        addr_type: AddressType,
        fields: &AdvFields,
        params: &AdvParams,
        duration: AdvertiseDuration,
        sink: Arc<dyn EventSink>,
    ) -> Result<(), StatusCode> {
        let mut state = self.state();
        state.advertisements.push(AdvertiseCall {
            addr_type,
            fields: fields.clone(),
            params: *params,
            duration,
        });
        if let Some(status) = state.advertise_failures.pop_front() {
            return Err(status);
        }
        state.adv_sink = Some(sink);
        info!("[host-ble] advertising as '{}'", fields.name);
        Ok(())
    }

    fn set_read_value(&mut self, chr: AttrHandle, value: &[u8]) -> Result<(), StatusCode> {
        self.state().read_value = Some((chr, value.to_vec()));
        Ok(())
    }

    fn notify(
        &mut self,
        conn: ConnHandle,
        chr: AttrHandle,
        buffer: MessageBuffer,
    ) -> Result<(), StatusCode> {
        let mut state = self.state();
        state.notify_attempts += 1;
        if let Some(status) = state.notify_status {
            return Err(status);
        }
        state.notifications.push(NotifyCall {
            conn,
            chr,
            payload: buffer.into_vec(),
        });
        Ok(())
    }
}
