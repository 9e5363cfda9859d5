//! BLE driver primitives.

use super::events::{EventSink, StatusCode};
use std::fmt;
use std::sync::Arc;

/// Connection handle assigned by the BLE stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(pub u16);

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// GATT attribute handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttrHandle(pub u16);

/// Own-address type used when advertising.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressType {
    /// Public device address.
    #[default]
    Public,
    /// Static random address.
    Random,
    /// Resolvable private address, falling back to public.
    RpaPublic,
    /// Resolvable private address, falling back to random.
    RpaRandom,
}

/// Connectable mode of an advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnMode {
    /// Non-connectable.
    Non,
    /// Directed connectable.
    Directed,
    /// Undirected connectable.
    #[default]
    Undirected,
}

/// Discoverable mode of an advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscMode {
    /// Non-discoverable.
    Non,
    /// Limited discoverable.
    Limited,
    /// General discoverable.
    #[default]
    General,
}

/// Advertisement payload fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvFields {
    /// Device name carried in the advertisement.
    pub name: String,
    /// Whether `name` is the complete local name.
    pub name_is_complete: bool,
}

/// Advertising connectivity parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdvParams {
    pub conn_mode: ConnMode,
    pub disc_mode: DiscMode,
}

impl AdvParams {
    /// Undirected connectable, general discoverable.
    pub fn connectable() -> Self {
        Self {
            conn_mode: ConnMode::Undirected,
            disc_mode: DiscMode::General,
        }
    }
}

/// How long an advertising period lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertiseDuration {
    /// Until connected or explicitly stopped (`BLE_HS_FOREVER`).
    Forever,
    /// For the given number of milliseconds.
    Millis(u32),
}

/// Outbound notification buffer.
///
/// Stand-in for the stack's mbuf: owns the bytes and reports their real
/// length, so the driver never sees a length that differs from the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBuffer {
    data: Vec<u8>,
}

impl MessageBuffer {
    /// Copy a flat byte slice into a new buffer.
    pub fn from_flat(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the buffer, returning the payload.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// BLE peripheral driver.
///
/// Implemented over esp32-nimble on the device and by `ble::HostBle` on the
/// host. All primitives are non-blocking: advertising registers `sink` and
/// returns immediately, GAP and GATT traffic comes back through it.
pub trait BleDriver: Send {
    /// Register the GATT service (one read/notify characteristic, one write
    /// characteristic) and route its access callbacks to `sink`.
    ///
    /// Returns the handle of the notify characteristic.
    fn register_gatt(&mut self, sink: Arc<dyn EventSink>) -> Result<AttrHandle, StatusCode>;

    /// Name the GAP service advertises.
    fn device_name(&self) -> String;

    /// Start advertising. GAP events for this advertising period are
    /// delivered to `sink`.
    fn advertise_start(
        &mut self,
        addr_type: AddressType,
        fields: &AdvFields,
        params: &AdvParams,
        duration: AdvertiseDuration,
        sink: Arc<dyn EventSink>,
    ) -> Result<(), StatusCode>;

    /// Store the value the stack serves when the peer reads `chr`.
    ///
    /// Stacks that answer reads from their own task without calling back
    /// serve this value; the host driver keeps it for inspection.
    fn set_read_value(&mut self, chr: AttrHandle, value: &[u8]) -> Result<(), StatusCode>;

    /// Send a notification on `chr` to the peer on `conn`.
    fn notify(
        &mut self,
        conn: ConnHandle,
        chr: AttrHandle,
        buffer: MessageBuffer,
    ) -> Result<(), StatusCode>;
}
