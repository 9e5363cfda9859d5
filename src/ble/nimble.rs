//! esp32-nimble backed BLE driver.
//!
//! # GATT Service Structure
//!
//! ```text
//! Service 0x0180
//! ├── 0xFEF4 (Read, Notify) - served by the session's read source
//! └── 0xDEAD (Write)        - last written payload kept by the session
//! ```
//!
//! NimBLE assigns attribute handles at registration time and esp32-nimble
//! does not expose them, so the driver hands out the characteristic UUIDs
//! as logical handles.
//!
//! Reads are answered by the host task from the value stored with
//! `set_read_value`. The characteristic stays locked while a read is
//! served, so nothing may wait on the dispatcher inside that access.
//!
//! The stack's own restart of advertising after a disconnect is turned off;
//! the session decides when to advertise again. esp32-nimble only reports
//! established connections, so failed attempts are picked up with a NimBLE
//! GAP event listener.

use crate::transport::{
    AddressType, AdvFields, AdvParams, AdvertiseDuration, AttrHandle, BleDriver, ConnHandle,
    ConnMode, DiscMode, EventSink, GapEvent, MessageBuffer, StatusCode,
};
use esp32_nimble::enums::{ConnMode as NimbleConnMode, DiscMode as NimbleDiscMode, OwnAddrType};
use esp32_nimble::utilities::mutex::Mutex as NimbleMutex;
use esp32_nimble::utilities::BleUuid;
use esp32_nimble::{
    BLEAdvertisementData, BLECharacteristic, BLEDevice, BLEError, NimbleProperties,
};
use esp_idf_sys::{
    ble_gap_event, ble_gap_event_listener, ble_gap_event_listener_register,
    BLE_GAP_EVENT_CONNECT,
};
use log::{info, warn};
use std::ffi::c_void;
use std::sync::Arc;

/// Primary service UUID.
const SERVICE_UUID: BleUuid = BleUuid::Uuid16(0x0180);

/// Read/notify characteristic UUID.
const NOTIFY_CHAR_UUID: u16 = 0xFEF4;

/// Write characteristic UUID.
const WRITE_CHAR_UUID: u16 = 0xDEAD;

fn status(e: BLEError) -> StatusCode {
    StatusCode(e.code() as i32)
}

unsafe extern "C" fn on_gap_event(event: *mut ble_gap_event, arg: *mut c_void) -> i32 {
    // SAFETY: NimBLE passes a valid event, and `arg` is the leaked sink
    // from `listen_for_failed_connects`.
    let (event, sink) = unsafe { (&*event, &*(arg as *const Arc<dyn EventSink>)) };
    if event.type_ as u32 != BLE_GAP_EVENT_CONNECT {
        return 0;
    }
    // SAFETY: `connect` is the active member for connect events.
    let connect = unsafe { &event.__bindgen_anon_1.connect };
    // Established connections arrive through `BLEServer::on_connect`.
    if connect.status != 0 {
        sink.on_ble_gap_event(GapEvent::Connect {
            status: StatusCode(connect.status),
            conn: ConnHandle(connect.conn_handle),
        });
    }
    0
}

/// Register a GAP listener that forwards failed connection attempts.
fn listen_for_failed_connects(sink: Arc<dyn EventSink>) -> Result<(), StatusCode> {
    // NimBLE keeps both pointers for the life of the host stack.
    // SAFETY: the listener is plain C data; all-zero is its unlinked state.
    let listener: &'static mut ble_gap_event_listener =
        Box::leak(Box::new(unsafe { std::mem::zeroed() }));
    let arg = Box::into_raw(Box::new(sink));

    // SAFETY: `listener` and `arg` are never freed once registered.
    let rc = unsafe { ble_gap_event_listener_register(listener, Some(on_gap_event), arg.cast()) };
    if rc != 0 {
        // SAFETY: registration failed, so NimBLE holds no copy of `arg`.
        drop(unsafe { Box::from_raw(arg) });
        return Err(StatusCode(rc));
    }
    Ok(())
}

/// NimBLE peripheral driver.
pub struct NimbleDriver {
    name: String,
    notify_chr: Option<Arc<NimbleMutex<BLECharacteristic>>>,
    listening: bool,
}

impl NimbleDriver {
    /// Take the BLE device and set the GAP name.
    pub fn new(name: impl Into<String>) -> Result<Self, StatusCode> {
        let name = name.into();
        // Initializes the host stack on first use.
        BLEDevice::take();
        BLEDevice::set_device_name(&name).map_err(status)?;
        Ok(Self {
            name,
            notify_chr: None,
            listening: false,
        })
    }
}

impl BleDriver for NimbleDriver {
    fn register_gatt(&mut self, sink: Arc<dyn EventSink>) -> Result<AttrHandle, StatusCode> {
        let server = BLEDevice::take().get_server();
        server.advertise_on_disconnect(false);

        if !self.listening {
            listen_for_failed_connects(sink.clone())?;
            self.listening = true;
        }

        let connect_sink = sink.clone();
        server.on_connect(move |_server, desc| {
            connect_sink.on_ble_gap_event(GapEvent::Connect {
                status: StatusCode::OK,
                conn: ConnHandle(desc.conn_handle()),
            });
        });

        let disconnect_sink = sink.clone();
        server.on_disconnect(move |desc, reason| {
            let reason = match reason {
                Ok(()) => 0,
                Err(e) => e.code() as i32,
            };
            disconnect_sink.on_ble_gap_event(GapEvent::Disconnect {
                conn: ConnHandle(desc.conn_handle()),
                reason,
            });
        });

        let service = server.create_service(SERVICE_UUID);

        let notify_chr = service.lock().create_characteristic(
            BleUuid::Uuid16(NOTIFY_CHAR_UUID),
            NimbleProperties::READ | NimbleProperties::NOTIFY,
        );

        let write_chr = service
            .lock()
            .create_characteristic(BleUuid::Uuid16(WRITE_CHAR_UUID), NimbleProperties::WRITE);
        let write_sink = sink;
        write_chr.lock().on_write(move |args| {
            let conn = ConnHandle(args.desc().conn_handle());
            write_sink.on_gatt_write(conn, AttrHandle(WRITE_CHAR_UUID), args.recv_data().to_vec());
        });

        self.notify_chr = Some(notify_chr);
        info!("GATT service registered");
        Ok(AttrHandle(NOTIFY_CHAR_UUID))
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
        let device = BLEDevice::take();
        device.set_own_addr_type(match addr_type {
            AddressType::Public => OwnAddrType::Public,
            AddressType::Random => OwnAddrType::Random,
            AddressType::RpaPublic => OwnAddrType::RpaPublicDefault,
            AddressType::RpaRandom => OwnAddrType::RpaRandomDefault,
        });

        let advertising = device.get_advertising();
        let mut advertising = advertising.lock();

        let mut data = BLEAdvertisementData::new();
        if fields.name_is_complete {
            data.name(&fields.name);
        } else {
            data.short_name(&fields.name);
        }
        advertising.set_data(&mut data).map_err(status)?;

        advertising
            .advertisement_type(match params.conn_mode {
                ConnMode::Non => NimbleConnMode::Non,
                ConnMode::Directed => NimbleConnMode::Dir,
                ConnMode::Undirected => NimbleConnMode::Und,
            })
            .disc_mode(match params.disc_mode {
                DiscMode::Non => NimbleDiscMode::Non,
                DiscMode::Limited => NimbleDiscMode::Ltd,
                DiscMode::General => NimbleDiscMode::Gen,
            })
            .on_complete(move |reason| {
                sink.on_ble_gap_event(GapEvent::AdvComplete { reason });
            });

        match duration {
            AdvertiseDuration::Forever => advertising.start().map_err(status),
            AdvertiseDuration::Millis(ms) => advertising
                .start_with_duration(ms as i32)
                .map_err(status),
        }
    }

    fn set_read_value(&mut self, chr: AttrHandle, value: &[u8]) -> Result<(), StatusCode> {
        let Some(notify_chr) = self.notify_chr.as_ref() else {
            return Err(StatusCode::FAIL);
        };
        if chr != AttrHandle(NOTIFY_CHAR_UUID) {
            return Err(StatusCode::INVALID_ARG);
        }
        notify_chr.lock().set_value(value);
        Ok(())
    }

    fn notify(
        &mut self,
        conn: ConnHandle,
        chr: AttrHandle,
        buffer: MessageBuffer,
    ) -> Result<(), StatusCode> {
        let Some(notify_chr) = self.notify_chr.as_ref() else {
            warn!("Notify before GATT registration");
            return Err(StatusCode::FAIL);
        };
        if chr != AttrHandle(NOTIFY_CHAR_UUID) {
            return Err(StatusCode::INVALID_ARG);
        }
        notify_chr
            .lock()
            .notify_with(buffer.as_bytes(), conn.0)
            .map_err(status)
    }
}
