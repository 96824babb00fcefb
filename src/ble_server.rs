// BLE GATT server glue for the navigation service, built on the raw ESP-IDF
// Bluedroid APIs.
//
// This layer owns nothing but plumbing: it registers the GATT/GAP callbacks,
// creates the service and its five characteristics, keeps advertising alive
// and shuttles bytes between the stack and the CompassBleService core. The
// callbacks run on the Bluedroid task, so they only enqueue into the core's
// rings and never parse or serialize.

use std::ffi::CString;
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use esp_idf_svc::bt::{Ble, BtDriver};
use esp_idf_svc::hal::delay::FreeRtos;
use esp_idf_svc::sys as esp_idf_sys;
use log::{debug, error, info, warn};

use crate::config::{
    ADV_CONN_INTERVAL_MAX, ADV_CONN_INTERVAL_MIN, CURRENT_POSITION_CHAR_UUID, DEVICE_NAME,
    LOCATIONS_LIST_CHAR_UUID, LOCATIONS_MODIFY_CHAR_UUID, MAX_INBOUND_PAYLOAD,
    MAX_OUTBOUND_PAYLOAD, READY_CHAR_UUID, SERVICE_UUID, TARGET_CHAR_UUID,
};
use crate::ring::{InboundKind, NotifyChannel, OutboundMessage};
use crate::service::CompassBleService;

#[derive(Debug, Clone, PartialEq)]
pub enum BleError {
    EspError(esp_idf_sys::esp_err_t, String),
    NotInitialized(String),
    AlreadyInitialized(String),
    InvalidUuid(String),
    DeviceNameSetFailed(String),
    NotConnected,
    OperationTimeout(String),
}

impl std::fmt::Display for BleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BleError::EspError(code, msg) => write!(f, "ESP-IDF error {}: {}", code, msg),
            BleError::NotInitialized(msg) => write!(f, "BLE not initialized: {}", msg),
            BleError::AlreadyInitialized(msg) => write!(f, "BLE already initialized: {}", msg),
            BleError::InvalidUuid(msg) => write!(f, "Invalid UUID: {}", msg),
            BleError::DeviceNameSetFailed(msg) => write!(f, "Device name set failed: {}", msg),
            BleError::NotConnected => write!(f, "No BLE client connected"),
            BleError::OperationTimeout(op) => write!(f, "BLE operation timeout: {}", op),
        }
    }
}

impl std::error::Error for BleError {}

pub type BleResult<T> = Result<T, BleError>;

// Global state for callback access.
static GATT_INTERFACE: AtomicU8 = AtomicU8::new(0);
static CONN_ID: AtomicU16 = AtomicU16::new(0);

// The service core plus the attribute handles the callbacks resolve against.
static SHARED: OnceLock<Arc<Mutex<SharedState>>> = OnceLock::new();

#[derive(Default)]
struct CharHandles {
    target: u16,
    ready: u16,
    locations_list: u16,
    locations_modify: u16,
    current_position: u16,
    /// Client config descriptor handles, indexed like `CHAR_SPECS`; 0 where
    /// the characteristic has none.
    client_config: [u16; 5],
    /// Index of the next `CHAR_SPECS` entry whose creation has not been
    /// issued yet. Attributes are added strictly one at a time so each
    /// descriptor lands on the characteristic it belongs to.
    next_spec: usize,
}

struct SharedState {
    service: CompassBleService,
    handles: CharHandles,
    service_handle: u16,
}

/// Runs a closure against the shared state from callback or main-loop
/// context. Returns `None` before initialization or on a poisoned mutex;
/// panic safety is handled at the callback boundary with catch_unwind.
fn with_shared<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut SharedState) -> R,
{
    let shared = SHARED.get()?;
    let mut state = shared.lock().ok()?;
    Some(f(&mut state))
}

/// Runs a closure against the service core alone.
pub fn with_service<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut CompassBleService) -> R,
{
    with_shared(|state| f(&mut state.service))
}

/// Milliseconds since boot, wrapping after ~49 days. All service timers use
/// wrapping arithmetic, so the wrap is harmless.
pub fn now_ms() -> u32 {
    (unsafe { esp_idf_sys::esp_timer_get_time() } / 1000) as u32
}

pub struct BleServer {
    // Holding the driver keeps the controller and Bluedroid alive; dropping
    // it tears the whole stack down.
    _bt_driver: BtDriver<'static, Ble>,
}

impl BleServer {
    /// Takes ownership of an already-enabled BT driver and the service core,
    /// registers the callbacks and creates the GATT service. Characteristic
    /// creation and service start complete asynchronously in the callbacks.
    pub fn start(
        bt_driver: BtDriver<'static, Ble>,
        service: CompassBleService,
    ) -> BleResult<Self> {
        let shared = Arc::new(Mutex::new(SharedState {
            service,
            handles: CharHandles::default(),
            service_handle: 0,
        }));
        if SHARED.set(shared).is_err() {
            return Err(BleError::AlreadyInitialized(
                "BLE server state already set".to_string(),
            ));
        }

        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gatts_register_callback(Some(gatts_event_handler)) },
            "GATT server callback registration",
        )?;
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gap_register_callback(Some(gap_event_handler)) },
            "GAP callback registration",
        )?;
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gatts_app_register(0) },
            "GATT application registration",
        )?;

        // The REG_EVT callback publishes the interface; wait for it before
        // creating the service.
        let mut waited_ms = 0;
        while GATT_INTERFACE.load(Ordering::SeqCst) == 0 {
            if waited_ms > 2_000 {
                return Err(BleError::OperationTimeout(
                    "GATT application registration".to_string(),
                ));
            }
            FreeRtos::delay_ms(10);
            waited_ms += 10;
        }

        let server = Self {
            _bt_driver: bt_driver,
        };
        server.create_service()?;
        server.configure_advertising()?;
        start_advertising()?;
        Ok(server)
    }

    fn create_service(&self) -> BleResult<()> {
        let service_uuid = parse_uuid(SERVICE_UUID)?;
        let service_id = esp_idf_sys::esp_gatt_srvc_id_t {
            is_primary: true,
            id: esp_idf_sys::esp_gatt_id_t {
                uuid: esp_idf_sys::esp_bt_uuid_t {
                    len: esp_idf_sys::ESP_UUID_LEN_128 as u16,
                    uuid: esp_idf_sys::esp_bt_uuid_t__bindgen_ty_1 {
                        uuid128: service_uuid,
                    },
                },
                inst_id: 0,
            },
        };

        // Service declaration, five characteristics at two attributes each,
        // and a client config descriptor on each notify characteristic.
        call_esp_api_with_context(
            || unsafe {
                esp_idf_sys::esp_ble_gatts_create_service(
                    GATT_INTERFACE.load(Ordering::SeqCst),
                    &service_id as *const _ as *mut _,
                    20,
                )
            },
            "GATT service creation",
        )
    }

    fn configure_advertising(&self) -> BleResult<()> {
        let device_name = CString::new(DEVICE_NAME)
            .map_err(|_| BleError::DeviceNameSetFailed("name contains NUL".to_string()))?;
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gap_set_device_name(device_name.as_ptr()) },
            "Device name setting",
        )?;

        // The 128-bit service UUID goes in the primary advertising packet so
        // scanners can filter without a scan request; with flags that fills
        // the 31 bytes, so the name moves to the scan response.
        let service_uuid = parse_uuid(SERVICE_UUID)?;
        let mut adv_data = esp_idf_sys::esp_ble_adv_data_t {
            set_scan_rsp: false,
            include_name: false,
            include_txpower: false,
            min_interval: ADV_CONN_INTERVAL_MIN,
            max_interval: ADV_CONN_INTERVAL_MAX,
            appearance: 0x00,
            manufacturer_len: 0,
            p_manufacturer_data: std::ptr::null_mut(),
            service_data_len: 0,
            p_service_data: std::ptr::null_mut(),
            service_uuid_len: 16,
            p_service_uuid: service_uuid.as_ptr() as *mut u8,
            flag: (esp_idf_sys::ESP_BLE_ADV_FLAG_GEN_DISC
                | esp_idf_sys::ESP_BLE_ADV_FLAG_BREDR_NOT_SPT) as u8,
        };
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gap_config_adv_data(&mut adv_data) },
            "Advertising data configuration",
        )?;

        let mut scan_rsp_data = esp_idf_sys::esp_ble_adv_data_t {
            set_scan_rsp: true,
            include_name: true,
            include_txpower: false,
            min_interval: 0,
            max_interval: 0,
            appearance: 0x00,
            manufacturer_len: 0,
            p_manufacturer_data: std::ptr::null_mut(),
            service_data_len: 0,
            p_service_data: std::ptr::null_mut(),
            service_uuid_len: 0,
            p_service_uuid: std::ptr::null_mut(),
            flag: 0,
        };
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gap_config_adv_data(&mut scan_rsp_data) },
            "Scan response data configuration",
        )?;

        info!("advertising configured as '{}'", DEVICE_NAME);
        Ok(())
    }
}

/// Issues a start-advertising call. Safe to call while already advertising;
/// the controller treats it as a no-op error which is logged and swallowed
/// by the watchdog path.
pub fn start_advertising() -> BleResult<()> {
    let mut adv_params = esp_idf_sys::esp_ble_adv_params_t {
        adv_int_min: 0x20,
        adv_int_max: 0x40,
        adv_type: esp_idf_sys::esp_ble_adv_type_t_ADV_TYPE_IND,
        own_addr_type: esp_idf_sys::esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
        peer_addr: [0; 6],
        peer_addr_type: esp_idf_sys::esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
        channel_map: esp_idf_sys::esp_ble_adv_channel_t_ADV_CHNL_ALL,
        adv_filter_policy: esp_idf_sys::esp_ble_adv_filter_t_ADV_FILTER_ALLOW_SCAN_ANY_CON_ANY,
    };
    call_esp_api_with_context(
        || unsafe { esp_idf_sys::esp_ble_gap_start_advertising(&mut adv_params) },
        "Advertising start",
    )
}

/// Sends one queued notification, updating the attribute value first so a
/// plain read returns the same bytes the last notification carried. With no
/// central connected the value update alone completes the call; messages
/// queued while disconnected (like the service-start Ready) are not errors.
pub fn notify(msg: &OutboundMessage) -> BleResult<()> {
    let (handle, connected) = with_shared(|state| {
        let handle = match msg.channel() {
            NotifyChannel::Target => state.handles.target,
            NotifyChannel::Ready => state.handles.ready,
            NotifyChannel::LocationsList => state.handles.locations_list,
        };
        (handle, state.service.is_connected())
    })
    .unwrap_or((0, false));
    if handle == 0 {
        return Err(BleError::NotInitialized(
            "characteristic handle not resolved".to_string(),
        ));
    }

    let payload = msg.payload();
    call_esp_api_with_context(
        || unsafe {
            esp_idf_sys::esp_ble_gatts_set_attr_value(
                handle,
                payload.len() as u16,
                payload.as_ptr(),
            )
        },
        "Attribute value update",
    )?;
    if !connected {
        debug!("no central connected, notification stored as read value only");
        return Ok(());
    }
    call_esp_api_with_context(
        || unsafe {
            esp_idf_sys::esp_ble_gatts_send_indicate(
                GATT_INTERFACE.load(Ordering::SeqCst),
                CONN_ID.load(Ordering::SeqCst),
                handle,
                payload.len() as u16,
                payload.as_ptr() as *mut u8,
                false,
            )
        },
        "Notification send",
    )
}

/// Refreshes the readable characteristics from the current service state so
/// clients that poll with plain reads see fresh data between notifications.
pub fn refresh_read_values() {
    let snapshots = with_shared(|state| {
        [
            (state.handles.target, state.service.target_snapshot()),
            (state.handles.ready, state.service.ready_snapshot()),
            (
                state.handles.locations_list,
                state.service.locations_snapshot(),
            ),
        ]
    });
    let Some(snapshots) = snapshots else {
        return;
    };
    for (handle, value) in &snapshots {
        if *handle == 0 {
            continue;
        }
        let bytes = value.as_bytes();
        let result = call_esp_api_with_context(
            || unsafe {
                esp_idf_sys::esp_ble_gatts_set_attr_value(
                    *handle,
                    bytes.len() as u16,
                    bytes.as_ptr(),
                )
            },
            "Read value refresh",
        );
        if let Err(e) = result {
            debug!("read value refresh skipped: {}", e);
        }
    }
}

extern "C" fn gatts_event_handler(
    event: esp_idf_sys::esp_gatts_cb_event_t,
    gatt_interface: esp_idf_sys::esp_gatt_if_t,
    event_param: *mut esp_idf_sys::esp_ble_gatts_cb_param_t,
) {
    // Panics must never unwind into the Bluedroid task.
    let result =
        std::panic::catch_unwind(|| gatts_event_handler_impl(event, gatt_interface, event_param));
    if let Err(panic_info) = result {
        error!("panic in GATT event handler: {:?}", panic_info);
    }
}

fn gatts_event_handler_impl(
    event: esp_idf_sys::esp_gatts_cb_event_t,
    gatt_interface: esp_idf_sys::esp_gatt_if_t,
    event_param: *mut esp_idf_sys::esp_ble_gatts_cb_param_t,
) {
    if event_param.is_null() {
        return;
    }

    match event {
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_REG_EVT => {
            info!("GATT server registered, interface {}", gatt_interface);
            GATT_INTERFACE.store(gatt_interface, Ordering::SeqCst);
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_CREATE_EVT => {
            let create_event = unsafe { &(*event_param).create };
            info!(
                "GATT service created, handle {}",
                create_event.service_handle
            );
            with_shared(|state| state.service_handle = create_event.service_handle);
            continue_service_setup(create_event.service_handle);
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_ADD_CHAR_EVT => {
            let add_char_event = unsafe { &(*event_param).add_char };
            on_characteristic_added(add_char_event);
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_ADD_CHAR_DESCR_EVT => {
            let descr_event = unsafe { &(*event_param).add_char_descr };
            on_descriptor_added(descr_event);
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_CONNECT_EVT => {
            let connect_event = unsafe { &(*event_param).connect };
            CONN_ID.store(connect_event.conn_id, Ordering::SeqCst);
            with_shared(|state| state.service.on_connect(now_ms()));
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_DISCONNECT_EVT => {
            let disconnect_event = unsafe { &(*event_param).disconnect };
            debug!("disconnect reason {}", disconnect_event.reason);
            let restart = with_shared(|state| state.service.on_disconnect()).unwrap_or(false);
            if restart {
                if let Err(e) = start_advertising() {
                    error!("failed to restart advertising after disconnect: {}", e);
                }
            }
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_WRITE_EVT => {
            let write_event = unsafe { &(*event_param).write };
            if write_event.value.is_null() || write_event.len == 0 {
                warn!("write event with null or empty payload ignored");
                return;
            }
            let data = unsafe {
                std::slice::from_raw_parts(write_event.value, write_event.len as usize)
            };
            handle_characteristic_write(write_event.handle, data);
        }
        _ => {
            debug!("unhandled GATT event {}", event);
        }
    }
}

extern "C" fn gap_event_handler(
    event: esp_idf_sys::esp_gap_ble_cb_event_t,
    event_param: *mut esp_idf_sys::esp_ble_gap_cb_param_t,
) {
    let result = std::panic::catch_unwind(|| gap_event_handler_impl(event, event_param));
    if let Err(panic_info) = result {
        error!("panic in GAP event handler: {:?}", panic_info);
    }
}

fn gap_event_handler_impl(
    event: esp_idf_sys::esp_gap_ble_cb_event_t,
    _event_param: *mut esp_idf_sys::esp_ble_gap_cb_param_t,
) {
    match event {
        esp_idf_sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_DATA_SET_COMPLETE_EVT => {
            // Fires twice: advertising data and scan response.
        }
        esp_idf_sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_START_COMPLETE_EVT => {
            info!("advertising started");
            with_shared(|state| state.service.on_advertising_started());
        }
        esp_idf_sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_STOP_COMPLETE_EVT => {
            info!("advertising stopped");
        }
        esp_idf_sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_UPDATE_CONN_PARAMS_EVT => {
            debug!("connection parameters updated");
        }
        _ => {
            debug!("unhandled GAP event {}", event);
        }
    }
}

struct CharSpec {
    uuid: &'static str,
    perm: u32,
    prop: u32,
}

// Creation order matters only for readability of the logs; ADD_CHAR events
// are matched back by UUID, not by arrival order.
const CHAR_SPECS: [CharSpec; 5] = [
    CharSpec {
        uuid: TARGET_CHAR_UUID,
        perm: esp_idf_sys::ESP_GATT_PERM_READ | esp_idf_sys::ESP_GATT_PERM_WRITE,
        prop: esp_idf_sys::ESP_GATT_CHAR_PROP_BIT_READ
            | esp_idf_sys::ESP_GATT_CHAR_PROP_BIT_WRITE
            | esp_idf_sys::ESP_GATT_CHAR_PROP_BIT_NOTIFY,
    },
    CharSpec {
        uuid: READY_CHAR_UUID,
        perm: esp_idf_sys::ESP_GATT_PERM_READ,
        prop: esp_idf_sys::ESP_GATT_CHAR_PROP_BIT_READ
            | esp_idf_sys::ESP_GATT_CHAR_PROP_BIT_NOTIFY,
    },
    CharSpec {
        uuid: LOCATIONS_LIST_CHAR_UUID,
        perm: esp_idf_sys::ESP_GATT_PERM_READ,
        prop: esp_idf_sys::ESP_GATT_CHAR_PROP_BIT_READ
            | esp_idf_sys::ESP_GATT_CHAR_PROP_BIT_NOTIFY,
    },
    CharSpec {
        uuid: LOCATIONS_MODIFY_CHAR_UUID,
        perm: esp_idf_sys::ESP_GATT_PERM_WRITE,
        prop: esp_idf_sys::ESP_GATT_CHAR_PROP_BIT_WRITE
            | esp_idf_sys::ESP_GATT_CHAR_PROP_BIT_WRITE_NR,
    },
    CharSpec {
        uuid: CURRENT_POSITION_CHAR_UUID,
        perm: esp_idf_sys::ESP_GATT_PERM_WRITE,
        prop: esp_idf_sys::ESP_GATT_CHAR_PROP_BIT_WRITE
            | esp_idf_sys::ESP_GATT_CHAR_PROP_BIT_WRITE_NR,
    },
];

/// Issues the next pending attribute creation, or starts the service once
/// the whole table exists. Called after CREATE and after every ADD_CHAR /
/// ADD_CHAR_DESCR completion.
fn continue_service_setup(service_handle: u16) {
    let next_index = with_shared(|state| {
        if state.handles.next_spec < CHAR_SPECS.len() {
            let index = state.handles.next_spec;
            state.handles.next_spec += 1;
            Some(index)
        } else {
            None
        }
    })
    .flatten();

    match next_index {
        Some(index) => add_characteristic(service_handle, &CHAR_SPECS[index]),
        None => start_gatt_service(service_handle),
    }
}

fn add_characteristic(service_handle: u16, spec: &CharSpec) {
    let uuid_bytes = match parse_uuid(spec.uuid) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("characteristic UUID {} rejected: {}", spec.uuid, e);
            continue_service_setup(service_handle);
            return;
        }
    };
    let uuid_struct = esp_idf_sys::esp_bt_uuid_t {
        len: esp_idf_sys::ESP_UUID_LEN_128 as u16,
        uuid: esp_idf_sys::esp_bt_uuid_t__bindgen_ty_1 {
            uuid128: uuid_bytes,
        },
    };
    // Auto-responded attributes: the stack answers reads from the stored
    // value (kept fresh via set_attr_value) and acks writes itself. The
    // initial value is copied by the stack during creation.
    let readable = spec.perm & esp_idf_sys::ESP_GATT_PERM_READ != 0;
    let initial: &[u8] = b"{}";
    let mut attr_value = esp_idf_sys::esp_attr_value_t {
        attr_max_len: if readable {
            MAX_OUTBOUND_PAYLOAD as u16
        } else {
            MAX_INBOUND_PAYLOAD as u16
        },
        attr_len: initial.len() as u16,
        attr_value: initial.as_ptr() as *mut u8,
    };
    let mut control = esp_idf_sys::esp_attr_control_t {
        auto_rsp: esp_idf_sys::ESP_GATT_AUTO_RSP as u8,
    };
    let result = call_esp_api_with_context(
        || unsafe {
            esp_idf_sys::esp_ble_gatts_add_char(
                service_handle,
                &uuid_struct as *const _ as *mut _,
                spec.perm as u16,
                spec.prop as u8,
                &mut attr_value,
                &mut control,
            )
        },
        "Characteristic creation",
    );
    if let Err(e) = result {
        // No completion event will arrive for this one; move on so the rest
        // of the table still comes up.
        error!("characteristic {} creation failed: {}", spec.uuid, e);
        continue_service_setup(service_handle);
    }
}

/// Adds a client characteristic configuration descriptor (0x2902). The stack
/// attaches it to the characteristic added most recently, which the
/// sequential setup guarantees is the right one.
fn add_client_config_descriptor(service_handle: u16) {
    let mut descr_uuid = esp_idf_sys::esp_bt_uuid_t {
        len: esp_idf_sys::ESP_UUID_LEN_16 as u16,
        uuid: esp_idf_sys::esp_bt_uuid_t__bindgen_ty_1 {
            uuid16: esp_idf_sys::ESP_GATT_UUID_CHAR_CLIENT_CONFIG as u16,
        },
    };
    // Notifications start disabled until the central subscribes.
    let initial: [u8; 2] = [0, 0];
    let mut attr_value = esp_idf_sys::esp_attr_value_t {
        attr_max_len: 2,
        attr_len: 2,
        attr_value: initial.as_ptr() as *mut u8,
    };
    let mut control = esp_idf_sys::esp_attr_control_t {
        auto_rsp: esp_idf_sys::ESP_GATT_AUTO_RSP as u8,
    };
    let result = call_esp_api_with_context(
        || unsafe {
            esp_idf_sys::esp_ble_gatts_add_char_descr(
                service_handle,
                &mut descr_uuid,
                (esp_idf_sys::ESP_GATT_PERM_READ | esp_idf_sys::ESP_GATT_PERM_WRITE) as u16,
                &mut attr_value,
                &mut control,
            )
        },
        "Client config descriptor creation",
    );
    if let Err(e) = result {
        error!("client config descriptor creation failed: {}", e);
        continue_service_setup(service_handle);
    }
}

fn on_characteristic_added(
    add_char_event: &esp_idf_sys::esp_ble_gatts_cb_param_t_gatts_add_char_evt_param,
) {
    let uuid128 = unsafe { add_char_event.char_uuid.uuid.uuid128 };
    let handle = add_char_event.attr_handle;

    let step = with_shared(|state| {
        let slots = [
            &mut state.handles.target,
            &mut state.handles.ready,
            &mut state.handles.locations_list,
            &mut state.handles.locations_modify,
            &mut state.handles.current_position,
        ];
        let matched = CHAR_SPECS
            .iter()
            .zip(slots)
            .find(|(spec, _)| parse_uuid(spec.uuid).map(|b| b == uuid128).unwrap_or(false));

        match matched {
            Some((spec, slot)) => {
                debug!("characteristic {} mapped to handle {}", spec.uuid, handle);
                *slot = handle;
                let wants_cccd =
                    spec.prop & esp_idf_sys::ESP_GATT_CHAR_PROP_BIT_NOTIFY != 0;
                (wants_cccd, state.service_handle)
            }
            None => {
                warn!("ADD_CHAR event for unknown UUID ignored");
                (false, state.service_handle)
            }
        }
    });

    match step {
        Some((true, service_handle)) => add_client_config_descriptor(service_handle),
        Some((false, service_handle)) => continue_service_setup(service_handle),
        None => {}
    }
}

fn on_descriptor_added(
    descr_event: &esp_idf_sys::esp_ble_gatts_cb_param_t_gatts_add_char_descr_evt_param,
) {
    let handle = descr_event.attr_handle;
    with_shared(|state| {
        // The descriptor belongs to the most recently issued characteristic.
        if let Some(index) = state.handles.next_spec.checked_sub(1) {
            state.handles.client_config[index] = handle;
        }
    });
    debug!("client config descriptor at handle {}", handle);
    continue_service_setup(descr_event.service_handle);
}

fn start_gatt_service(service_handle: u16) {
    if service_handle == 0 {
        error!("all characteristics added but service handle is unset");
        return;
    }
    let result = call_esp_api_with_context(
        || unsafe { esp_idf_sys::esp_ble_gatts_start_service(service_handle) },
        "GATT service start",
    );
    match result {
        Ok(()) => {
            with_shared(|state| state.service.on_service_started(now_ms()));
            refresh_read_values();
        }
        Err(e) => error!("failed to start GATT service: {}", e),
    }
}

enum WriteTarget {
    Inbound(InboundKind),
    ClientConfig,
    Unknown,
}

fn handle_characteristic_write(handle: u16, data: &[u8]) {
    let target = with_shared(|state| {
        if handle == state.handles.target {
            WriteTarget::Inbound(InboundKind::Target)
        } else if handle == state.handles.locations_modify {
            WriteTarget::Inbound(InboundKind::LocationsModify)
        } else if handle == state.handles.current_position {
            WriteTarget::Inbound(InboundKind::Position)
        } else if handle != 0 && state.handles.client_config.contains(&handle) {
            WriteTarget::ClientConfig
        } else {
            WriteTarget::Unknown
        }
    });

    match target {
        Some(WriteTarget::Inbound(kind)) => {
            with_shared(|state| state.service.on_write(kind, data));
        }
        Some(WriteTarget::ClientConfig) => {
            // The stack stores the value and acks; this is just visibility.
            let enabled = data.first().map(|b| b & 1 != 0).unwrap_or(false);
            debug!(
                "notification subscription {} on handle {}",
                if enabled { "enabled" } else { "disabled" },
                handle
            );
        }
        Some(WriteTarget::Unknown) => warn!("write to unexpected handle {} ignored", handle),
        None => {}
    }
}

fn call_esp_api_with_context<F>(f: F, context: &str) -> BleResult<()>
where
    F: FnOnce() -> esp_idf_sys::esp_err_t,
{
    let result = f();
    if result == esp_idf_sys::ESP_OK {
        Ok(())
    } else {
        let error_msg = match result {
            esp_idf_sys::ESP_ERR_INVALID_STATE => {
                format!("{}: Invalid state - BLE stack not ready", context)
            }
            esp_idf_sys::ESP_ERR_INVALID_ARG => format!("{}: Invalid argument", context),
            esp_idf_sys::ESP_ERR_NO_MEM => format!("{}: Out of memory", context),
            esp_idf_sys::ESP_ERR_NOT_FOUND => format!("{}: Resource not found", context),
            esp_idf_sys::ESP_ERR_TIMEOUT => format!("{}: Operation timeout", context),
            _ => format!("{}: Unknown error", context),
        };
        Err(BleError::EspError(result, error_msg))
    }
}

// Parse a UUID string into the little-endian byte order ESP-IDF expects.
fn parse_uuid(uuid_str: &str) -> BleResult<[u8; 16]> {
    let uuid_clean = uuid_str.replace('-', "");
    if uuid_clean.len() != 32 {
        return Err(BleError::InvalidUuid(uuid_str.to_string()));
    }

    let mut uuid_bytes = [0u8; 16];
    for (i, chunk) in uuid_clean.as_bytes().chunks(2).enumerate() {
        if i >= 16 {
            break;
        }
        let hex_str = std::str::from_utf8(chunk)
            .map_err(|_| BleError::InvalidUuid(uuid_str.to_string()))?;
        uuid_bytes[15 - i] = u8::from_str_radix(hex_str, 16)
            .map_err(|_| BleError::InvalidUuid(uuid_str.to_string()))?;
    }

    Ok(uuid_bytes)
}
