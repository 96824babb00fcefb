//! Compile-time configuration for the BLE navigation service.

/// Name the device advertises under.
pub const DEVICE_NAME: &str = "SuperCompass";

/// Firmware version reported in Ready/Status telemetry.
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

// GATT service and characteristic UUIDs.
pub const SERVICE_UUID: &str = "e393c3ca-4e9f-4d5c-bba0-37e53272f8b3";
pub const TARGET_CHAR_UUID: &str = "78afdeb8-a315-4030-8337-629d4e021306";
pub const READY_CHAR_UUID: &str = "6a1ac8ba-1b39-4a1f-bd6b-0c8c7f3e9d52";
pub const LOCATIONS_LIST_CHAR_UUID: &str = "cdefa4dc-b73e-4865-b35f-fafa76914afb";
pub const LOCATIONS_MODIFY_CHAR_UUID: &str = "c660ca7d-b7ea-4c13-84fe-74dd8a11814d";
pub const CURRENT_POSITION_CHAR_UUID: &str = "b5439cfa-7d1b-4e82-8a81-f5d84a276dc2";

/// Slot count for each ring buffer. One slot stays empty to distinguish full
/// from empty, so 7 messages can be queued per direction. Sized for burst
/// tolerance against the ~50 ms main loop cadence.
pub const INBOUND_RING_SLOTS: usize = 8;
pub const OUTBOUND_RING_SLOTS: usize = 8;

/// Largest accepted inbound write payload.
pub const MAX_INBOUND_PAYLOAD: usize = 120;

/// Largest outbound notification payload. Chosen to fit under a typical
/// negotiated link MTU minus ATT overhead.
pub const MAX_OUTBOUND_PAYLOAD: usize = 180;

/// Main loop cadence.
pub const LOOP_INTERVAL_MS: u32 = 50;

/// Ready/Status heartbeat interval while a client is connected.
pub const HEARTBEAT_INTERVAL_MS: u32 = 15_000;

/// Advertising watchdog: while not connected, re-issue the advertising start
/// call whenever this much time has passed since the last check.
pub const ADV_WATCHDOG_INTERVAL_MS: u32 = 5_000;

/// Slow timer for target/position consistency warnings.
pub const CONSISTENCY_CHECK_INTERVAL_MS: u32 = 30_000;

/// A BLE-supplied position older than this is flagged stale but still used.
pub const POSITION_STALE_MS: u32 = 30_000;

/// A BLE-supplied position older than this is treated as absent.
pub const POSITION_EXPIRY_MS: u32 = 60_000;

/// Saved locations sent per chunk notification.
pub const LOCATIONS_PAGE_SIZE: usize = 3;

/// Saved-location names are truncated to this many bytes so a single-entry
/// chunk always fits the outbound payload cap.
pub const MAX_LOCATION_NAME_LEN: usize = 32;

/// Target labels are truncated to this many bytes.
pub const MAX_TARGET_LABEL_LEN: usize = 32;

/// Label stored when a Target write carries no `name` field.
pub const DEFAULT_TARGET_LABEL: &str = "BLE Target";

/// Preferred connection interval window advertised to centrals, in units of
/// 1.25 ms (0x18..0x28 = 30..50 ms).
pub const ADV_CONN_INTERVAL_MIN: u16 = 0x18;
pub const ADV_CONN_INTERVAL_MAX: u16 = 0x28;

/// Compact binary position frame: magic byte, lat and lon as little-endian
/// int32 scaled by 1e7, accuracy as uint16 x100 (reserved), one flags byte.
pub const POSITION_FRAME_LEN: usize = 12;
pub const POSITION_FRAME_MAGIC: u8 = 0xA1;
