//! BLE command/telemetry core for the SuperCompass handheld navigator.
//!
//! The device fuses a magnetometer heading with a GPS (or phone-supplied)
//! position and renders a live compass pointing at a user-selected target.
//! This library implements the part that talks to the companion app over a
//! BLE GATT service: inbound message queuing and dispatch, outbound
//! notification pacing, saved-location synchronization, connection lifecycle
//! and health telemetry.
//!
//! Everything here is plain sequential logic driven by a cooperative main
//! loop; BLE stack callbacks only ever enqueue raw bytes. The ESP-IDF radio
//! glue and NVS persistence live behind the `esp32` feature so the core can
//! be built and tested on the host.

pub mod config;
pub mod dispatch;
pub mod lifecycle;
pub mod nav;
pub mod publish;
pub mod ring;
pub mod service;
pub mod stats;
pub mod storage;

#[cfg(feature = "esp32")]
pub mod ble_server;
#[cfg(feature = "esp32")]
pub mod location_storage;

pub use nav::{BlePosition, NavigationTarget, PositionValidity, SavedLocation};
pub use ring::{InboundKind, InboundMessage, NotifyChannel, OutboundMessage};
pub use service::{CompassBleService, TickActions};
pub use stats::HealthCounters;
