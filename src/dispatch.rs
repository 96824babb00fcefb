//! Inbound message dispatcher.
//!
//! Decodes raw messages drained from the inbound ring into domain actions and
//! applies them to the shared navigation state. Parsing happens here, in
//! main-loop context, never inside the stack's write callbacks: JSON work
//! touches the heap and must not run where stack space and timing are
//! constrained.
//!
//! No failure propagates out of this module. A malformed message is logged,
//! reported as [`DispatchEffect::ParseError`] and dropped; it can never
//! corrupt processing of the messages queued behind it.

use log::{debug, info, warn};
use serde_json::Value;

use crate::config::{DEFAULT_TARGET_LABEL, POSITION_FRAME_LEN, POSITION_FRAME_MAGIC};
use crate::nav::{coords_in_range, BlePosition, NavState, NavigationTarget, SavedLocation};
use crate::ring::{InboundKind, InboundMessage};

/// What a dispatched message did, so the caller can update counters and
/// deferred-publish flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchEffect {
    /// Navigation target replaced; a deferred target publish is due.
    TargetUpdated,
    /// Saved-locations list mutated; persistence and a list re-send are due.
    LocationsChanged,
    /// Stats reset requested; an immediate Ready publish is due.
    StatsReset,
    /// BLE position overwritten.
    PositionUpdated { binary: bool },
    /// Recognized but intentionally ignored (unknown action, invalid index).
    NoOp,
    /// Undecodable or out-of-range input; nothing was mutated.
    ParseError,
}

pub fn dispatch(msg: &InboundMessage, nav: &mut NavState, now_ms: u32) -> DispatchEffect {
    match msg.kind() {
        InboundKind::Target => handle_target(msg.payload(), &mut nav.target),
        InboundKind::LocationsModify => handle_locations_modify(msg.payload(), &mut nav.locations),
        InboundKind::Position => handle_position(msg.payload(), &mut nav.position, now_ms),
    }
}

/// Extracts a coordinate pair, accepting both `lat`/`lon` and
/// `latitude`/`longitude` key spellings. `lat`/`lon` wins when both are
/// present.
fn extract_coords(doc: &Value) -> Option<(f64, f64)> {
    let pair = |lat_key: &str, lon_key: &str| {
        match (
            doc.get(lat_key).and_then(Value::as_f64),
            doc.get(lon_key).and_then(Value::as_f64),
        ) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    };
    pair("lat", "lon").or_else(|| pair("latitude", "longitude"))
}

fn parse_json(payload: &[u8], what: &str) -> Option<Value> {
    let text = match core::str::from_utf8(payload) {
        Ok(text) => text,
        Err(e) => {
            warn!("{} write is not valid UTF-8: {}", what, e);
            return None;
        }
    };
    match serde_json::from_str(text) {
        Ok(doc) => Some(doc),
        Err(e) => {
            warn!("{} JSON parse failed: {}", what, e);
            None
        }
    }
}

fn handle_target(payload: &[u8], target: &mut NavigationTarget) -> DispatchEffect {
    let Some(doc) = parse_json(payload, "target") else {
        return DispatchEffect::ParseError;
    };
    let Some((lat, lon)) = extract_coords(&doc) else {
        warn!("target write missing lat/lon (or latitude/longitude) fields");
        return DispatchEffect::ParseError;
    };
    if !coords_in_range(lat, lon) {
        warn!("target coordinates out of range: {:.6}, {:.6}", lat, lon);
        return DispatchEffect::ParseError;
    }
    let label = doc
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_TARGET_LABEL);
    target.set(lat, lon, label);
    info!(
        "target set to '{}' at {:.6}, {:.6}",
        target.label, target.lat, target.lon
    );
    DispatchEffect::TargetUpdated
}

fn handle_locations_modify(payload: &[u8], locations: &mut Vec<SavedLocation>) -> DispatchEffect {
    let Some(doc) = parse_json(payload, "locations-modify") else {
        return DispatchEffect::ParseError;
    };
    let Some(action) = doc.get("action").and_then(Value::as_str) else {
        warn!("locations-modify write missing 'action' field");
        return DispatchEffect::ParseError;
    };

    match action {
        "add" => handle_add(&doc, locations),
        "edit" => handle_edit(&doc, locations),
        "delete" => handle_delete(&doc, locations),
        "resetStats" => {
            info!("stats reset requested by client");
            DispatchEffect::StatsReset
        }
        other => {
            // Well-formed message from (probably) a newer app version, not
            // corruption: ignore without touching the parse-error counter.
            warn!("ignoring unknown locations action '{}'", other);
            DispatchEffect::NoOp
        }
    }
}

fn handle_add(doc: &Value, locations: &mut Vec<SavedLocation>) -> DispatchEffect {
    // Both `data` and `location` envelopes are in the wild.
    let Some(data) = doc.get("data").or_else(|| doc.get("location")) else {
        warn!("add action missing 'data' or 'location' object");
        return DispatchEffect::ParseError;
    };
    let Some(name) = data.get("name").and_then(Value::as_str) else {
        warn!("add action missing location name");
        return DispatchEffect::ParseError;
    };
    let Some((lat, lon)) = extract_coords(data) else {
        warn!("add action missing coordinate fields");
        return DispatchEffect::ParseError;
    };
    if !coords_in_range(lat, lon) {
        warn!("add action coordinates out of range: {:.6}, {:.6}", lat, lon);
        return DispatchEffect::ParseError;
    }
    let loc = SavedLocation::new(name, lat, lon);
    info!(
        "adding saved location '{}' at {:.6}, {:.6} (index {})",
        loc.name,
        loc.lat,
        loc.lon,
        locations.len()
    );
    locations.push(loc);
    DispatchEffect::LocationsChanged
}

fn handle_edit(doc: &Value, locations: &mut [SavedLocation]) -> DispatchEffect {
    let Some(index) = doc.get("index").and_then(Value::as_i64) else {
        warn!("edit action missing 'index' field");
        return DispatchEffect::ParseError;
    };
    let Some(entry) = usize::try_from(index).ok().and_then(|i| locations.get_mut(i)) else {
        // The client may be racing a stale list snapshot; benign, not an error.
        warn!("edit action with invalid index {} ignored", index);
        return DispatchEffect::NoOp;
    };
    let Some(name) = doc
        .get("data")
        .and_then(|data| data.get("name"))
        .and_then(Value::as_str)
    else {
        warn!("edit action missing 'data.name' field");
        return DispatchEffect::ParseError;
    };
    let data = &doc["data"];
    let old_name = entry.name.clone();
    *entry = SavedLocation::new(name, entry.lat, entry.lon);
    if let Some(lat) = data.get("lat").and_then(Value::as_f64) {
        entry.lat = lat;
    }
    if let Some(lon) = data.get("lon").and_then(Value::as_f64) {
        entry.lon = lon;
    }
    info!(
        "edited saved location {} '{}' -> '{}' ({:.6}, {:.6})",
        index, old_name, entry.name, entry.lat, entry.lon
    );
    DispatchEffect::LocationsChanged
}

fn handle_delete(doc: &Value, locations: &mut Vec<SavedLocation>) -> DispatchEffect {
    let Some(index) = doc.get("index").and_then(Value::as_i64) else {
        warn!("delete action missing 'index' field");
        return DispatchEffect::ParseError;
    };
    let valid = usize::try_from(index)
        .ok()
        .filter(|&i| i < locations.len());
    let Some(i) = valid else {
        warn!("delete action with invalid index {} ignored", index);
        return DispatchEffect::NoOp;
    };
    // Removal shifts every later index down; the client refetches after this.
    let removed = locations.remove(i);
    info!(
        "deleted saved location {} '{}' ({:.6}, {:.6})",
        i, removed.name, removed.lat, removed.lon
    );
    DispatchEffect::LocationsChanged
}

/// Decodes the compact 12-byte position frame. Returns `None` for anything
/// that is not a well-formed, in-range frame.
pub fn decode_position_frame(frame: &[u8]) -> Option<(f64, f64)> {
    if frame.len() != POSITION_FRAME_LEN || frame[0] != POSITION_FRAME_MAGIC {
        return None;
    }
    let lat_e7 = i32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
    let lon_e7 = i32::from_le_bytes([frame[5], frame[6], frame[7], frame[8]]);
    let accuracy_x100 = u16::from_le_bytes([frame[9], frame[10]]);
    let flags = frame[11];
    debug!(
        "binary position frame: accuracy x100 = {}, flags = {:#04x} (reserved)",
        accuracy_x100, flags
    );
    let lat = f64::from(lat_e7) / 1e7;
    let lon = f64::from(lon_e7) / 1e7;
    if coords_in_range(lat, lon) {
        Some((lat, lon))
    } else {
        None
    }
}

fn handle_position(payload: &[u8], position: &mut BlePosition, now_ms: u32) -> DispatchEffect {
    // A payload shaped like the binary frame is decoded as one and never
    // falls through to the JSON path.
    if payload.len() == POSITION_FRAME_LEN && payload[0] == POSITION_FRAME_MAGIC {
        return match decode_position_frame(payload) {
            Some((lat, lon)) => {
                position.update(lat, lon, now_ms);
                debug!("binary position update: {:.7}, {:.7}", lat, lon);
                DispatchEffect::PositionUpdated { binary: true }
            }
            None => {
                warn!("binary position frame with out-of-range coordinates dropped");
                DispatchEffect::ParseError
            }
        };
    }

    let Some(doc) = parse_json(payload, "position") else {
        return DispatchEffect::ParseError;
    };
    let Some((lat, lon)) = extract_coords(&doc) else {
        warn!("position write missing coordinate fields");
        return DispatchEffect::ParseError;
    };
    if !coords_in_range(lat, lon) {
        warn!("position coordinates out of range: {:.6}, {:.6}", lat, lon);
        return DispatchEffect::ParseError;
    }
    position.update(lat, lon, now_ms);
    debug!("JSON position update: {:.6}, {:.6}", lat, lon);
    DispatchEffect::PositionUpdated { binary: false }
}
