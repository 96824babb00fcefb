//! Outbound payload builders: target echo, Ready/Status telemetry and the
//! chunked saved-locations transfer.
//!
//! Everything here produces a finished [`OutboundMessage`] or `None`; actual
//! notification happens later, when the main loop drains the outbound ring.
//! Serialization failures degrade to a minimal fallback payload instead of
//! silently dropping the publish.

use log::warn;
use serde::Serialize;

use crate::config::{FIRMWARE_VERSION, LOCATIONS_PAGE_SIZE, MAX_OUTBOUND_PAYLOAD};
use crate::nav::{NavState, SavedLocation};
use crate::ring::{NotifyChannel, OutboundMessage};
use crate::stats::HealthCounters;

#[derive(Serialize)]
struct TargetEnvelope<'a> {
    #[serde(rename = "hasTarget")]
    has_target: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lon: Option<f64>,
}

#[derive(Serialize)]
struct ErrorCounts {
    rx: u32,
    qov: u32,
    nt: u32,
}

#[derive(Serialize)]
struct ReadyEnvelope {
    ready: bool,
    #[serde(rename = "hasTarget")]
    has_target: bool,
    fw: &'static str,
    hb: u32,
    err: ErrorCounts,
}

#[derive(Serialize)]
struct ChunkEnvelope<'a> {
    items: &'a [SavedLocation],
    chunk: u16,
    total: u16,
    #[serde(rename = "final")]
    is_final: bool,
}

/// Wraps serialized JSON in an [`OutboundMessage`], falling back to a caller
/// supplied minimal payload when the full one exceeds the notification cap.
/// Fallbacks are short constants that always fit.
fn bounded(channel: NotifyChannel, payload: &str, fallback: &str) -> OutboundMessage {
    if let Some(msg) = OutboundMessage::new(channel, payload.as_bytes()) {
        return msg;
    }
    warn!(
        "{:?} payload of {} bytes exceeds notify cap, sending fallback",
        channel,
        payload.len()
    );
    OutboundMessage::new(channel, fallback.as_bytes()).expect("fallback payload fits")
}

/// Serializes the current target for the Target characteristic. Clients get
/// `{"hasTarget":false}` until a target has been set.
pub fn target_payload(nav: &NavState) -> String {
    let envelope = if nav.target.is_set {
        TargetEnvelope {
            has_target: true,
            name: Some(&nav.target.label),
            lat: Some(nav.target.lat),
            lon: Some(nav.target.lon),
        }
    } else {
        TargetEnvelope {
            has_target: false,
            name: None,
            lat: None,
            lon: None,
        }
    };
    serde_json::to_string(&envelope).unwrap_or_else(|e| {
        warn!("target serialization failed: {}", e);
        r#"{"hasTarget":false}"#.to_string()
    })
}

pub fn target_message(nav: &NavState) -> OutboundMessage {
    bounded(
        NotifyChannel::Target,
        &target_payload(nav),
        r#"{"hasTarget":false}"#,
    )
}

/// Serializes Ready/Status telemetry: liveness, firmware version, heartbeat
/// count and the health counters.
pub fn ready_payload(nav: &NavState, stats: &HealthCounters) -> String {
    let envelope = ReadyEnvelope {
        ready: true,
        has_target: nav.target.is_set,
        fw: FIRMWARE_VERSION,
        hb: stats.heartbeat_count,
        err: ErrorCounts {
            rx: stats.parse_errors,
            qov: stats.queue_overflows,
            nt: stats.notify_errors,
        },
    };
    serde_json::to_string(&envelope).unwrap_or_else(|e| {
        warn!("ready serialization failed: {}", e);
        r#"{"ready":true}"#.to_string()
    })
}

pub fn ready_message(nav: &NavState, stats: &HealthCounters) -> OutboundMessage {
    bounded(
        NotifyChannel::Ready,
        &ready_payload(nav, stats),
        r#"{"ready":true}"#,
    )
}

/// Legacy whole-list snapshot served on direct reads of the locations-list
/// characteristic: a bare JSON array of the first page, no chunk envelope.
pub fn locations_snapshot_json(locations: &[SavedLocation]) -> String {
    let first_page = &locations[..locations.len().min(LOCATIONS_PAGE_SIZE)];
    serde_json::to_string(first_page).unwrap_or_else(|e| {
        warn!("locations snapshot serialization failed: {}", e);
        "[]".to_string()
    })
}

/// Progress of an in-flight chunked locations transfer. One chunk is emitted
/// per main-loop tick until `final:true` has gone out.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChunkingCursor {
    in_progress: bool,
    next_index: usize,
    chunk_seq: u16,
}

impl ChunkingCursor {
    /// (Re)starts the transfer from the beginning. Any transfer already in
    /// flight is abandoned; the client keys on `final`, not on chunk counts.
    pub fn restart(&mut self) {
        self.in_progress = true;
        self.next_index = 0;
        self.chunk_seq = 0;
    }

    /// Abandons any in-flight transfer, e.g. on disconnect.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    /// Builds the next chunk, or `None` when no transfer is in flight.
    /// An empty list still yields exactly one `{"items":[],...,"final":true}`
    /// chunk so the client can tell "empty" from "never answered".
    pub fn next_page(&mut self, locations: &[SavedLocation]) -> Option<OutboundMessage> {
        if !self.in_progress {
            return None;
        }
        // Chunk numbering assumes full pages; a shrunk page pushes the real
        // count past `total`, which the client must tolerate (final wins).
        let total = (locations.len().div_ceil(LOCATIONS_PAGE_SIZE)).max(1) as u16;
        let start = self.next_index.min(locations.len());
        let mut count = LOCATIONS_PAGE_SIZE.min(locations.len() - start);

        let json = loop {
            let envelope = ChunkEnvelope {
                items: &locations[start..start + count],
                chunk: self.chunk_seq,
                total,
                is_final: start + count >= locations.len(),
            };
            let json = match serde_json::to_string(&envelope) {
                Ok(json) => json,
                Err(e) => {
                    warn!("locations chunk serialization failed: {}", e);
                    self.in_progress = false;
                    return None;
                }
            };
            if json.len() <= MAX_OUTBOUND_PAYLOAD || count <= 1 {
                break json;
            }
            count -= 1;
        };

        self.next_index = start + count;
        self.chunk_seq += 1;
        if self.next_index >= locations.len() {
            self.in_progress = false;
        }
        OutboundMessage::new(NotifyChannel::LocationsList, json.as_bytes()).or_else(|| {
            // Name-length caps keep single-entry chunks under the payload
            // limit, so this only triggers on a logic regression.
            warn!("locations chunk still oversize after shrinking, transfer aborted");
            self.in_progress = false;
            None
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_LOCATION_NAME_LEN;

    fn nav_with_target() -> NavState {
        let mut nav = NavState::default();
        nav.target.set(48.8584, 2.2945, "Eiffel");
        nav
    }

    #[test]
    fn target_payload_with_target_set() {
        let nav = nav_with_target();
        assert_eq!(
            target_payload(&nav),
            r#"{"hasTarget":true,"name":"Eiffel","lat":48.8584,"lon":2.2945}"#
        );
    }

    #[test]
    fn target_payload_without_target_omits_fields() {
        let nav = NavState::default();
        assert_eq!(target_payload(&nav), r#"{"hasTarget":false}"#);
    }

    #[test]
    fn ready_payload_carries_counters() {
        let nav = nav_with_target();
        let stats = HealthCounters {
            heartbeat_count: 12,
            parse_errors: 3,
            queue_overflows: 1,
            notify_errors: 2,
            ..Default::default()
        };
        let json: serde_json::Value =
            serde_json::from_str(&ready_payload(&nav, &stats)).unwrap();
        assert_eq!(json["ready"], true);
        assert_eq!(json["hasTarget"], true);
        assert_eq!(json["fw"], FIRMWARE_VERSION);
        assert_eq!(json["hb"], 12);
        assert_eq!(json["err"]["rx"], 3);
        assert_eq!(json["err"]["qov"], 1);
        assert_eq!(json["err"]["nt"], 2);
    }

    #[test]
    fn ready_message_fits_notify_cap() {
        let nav = nav_with_target();
        let stats = HealthCounters {
            heartbeat_count: u32::MAX,
            parse_errors: u32::MAX,
            queue_overflows: u32::MAX,
            notify_errors: u32::MAX,
            ..Default::default()
        };
        let msg = ready_message(&nav, &stats);
        assert!(msg.payload().len() <= MAX_OUTBOUND_PAYLOAD);
        assert_eq!(msg.channel(), NotifyChannel::Ready);
    }

    fn locations(n: usize) -> Vec<SavedLocation> {
        (0..n)
            .map(|i| SavedLocation::new(&format!("loc{}", i), i as f64, -(i as f64)))
            .collect()
    }

    fn drain_chunks(
        cursor: &mut ChunkingCursor,
        list: &[SavedLocation],
    ) -> Vec<serde_json::Value> {
        let mut chunks = Vec::new();
        while let Some(msg) = cursor.next_page(list) {
            assert_eq!(msg.channel(), NotifyChannel::LocationsList);
            assert!(msg.payload().len() <= MAX_OUTBOUND_PAYLOAD);
            chunks.push(serde_json::from_slice(msg.payload()).unwrap());
        }
        chunks
    }

    #[test]
    fn chunking_pages_three_at_a_time() {
        let list = locations(7);
        let mut cursor = ChunkingCursor::default();
        cursor.restart();
        let chunks = drain_chunks(&mut cursor, &list);

        assert_eq!(chunks.len(), 3);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk["chunk"], i as u64);
            assert_eq!(chunk["total"], 3);
        }
        assert_eq!(chunks[0]["items"].as_array().unwrap().len(), 3);
        assert_eq!(chunks[1]["items"].as_array().unwrap().len(), 3);
        assert_eq!(chunks[2]["items"].as_array().unwrap().len(), 1);
        assert_eq!(chunks[0]["final"], false);
        assert_eq!(chunks[2]["final"], true);
        assert_eq!(chunks[2]["items"][0]["name"], "loc6");
        assert!(!cursor.is_in_progress());
    }

    #[test]
    fn empty_list_emits_single_final_chunk() {
        let mut cursor = ChunkingCursor::default();
        cursor.restart();
        let chunks = drain_chunks(&mut cursor, &[]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0]["items"].as_array().unwrap().len(), 0);
        assert_eq!(chunks[0]["chunk"], 0);
        assert_eq!(chunks[0]["total"], 1);
        assert_eq!(chunks[0]["final"], true);
    }

    #[test]
    fn oversize_page_shrinks_below_page_size() {
        // Max-length names make a 3-entry page exceed the payload cap, so
        // pages shrink and the transfer takes more chunks than `total` says.
        let long = "n".repeat(MAX_LOCATION_NAME_LEN);
        let list: Vec<SavedLocation> = (0..6)
            .map(|i| SavedLocation::new(&long, i as f64 + 0.123456, 100.0 + i as f64))
            .collect();
        let mut cursor = ChunkingCursor::default();
        cursor.restart();
        let chunks = drain_chunks(&mut cursor, &list);

        let mut seen = 0;
        for chunk in &chunks {
            let items = chunk["items"].as_array().unwrap();
            assert!(!items.is_empty());
            seen += items.len();
        }
        assert_eq!(seen, 6);
        assert_eq!(chunks.last().unwrap()["final"], true);
        for chunk in &chunks[..chunks.len() - 1] {
            assert_eq!(chunk["final"], false);
        }
    }

    #[test]
    fn restart_abandons_in_flight_transfer() {
        let list = locations(5);
        let mut cursor = ChunkingCursor::default();
        cursor.restart();
        cursor.next_page(&list);
        cursor.restart();
        let chunks = drain_chunks(&mut cursor, &list);
        assert_eq!(chunks[0]["chunk"], 0);
        assert_eq!(chunks[0]["items"][0]["name"], "loc0");
    }

    #[test]
    fn no_chunk_without_restart() {
        let list = locations(2);
        let mut cursor = ChunkingCursor::default();
        assert!(cursor.next_page(&list).is_none());
    }

    #[test]
    fn snapshot_is_first_page_only() {
        let list = locations(5);
        let json: serde_json::Value =
            serde_json::from_str(&locations_snapshot_json(&list)).unwrap();
        assert_eq!(json.as_array().unwrap().len(), LOCATIONS_PAGE_SIZE);
        assert_eq!(locations_snapshot_json(&[]), "[]");
    }
}
