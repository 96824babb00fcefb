// End-to-end exercise of the BLE service core against an in-memory store,
// driving it the way the firmware main loop does: writes land between ticks,
// ticks run on a 50 ms cadence, and every outbound message is observed.

use serde_json::Value;

use supercompass::config::{LOOP_INTERVAL_MS, POSITION_FRAME_LEN, POSITION_FRAME_MAGIC};
use supercompass::service::CompassBleService;
use supercompass::storage::{LocationStore, MemoryStore};
use supercompass::{InboundKind, NotifyChannel, SavedLocation};

struct Harness {
    service: CompassBleService,
    store: MemoryStore,
    now_ms: u32,
}

impl Harness {
    fn new() -> Self {
        let mut service = CompassBleService::new();
        service.on_service_started(0);
        Self {
            service,
            store: MemoryStore::default(),
            now_ms: 0,
        }
    }

    fn connected() -> Self {
        let mut h = Self::new();
        h.service.on_connect(h.now_ms);
        // Drain the connect-time target and ready publishes.
        h.run_ticks(4);
        h
    }

    fn tick(&mut self) -> Option<(NotifyChannel, Value)> {
        self.now_ms += LOOP_INTERVAL_MS;
        let actions = self.service.tick(self.now_ms, &mut self.store);
        actions.notify.map(|msg| {
            (
                msg.channel(),
                serde_json::from_slice(msg.payload()).expect("outbound payloads are JSON"),
            )
        })
    }

    fn run_ticks(&mut self, n: usize) -> Vec<(NotifyChannel, Value)> {
        (0..n).filter_map(|_| self.tick()).collect()
    }

    fn write(&mut self, kind: InboundKind, payload: &[u8]) {
        self.service.on_write(kind, payload);
    }
}

fn position_frame(lat: f64, lon: f64, accuracy_x100: u16) -> [u8; POSITION_FRAME_LEN] {
    let mut frame = [0u8; POSITION_FRAME_LEN];
    frame[0] = POSITION_FRAME_MAGIC;
    frame[1..5].copy_from_slice(&(((lat * 1e7).round()) as i32).to_le_bytes());
    frame[5..9].copy_from_slice(&(((lon * 1e7).round()) as i32).to_le_bytes());
    frame[9..11].copy_from_slice(&accuracy_x100.to_le_bytes());
    frame
}

#[test]
fn target_write_round_trips_to_notification() {
    let mut h = Harness::connected();
    h.write(
        InboundKind::Target,
        br#"{"lat":48.8584,"lon":2.2945,"name":"Eiffel"}"#,
    );

    let out = h.run_ticks(3);
    let (channel, doc) = &out[0];
    assert_eq!(*channel, NotifyChannel::Target);
    assert_eq!(doc["hasTarget"], true);
    assert_eq!(doc["name"], "Eiffel");
    assert_eq!(doc["lat"], 48.8584);
    assert_eq!(doc["lon"], 2.2945);
}

#[test]
fn location_crud_session() {
    let mut h = Harness::connected();

    for (name, lat) in [("Home", 51.43), ("Work", 52.09), ("Cabin", 63.43)] {
        let json = format!(
            r#"{{"action":"add","data":{{"name":"{}","lat":{},"lon":5.5}}}}"#,
            name, lat
        );
        h.write(InboundKind::LocationsModify, json.as_bytes());
        h.run_ticks(3);
    }
    assert_eq!(h.store.load().unwrap().len(), 3);

    // Delete the middle entry; later indices shift down.
    h.write(InboundKind::LocationsModify, br#"{"action":"delete","index":1}"#);
    h.run_ticks(1);
    let names: Vec<String> = h
        .store
        .load()
        .unwrap()
        .iter()
        .map(|l| l.name.clone())
        .collect();
    assert_eq!(names, ["Home", "Cabin"]);

    // Edit what is now index 1.
    h.write(
        InboundKind::LocationsModify,
        br#"{"action":"edit","index":1,"data":{"name":"Hut","lat":63.5}}"#,
    );
    let out = h.run_ticks(3);
    let (channel, doc) = out.last().unwrap();
    assert_eq!(*channel, NotifyChannel::LocationsList);
    let items = doc["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[1]["name"], "Hut");
    assert_eq!(items[1]["lat"], 63.5);
    assert_eq!(doc["final"], true);

    // Each mutation persisted exactly once.
    assert_eq!(h.store.save_count(), 5);
}

#[test]
fn chunked_list_transfer_covers_all_entries() {
    let mut h = Harness::connected();
    for i in 0..8 {
        let json = format!(
            r#"{{"action":"add","data":{{"name":"wp{}","lat":{}.25,"lon":-{}.5}}}}"#,
            i, i, i
        );
        h.write(InboundKind::LocationsModify, json.as_bytes());
        h.run_ticks(2);
    }
    // Flush the chunks the add burst produced, then force one clean
    // transfer of the final list with a no-op rename.
    h.run_ticks(10);
    h.write(
        InboundKind::LocationsModify,
        br#"{"action":"edit","index":0,"data":{"name":"wp0"}}"#,
    );

    let chunks: Vec<Value> = h
        .run_ticks(10)
        .into_iter()
        .filter(|(channel, _)| *channel == NotifyChannel::LocationsList)
        .map(|(_, doc)| doc)
        .collect();
    let last = chunks.last().unwrap();
    assert_eq!(last["final"], true);
    let total_items: usize = chunks
        .iter()
        .map(|c| c["items"].as_array().unwrap().len())
        .sum();
    assert_eq!(total_items, 8);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk["chunk"], i as u64);
    }
}

#[test]
fn binary_position_accurate_to_a_millionth_of_a_degree() {
    let mut h = Harness::connected();
    let frame = position_frame(51.4392648, 5.478633, 250);
    h.write(InboundKind::Position, &frame);
    h.run_ticks(1);

    let (lat, lon) = h.service.position(h.now_ms).unwrap();
    assert!((lat - 51.4392648).abs() < 1e-6);
    assert!((lon - 5.478633).abs() < 1e-6);
    assert_eq!(h.service.stats().binary_position_packets, 1);
    assert_eq!(h.service.stats().json_position_packets, 0);
}

#[test]
fn position_goes_stale_then_expires() {
    let mut h = Harness::connected();
    h.write(InboundKind::Position, br#"{"latitude":51.44,"longitude":5.48}"#);
    h.run_ticks(1);
    let updated_at = h.now_ms;

    // Usable while fresh and while stale.
    assert!(h.service.position(updated_at + 29_000).is_some());
    assert!(h.service.position(updated_at + 45_000).is_some());
    // Gone after a minute.
    assert!(h.service.position(updated_at + 61_000).is_none());
}

#[test]
fn dual_key_spellings_accepted_everywhere() {
    let mut h = Harness::connected();
    h.write(InboundKind::Target, br#"{"latitude":10.5,"longitude":-20.25}"#);
    h.run_ticks(1);
    assert_eq!(h.service.target().lat, 10.5);
    assert_eq!(h.service.target().lon, -20.25);

    h.write(InboundKind::Position, br#"{"lat":1.0,"lon":2.0}"#);
    h.run_ticks(1);
    assert!(h.service.position(h.now_ms).is_some());
}

#[test]
fn malformed_traffic_is_counted_not_fatal() {
    let mut h = Harness::connected();
    h.write(InboundKind::Target, b"\xff\xfe not json");
    h.write(InboundKind::Target, br#"{"lat":95.0,"lon":0.0}"#);
    h.write(InboundKind::Position, br#"{"nothing":"here"}"#);
    h.run_ticks(2);
    assert_eq!(h.service.stats().parse_errors, 3);
    assert!(!h.service.target().is_set);

    // Good traffic still flows afterwards.
    h.write(InboundKind::Target, br#"{"lat":1.0,"lon":2.0}"#);
    h.run_ticks(1);
    assert!(h.service.target().is_set);
}

#[test]
fn stats_reset_zeroes_errors_but_not_heartbeats() {
    let mut h = Harness::connected();
    h.write(InboundKind::Target, b"garbage");
    h.run_ticks(1);
    assert_eq!(h.service.stats().parse_errors, 1);
    let heartbeats = h.service.stats().heartbeat_count;
    assert!(heartbeats > 0);

    h.write(InboundKind::LocationsModify, br#"{"action":"resetStats"}"#);
    let out = h.run_ticks(2);
    let ready = out
        .iter()
        .find(|(channel, _)| *channel == NotifyChannel::Ready)
        .map(|(_, doc)| doc)
        .expect("reset publishes a Ready frame");
    assert_eq!(ready["err"]["rx"], 0);
    assert_eq!(ready["hb"], u64::from(heartbeats) + 1);
}

#[test]
fn persisted_locations_survive_service_restart() {
    let mut store = MemoryStore::default();
    {
        let mut service = CompassBleService::new();
        service.on_service_started(0);
        service.on_write(
            InboundKind::LocationsModify,
            br#"{"action":"add","data":{"name":"Base","lat":47.5,"lon":8.5}}"#,
        );
        service.tick(50, &mut store);
    }

    let mut service = CompassBleService::new();
    assert_eq!(service.load_locations(&mut store).unwrap(), 1);
    assert!(service.select_target(0));
    assert_eq!(service.target().label, "Base");
}

#[test]
fn heartbeats_flow_only_while_connected() {
    let mut h = Harness::new();
    // Exactly one Ready at service start, then silence until a connect.
    let quiet = h.run_ticks(100);
    assert_eq!(quiet.len(), 1);
    assert_eq!(quiet[0].0, NotifyChannel::Ready);

    h.service.on_connect(h.now_ms);
    let mut ready_count = 0;
    for _ in 0..700 {
        if let Some((NotifyChannel::Ready, _)) = h.tick() {
            ready_count += 1;
        }
    }
    // Connect-time publish plus two 15-second heartbeats over 35 seconds.
    assert_eq!(ready_count, 3);
}

#[test]
fn ready_snapshot_matches_notification_schema() {
    let mut h = Harness::connected();
    let doc: Value = serde_json::from_str(&h.service.ready_snapshot()).unwrap();
    assert_eq!(doc["ready"], true);
    assert!(doc["fw"].is_string());
    assert!(doc["hb"].is_u64());
    assert!(doc["err"]["rx"].is_u64());
    assert!(doc["err"]["qov"].is_u64());
    assert!(doc["err"]["nt"].is_u64());
    let _ = h.run_ticks(1);
}

#[test]
fn loading_prepopulated_store_serves_snapshot() {
    let mut store = MemoryStore::new(vec![
        SavedLocation::new("A", 1.0, 2.0),
        SavedLocation::new("B", 3.0, 4.0),
    ]);
    let mut service = CompassBleService::new();
    service.load_locations(&mut store).unwrap();
    let doc: Value = serde_json::from_str(&service.locations_snapshot()).unwrap();
    assert_eq!(doc.as_array().unwrap().len(), 2);
    assert_eq!(doc[0]["name"], "A");
}
