//! The BLE navigation service core: owns the rings, navigation state, health
//! counters and lifecycle, and sequences all of it from a single `tick` that
//! the firmware main loop calls every 50 ms.
//!
//! The radio glue stays thin on purpose. Callbacks only frame bytes and call
//! `on_write`/`on_connect`/`on_disconnect`; everything that parses, mutates
//! state, persists or serializes runs inside `tick`, in main-loop context.

use log::{debug, error, info, warn};

use crate::config::{CONSISTENCY_CHECK_INTERVAL_MS, HEARTBEAT_INTERVAL_MS};
use crate::dispatch::{dispatch, DispatchEffect};
use crate::lifecycle::{ConnectionLifecycle, Popup};
use crate::nav::{NavState, PositionValidity};
use crate::publish::{
    locations_snapshot_json, ready_message, ready_payload, target_message, target_payload,
    ChunkingCursor,
};
use crate::ring::{InboundKind, InboundMessage, OutboundMessage, RingBuffer};
use crate::stats::HealthCounters;
use crate::storage::LocationStore;

use crate::config::{INBOUND_RING_SLOTS, OUTBOUND_RING_SLOTS};

/// What one tick asks the surrounding firmware to do. The core never touches
/// the radio or the display itself.
#[derive(Debug, Default)]
pub struct TickActions {
    /// At most one notification to send this tick.
    pub notify: Option<OutboundMessage>,
    /// Issue a start-advertising call (idempotent on the controller side).
    pub restart_advertising: bool,
    /// Status banner for the display task.
    pub popup: Option<Popup>,
}

pub struct CompassBleService {
    inbound: RingBuffer<InboundMessage, INBOUND_RING_SLOTS>,
    outbound: RingBuffer<OutboundMessage, OUTBOUND_RING_SLOTS>,
    nav: NavState,
    stats: HealthCounters,
    lifecycle: ConnectionLifecycle,
    cursor: ChunkingCursor,
    publish_target_pending: bool,
    publish_ready_pending: bool,
    needs_persistence: bool,
    last_heartbeat_ms: u32,
    last_consistency_check_ms: u32,
}

impl Default for CompassBleService {
    fn default() -> Self {
        Self::new()
    }
}

impl CompassBleService {
    pub fn new() -> Self {
        Self {
            inbound: RingBuffer::new(),
            outbound: RingBuffer::new(),
            nav: NavState::default(),
            stats: HealthCounters::default(),
            lifecycle: ConnectionLifecycle::new(),
            cursor: ChunkingCursor::default(),
            publish_target_pending: false,
            publish_ready_pending: false,
            needs_persistence: false,
            last_heartbeat_ms: 0,
            last_consistency_check_ms: 0,
        }
    }

    /// Loads the persisted saved-locations list, typically once at startup
    /// before the GATT service goes up. Returns the number of entries.
    pub fn load_locations(&mut self, store: &mut dyn LocationStore) -> anyhow::Result<usize> {
        self.nav.locations = store.load()?;
        info!("loaded {} saved locations", self.nav.locations.len());
        Ok(self.nav.locations.len())
    }

    /// Called from the stack's write callback with the raw payload. Only
    /// frames and enqueues; decoding waits for the next tick.
    pub fn on_write(&mut self, kind: InboundKind, payload: &[u8]) {
        let Some(msg) = InboundMessage::new(kind, payload) else {
            warn!(
                "dropping {:?} write with invalid length {}",
                kind,
                payload.len()
            );
            self.stats.parse_errors += 1;
            return;
        };
        if !self.inbound.enqueue(msg) {
            warn!("inbound ring full, dropping {:?} write", kind);
            self.stats.queue_overflows += 1;
        }
    }

    pub fn on_connect(&mut self, now_ms: u32) {
        self.lifecycle.on_connect(now_ms);
        // A fresh client gets the current target and a Ready heartbeat
        // without having to ask.
        self.publish_target_pending = true;
        self.publish_ready_pending = true;
    }

    /// Returns true when advertising should be restarted right away.
    pub fn on_disconnect(&mut self) -> bool {
        self.cursor.clear();
        self.lifecycle.on_disconnect()
    }

    pub fn on_advertising_started(&mut self) {
        self.lifecycle.on_advertising_started();
    }

    /// Called once the GATT service is live; anchors the periodic timers and
    /// queues the initial Ready publish.
    pub fn on_service_started(&mut self, now_ms: u32) {
        self.last_heartbeat_ms = now_ms;
        self.last_consistency_check_ms = now_ms;
        self.publish_ready_pending = true;
        info!("navigation service started");
    }

    /// Device-side target selection from the saved-locations list.
    pub fn select_target(&mut self, index: usize) -> bool {
        let Some(loc) = self.nav.locations.get(index) else {
            warn!("target selection with invalid index {} ignored", index);
            return false;
        };
        let (name, lat, lon) = (loc.name.clone(), loc.lat, loc.lon);
        self.nav.target.set(lat, lon, &name);
        self.publish_target_pending = true;
        true
    }

    /// The radio reported a failed notification.
    pub fn note_notify_failure(&mut self) {
        self.stats.notify_errors += 1;
    }

    pub fn is_connected(&self) -> bool {
        self.lifecycle.is_connected()
    }

    pub fn stats(&self) -> &HealthCounters {
        &self.stats
    }

    pub fn target(&self) -> &crate::nav::NavigationTarget {
        &self.nav.target
    }

    pub fn locations(&self) -> &[crate::nav::SavedLocation] {
        &self.nav.locations
    }

    /// Usable position for the compass, `None` once the cache expired.
    pub fn position(&self, now_ms: u32) -> Option<(f64, f64)> {
        self.nav.position.coords(now_ms)
    }

    // Snapshots served on direct GATT reads.

    pub fn target_snapshot(&self) -> String {
        target_payload(&self.nav)
    }

    pub fn ready_snapshot(&self) -> String {
        ready_payload(&self.nav, &self.stats)
    }

    pub fn locations_snapshot(&self) -> String {
        locations_snapshot_json(&self.nav.locations)
    }

    /// One pass of the service state machine. Steps run in a fixed order so
    /// that a mutation observed in this tick is published no earlier than the
    /// next one, persistence happens before the list is re-sent, and at most
    /// one notification leaves per tick.
    pub fn tick(&mut self, now_ms: u32, store: &mut dyn LocationStore) -> TickActions {
        let mut actions = TickActions::default();

        // 1. Target publish deferred from an earlier tick.
        if self.publish_target_pending {
            self.publish_target_pending = false;
            if self.lifecycle.is_connected() {
                self.enqueue_outbound(target_message(&self.nav));
            }
        }

        // 2. Drain and dispatch inbound writes.
        while let Some(msg) = self.inbound.dequeue() {
            let effect = dispatch(&msg, &mut self.nav, now_ms);
            self.apply(effect);
        }

        // 3. Position expiry and periodic consistency warnings.
        if self.nav.position.expire_if_due(now_ms) {
            info!("BLE position expired, treating as absent");
        }
        if now_ms.wrapping_sub(self.last_consistency_check_ms) >= CONSISTENCY_CHECK_INTERVAL_MS {
            self.last_consistency_check_ms = now_ms;
            self.consistency_check(now_ms);
        }

        // 4. Deferred persistence, then restart the chunked list transfer so
        // clients always see the post-save list.
        if self.needs_persistence {
            self.needs_persistence = false;
            if let Err(e) = store.save(&self.nav.locations) {
                error!("failed to persist saved locations: {:#}", e);
            }
            self.cursor.restart();
        }

        // 5. Advertising watchdog.
        if self.lifecycle.poll_watchdog(now_ms) {
            debug!("advertising watchdog requesting a start");
            actions.restart_advertising = true;
        }

        // 6. Ready heartbeat.
        let heartbeat_due = self.lifecycle.is_connected()
            && now_ms.wrapping_sub(self.last_heartbeat_ms) >= HEARTBEAT_INTERVAL_MS;
        if self.publish_ready_pending || heartbeat_due {
            self.publish_ready_pending = false;
            self.last_heartbeat_ms = now_ms;
            self.stats.heartbeat_count += 1;
            self.enqueue_outbound(ready_message(&self.nav, &self.stats));
        }

        // 7. At most one notification per tick.
        actions.notify = self.outbound.dequeue();

        // 8. Stage the next locations chunk for the following tick.
        if let Some(chunk) = self.cursor.next_page(&self.nav.locations) {
            self.enqueue_outbound(chunk);
        }

        actions.popup = self.lifecycle.take_popup();
        actions
    }

    fn apply(&mut self, effect: DispatchEffect) {
        match effect {
            DispatchEffect::TargetUpdated => self.publish_target_pending = true,
            DispatchEffect::LocationsChanged => self.needs_persistence = true,
            DispatchEffect::StatsReset => {
                self.stats.reset();
                self.publish_ready_pending = true;
            }
            DispatchEffect::PositionUpdated { binary: true } => {
                self.stats.binary_position_packets += 1;
            }
            DispatchEffect::PositionUpdated { binary: false } => {
                self.stats.json_position_packets += 1;
            }
            DispatchEffect::ParseError => self.stats.parse_errors += 1,
            DispatchEffect::NoOp => {}
        }
    }

    fn enqueue_outbound(&mut self, msg: OutboundMessage) {
        if !self.outbound.enqueue(msg) {
            warn!("outbound ring full, dropping notification");
            self.stats.queue_overflows += 1;
        }
    }

    fn consistency_check(&self, now_ms: u32) {
        let target = &self.nav.target;
        if target.is_set && target.lat == 0.0 && target.lon == 0.0 {
            warn!("target flagged set but coordinates are zeroed");
        }
        if !target.is_set && (target.lat != 0.0 || target.lon != 0.0) {
            warn!("target flagged clear but coordinates are non-zero");
        }
        if self.nav.target.is_set {
            match self.nav.position.validity(now_ms) {
                PositionValidity::Expired => {
                    warn!("target '{}' set but no usable position", self.nav.target.label)
                }
                PositionValidity::Stale => {
                    warn!("position feeding target '{}' is stale", self.nav.target.label)
                }
                PositionValidity::Fresh => {}
            }
        }
        debug!(
            "health: hb={} rx={} qov={} nt={} pos(json/bin)={}/{}",
            self.stats.heartbeat_count,
            self.stats.parse_errors,
            self.stats.queue_overflows,
            self.stats.notify_errors,
            self.stats.json_position_packets,
            self.stats.binary_position_packets,
        );
    }
}
