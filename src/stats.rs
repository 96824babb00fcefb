//! Health counters surfaced through Ready/Status telemetry.

/// Monotonic counters incremented at the point of detection. The companion
/// app polls these via the Ready characteristic; nothing on the device reacts
/// to them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HealthCounters {
    /// Ready publishes since boot. Survives a stats reset so the client can
    /// still detect liveness across one.
    pub heartbeat_count: u32,
    /// Malformed or out-of-range inbound messages dropped.
    pub parse_errors: u32,
    /// Messages dropped because a ring buffer was full.
    pub queue_overflows: u32,
    /// Radio notify attempts that failed.
    pub notify_errors: u32,
    /// Accepted JSON position updates.
    pub json_position_packets: u32,
    /// Accepted binary-frame position updates.
    pub binary_position_packets: u32,
}

impl HealthCounters {
    /// Zeroes everything except the heartbeat counter.
    pub fn reset(&mut self) {
        let heartbeat_count = self.heartbeat_count;
        *self = Self {
            heartbeat_count,
            ..Self::default()
        };
    }
}
