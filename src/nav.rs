//! Shared navigation state: the selected target, the saved-locations list and
//! the phone-supplied position cache.

use serde::{Deserialize, Serialize};

use crate::config::{
    MAX_LOCATION_NAME_LEN, MAX_TARGET_LABEL_LEN, POSITION_EXPIRY_MS, POSITION_STALE_MS,
};

pub fn coords_in_range(lat: f64, lon: f64) -> bool {
    (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

/// Truncates to at most `max` bytes without splitting a UTF-8 character.
pub(crate) fn truncated(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// The coordinate pair the compass points at. Written by the inbound
/// dispatcher or the saved-locations selection UI, read by the publishers and
/// the rendering loop.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NavigationTarget {
    pub is_set: bool,
    pub lat: f64,
    pub lon: f64,
    pub label: String,
}

impl NavigationTarget {
    pub fn set(&mut self, lat: f64, lon: f64, label: &str) {
        self.is_set = true;
        self.lat = lat;
        self.lon = lon;
        self.label = truncated(label, MAX_TARGET_LABEL_LEN);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// One entry of the saved-locations list. The list index is the external
/// identifier used by edit/delete requests; deleting shifts later indices
/// down, so the companion app refetches the list after every mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavedLocation {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

impl SavedLocation {
    pub fn new(name: &str, lat: f64, lon: f64) -> Self {
        Self {
            name: truncated(name, MAX_LOCATION_NAME_LEN),
            lat,
            lon,
        }
    }
}

/// Freshness of the cached BLE position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PositionValidity {
    /// Updated within the last 30 s.
    Fresh,
    /// Between 30 s and 60 s old; still usable, worth a warning.
    Stale,
    /// Older than 60 s or never set; treated as absent.
    Expired,
}

/// Time-boxed cache of the position pushed by the companion app, used as a
/// GPS surrogate. Overwritten wholesale on each accepted update, never
/// partially.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlePosition {
    is_set: bool,
    lat: f64,
    lon: f64,
    timestamp_ms: u32,
}

impl BlePosition {
    pub fn update(&mut self, lat: f64, lon: f64, now_ms: u32) {
        *self = Self {
            is_set: true,
            lat,
            lon,
            timestamp_ms: now_ms,
        };
    }

    pub fn is_set(&self) -> bool {
        self.is_set
    }

    pub fn timestamp_ms(&self) -> u32 {
        self.timestamp_ms
    }

    pub fn validity(&self, now_ms: u32) -> PositionValidity {
        if !self.is_set {
            return PositionValidity::Expired;
        }
        let age = now_ms.wrapping_sub(self.timestamp_ms);
        if age > POSITION_EXPIRY_MS {
            PositionValidity::Expired
        } else if age > POSITION_STALE_MS {
            PositionValidity::Stale
        } else {
            PositionValidity::Fresh
        }
    }

    /// Coordinates while the cache is fresh or stale, `None` once expired.
    pub fn coords(&self, now_ms: u32) -> Option<(f64, f64)> {
        match self.validity(now_ms) {
            PositionValidity::Expired => None,
            _ => Some((self.lat, self.lon)),
        }
    }

    /// Polled hard expiry; returns true when the cache was just invalidated.
    pub fn expire_if_due(&mut self, now_ms: u32) -> bool {
        if self.is_set && self.validity(now_ms) == PositionValidity::Expired {
            self.is_set = false;
            true
        } else {
            false
        }
    }
}

/// The cross-cutting data the dispatcher mutates and the publishers read.
#[derive(Clone, Debug, Default)]
pub struct NavState {
    pub target: NavigationTarget,
    pub locations: Vec<SavedLocation>,
    pub position: BlePosition,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinate_range_boundaries() {
        assert!(coords_in_range(90.0, 180.0));
        assert!(coords_in_range(-90.0, -180.0));
        assert!(coords_in_range(0.0, 0.0));
        assert!(!coords_in_range(90.0001, 0.0));
        assert!(!coords_in_range(-90.0001, 0.0));
        assert!(!coords_in_range(0.0, 180.0001));
        assert!(!coords_in_range(0.0, -180.0001));
    }

    #[test]
    fn target_label_is_truncated() {
        let mut target = NavigationTarget::default();
        let long = "x".repeat(MAX_TARGET_LABEL_LEN + 10);
        target.set(1.0, 2.0, &long);
        assert!(target.is_set);
        assert_eq!(target.label.len(), MAX_TARGET_LABEL_LEN);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 4-byte characters; a byte cap mid-character must back off.
        let s = "🧭🧭🧭🧭🧭🧭🧭🧭🧭";
        let out = truncated(s, MAX_LOCATION_NAME_LEN + 2);
        assert!(out.len() <= MAX_LOCATION_NAME_LEN + 2);
        assert!(s.starts_with(&out));
    }

    #[test]
    fn position_staleness_windows() {
        let mut pos = BlePosition::default();
        assert_eq!(pos.validity(0), PositionValidity::Expired);

        let t0 = 1_000;
        pos.update(51.0, 5.0, t0);
        assert_eq!(pos.validity(t0 + 29_000), PositionValidity::Fresh);
        assert_eq!(pos.validity(t0 + 31_000), PositionValidity::Stale);
        assert!(pos.coords(t0 + 31_000).is_some());
        assert_eq!(pos.validity(t0 + 61_000), PositionValidity::Expired);
        assert!(pos.coords(t0 + 61_000).is_none());
    }

    #[test]
    fn position_hard_expiry_clears_flag() {
        let mut pos = BlePosition::default();
        pos.update(1.0, 2.0, 0);
        assert!(!pos.expire_if_due(59_000));
        assert!(pos.is_set());
        assert!(pos.expire_if_due(61_000));
        assert!(!pos.is_set());
        // Already cleared, nothing further to report.
        assert!(!pos.expire_if_due(62_000));
    }

    #[test]
    fn position_update_is_wholesale() {
        let mut pos = BlePosition::default();
        pos.update(1.0, 2.0, 100);
        pos.update(3.0, 4.0, 200);
        assert_eq!(pos.coords(200), Some((3.0, 4.0)));
        assert_eq!(pos.timestamp_ms(), 200);
    }

    #[test]
    fn saved_location_name_is_truncated() {
        let long = "n".repeat(100);
        let loc = SavedLocation::new(&long, 1.0, 2.0);
        assert_eq!(loc.name.len(), MAX_LOCATION_NAME_LEN);
    }
}
