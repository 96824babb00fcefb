//! Connection lifecycle: link state, the advertising watchdog and the UI
//! popup requests raised on connect/disconnect.

use log::{info, warn};

use crate::config::ADV_WATCHDOG_INTERVAL_MS;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LinkState {
    #[default]
    Disconnected,
    Advertising,
    Connected,
}

/// A request for the display task to show a transient status banner. The BLE
/// core only decides that one is due; rendering belongs to the UI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Popup {
    pub message: &'static str,
    pub duration_ms: u32,
    /// RGB565 foreground and background.
    pub color: u16,
    pub bg_color: u16,
}

impl Popup {
    pub fn connected() -> Self {
        Self {
            message: "BLE connected",
            duration_ms: 2_000,
            color: 0x07E0,
            bg_color: 0x0000,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            message: "BLE disconnected",
            duration_ms: 2_000,
            color: 0xF800,
            bg_color: 0x0000,
        }
    }
}

/// Tracks the GAP link and decides when advertising must be (re)started.
///
/// The watchdog covers the cases where a start-advertising call silently
/// failed or the controller dropped out of advertising without an event:
/// while disconnected it requests a fresh start every few seconds, which is
/// harmless when advertising is already running.
#[derive(Debug, Default)]
pub struct ConnectionLifecycle {
    state: LinkState,
    connected_since_ms: Option<u32>,
    last_watchdog_ms: u32,
    pending_popup: Option<Popup>,
}

impl ConnectionLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn connected_since_ms(&self) -> Option<u32> {
        self.connected_since_ms
    }

    pub fn on_connect(&mut self, now_ms: u32) {
        info!("central connected");
        self.state = LinkState::Connected;
        self.connected_since_ms = Some(now_ms);
        self.pending_popup = Some(Popup::connected());
    }

    /// Returns true when advertising should be restarted immediately, i.e.
    /// when the peer actually was connected rather than a spurious event.
    pub fn on_disconnect(&mut self) -> bool {
        let was_connected = self.state == LinkState::Connected;
        if was_connected {
            info!("central disconnected, restarting advertising");
            self.pending_popup = Some(Popup::disconnected());
        } else {
            warn!("disconnect event while not connected, ignoring");
        }
        self.state = LinkState::Disconnected;
        self.connected_since_ms = None;
        was_connected
    }

    pub fn on_advertising_started(&mut self) {
        if self.state != LinkState::Connected {
            self.state = LinkState::Advertising;
        }
    }

    /// Polled from the main loop. Returns true when the watchdog wants an
    /// advertising start issued.
    pub fn poll_watchdog(&mut self, now_ms: u32) -> bool {
        if self.state == LinkState::Connected {
            self.last_watchdog_ms = now_ms;
            return false;
        }
        if now_ms.wrapping_sub(self.last_watchdog_ms) >= ADV_WATCHDOG_INTERVAL_MS {
            self.last_watchdog_ms = now_ms;
            return true;
        }
        false
    }

    /// Hands the queued popup to the display task, at most one per event.
    pub fn take_popup(&mut self) -> Option<Popup> {
        self.pending_popup.take()
    }
}
