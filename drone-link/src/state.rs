//! Connection state published by the session.
//!
//! [`ConnectionState`] is the single snapshot the UI renders from.  It is
//! created once (idle, no telemetry) and only ever transitioned; the
//! transitions themselves live in [`crate::session`].
//!
//! ```text
//!          connect()                 relay accepted
//!  IDLE ─────────────▶ CONNECTING ─────────────────▶ STREAMING
//!   ▲                      │                             │
//!   │     any step fails   │                             │ disconnect()
//!   └──────(unwind)────────┘                             │ / backgrounded
//!   └────────────────────────────────────────────────────┘
//! ```
//!
//! Disconnecting is an operation, not a state: it always lands in `Idle`.

use std::fmt;
use std::time::SystemTime;

use crate::telemetry::{TelemetrySnapshot, BATTERY_KEY};

/// Resting phases of the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    /// Nothing running.
    #[default]
    Idle,
    /// A connect sequence is in flight.
    Connecting,
    /// SDK mode entered, video on, relay running.
    Streaming,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Telemetry fields the UI shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryReadout {
    /// Battery percentage.
    pub battery: Option<u8>,
    /// Flight time as `"{m}m {s}s"` or `"N/A"`.
    pub flight_time: Option<String>,
    /// When the last broadcast was applied.
    pub last_update_at: Option<SystemTime>,
}

impl TelemetryReadout {
    /// Fold one broadcast into the readout.
    ///
    /// Only fields present in `snapshot` are replaced; the timestamp is
    /// always refreshed.
    pub fn apply(&mut self, snapshot: &TelemetrySnapshot, now: SystemTime) {
        if let Some(raw) = snapshot.get(BATTERY_KEY) {
            match snapshot.battery() {
                Some(pct) => self.battery = Some(pct),
                None => log::warn!("[session] ignoring non-numeric battery value {raw:?}"),
            }
        }
        if let Some(display) = snapshot.flight_time_display() {
            self.flight_time = Some(display);
        }
        self.last_update_at = Some(now);
    }

    /// All fields back to `None`.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Everything the UI observes about the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: Phase,
    /// Most recent failure, latest wins.  Cleared when a connect or
    /// disconnect starts.
    pub error_message: Option<String>,
    pub telemetry: TelemetryReadout,
}

impl ConnectionState {
    pub fn is_streaming(&self) -> bool {
        self.phase == Phase::Streaming
    }

    pub fn is_connecting(&self) -> bool {
        self.phase == Phase::Connecting
    }
}
