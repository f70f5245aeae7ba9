//! State-broadcast codec.
//!
//! The drone pushes a text datagram on its state port roughly ten times per
//! second:
//!
//! ```text
//! pitch:0;roll:0;yaw:0;vgx:0;vgy:0;vgz:0;templ:60;temph:62;tof:10;h:0;bat:87;baro:1.2;time:125;agx:0.0;agy:0.0;agz:-1000.0;
//! ```
//!
//! [`decode`] turns one datagram into a [`TelemetrySnapshot`].  Only `bat`
//! and `time` are consumed downstream; every other key is kept as-is so
//! callers can still look at it.
//!
//! No I/O happens here, and nothing is carried over between datagrams.

use std::collections::BTreeMap;

use crate::error::DecodeError;

/// Key carrying the battery percentage.
pub const BATTERY_KEY: &str = "bat";

/// Key carrying the motor-on time in seconds.
pub const FLIGHT_TIME_KEY: &str = "time";

/// Display value used when the flight time cannot be parsed.
pub const NOT_AVAILABLE: &str = "N/A";

/// Marker the drone uses for error replies.
const ERROR_MARKER: &str = "error";

/// Decoded key/value fields of one state broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    fields: BTreeMap<String, String>,
}

impl TelemetrySnapshot {
    /// Raw value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Battery percentage, when the `bat` field is present and numeric.
    pub fn battery(&self) -> Option<u8> {
        self.get(BATTERY_KEY).and_then(parse_battery)
    }

    /// Flight time formatted for display.
    ///
    /// `None` when the broadcast has no `time` field; [`NOT_AVAILABLE`] when
    /// the field is present but not an integer.
    pub fn flight_time_display(&self) -> Option<String> {
        self.get(FLIGHT_TIME_KEY).map(format_flight_time)
    }
}

impl FromIterator<(String, String)> for TelemetrySnapshot {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Decode one state datagram.
///
/// Tokens are separated by `;` and split on their first `:`.  Empty tokens,
/// tokens without a separator and tokens whose key trims to nothing are
/// skipped.  A payload yielding zero fields is [`DecodeError::Invalid`];
/// see [`DecodeError::is_noise`] for the ones not worth a warning.
pub fn decode(raw: &[u8]) -> Result<TelemetrySnapshot, DecodeError> {
    let text = String::from_utf8_lossy(raw);

    let snapshot: TelemetrySnapshot = text
        .split(';')
        .filter_map(|token| {
            let (key, value) = token.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect();

    if snapshot.is_empty() {
        return Err(DecodeError::Invalid(text.into_owned()));
    }
    Ok(snapshot)
}

impl DecodeError {
    /// Blank payloads and error replies carry no fields but are expected on
    /// the state port; only the remaining malformed payloads deserve a
    /// warning.
    pub fn is_noise(&self) -> bool {
        match self {
            Self::Invalid(raw) => raw.trim().is_empty() || raw.contains(ERROR_MARKER),
        }
    }
}

/// Parse the battery field: an integer percentage, clamped to 100.
pub fn parse_battery(value: &str) -> Option<u8> {
    leading_integer(value).map(|pct| pct.clamp(0, 100) as u8)
}

/// Render a seconds value as `"{m}m {s}s"`, or [`NOT_AVAILABLE`].
pub fn format_flight_time(value: &str) -> String {
    match leading_integer(value) {
        Some(total) if total >= 0 => format!("{}m {}s", total / 60, total % 60),
        _ => NOT_AVAILABLE.to_string(),
    }
}

/// Integer prefix of `value` (optional sign, then digits), ignoring any
/// trailing unit the firmware may append.
fn leading_integer(value: &str) -> Option<i64> {
    let value = value.trim();
    let end = value
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
        .map_or(value.len(), |(i, _)| i);
    value[..end].parse().ok()
}
