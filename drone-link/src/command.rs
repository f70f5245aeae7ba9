//! Text command vocabulary of the drone's SDK.
//!
//! Every command is a short ASCII string sent as one UDP datagram to the
//! command port.  [`SdkCommand`] covers the session-control commands the
//! orchestrator issues itself; [`FlightCommand`] covers what an operator can
//! ask for once the session is streaming.

use std::fmt;
use std::str::FromStr;

/// Largest magnitude accepted for one RC channel.
pub const RC_MAX: i16 = 100;

/// Session-control commands issued by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkCommand {
    /// Enter SDK mode.  Must precede every other command.
    Command,
    /// Start pushing the H264 stream to the video port.
    StreamOn,
    /// Stop pushing the H264 stream.
    StreamOff,
}

impl SdkCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::StreamOn => "streamon",
            Self::StreamOff => "streamoff",
        }
    }
}

impl fmt::Display for SdkCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stick positions for one `rc` command, each in `-100..=100`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RcSticks {
    /// Left/right.
    pub roll: i16,
    /// Forward/backward.
    pub pitch: i16,
    /// Up/down.
    pub throttle: i16,
    /// Rotation.
    pub yaw: i16,
}

impl RcSticks {
    /// Build from raw channel values, clamping each to `±RC_MAX`.
    pub fn new(roll: i16, pitch: i16, throttle: i16, yaw: i16) -> Self {
        Self {
            roll: roll.clamp(-RC_MAX, RC_MAX),
            pitch: pitch.clamp(-RC_MAX, RC_MAX),
            throttle: throttle.clamp(-RC_MAX, RC_MAX),
            yaw: yaw.clamp(-RC_MAX, RC_MAX),
        }
    }

    /// Map two normalized stick vectors (`-1.0..=1.0` per axis) onto the RC
    /// channels: left stick is `(yaw, throttle)`, right stick is
    /// `(roll, pitch)`.  Positive y means up/forward.
    pub fn from_normalized(left: (f32, f32), right: (f32, f32)) -> Self {
        let scale = |v: f32| {
            if v.is_nan() {
                0
            } else {
                (v.clamp(-1.0, 1.0) * RC_MAX as f32).round() as i16
            }
        };
        Self::new(scale(right.0), scale(right.1), scale(left.1), scale(left.0))
    }

    /// All channels centred.
    pub fn is_neutral(&self) -> bool {
        *self == Self::default()
    }
}

/// Commands an operator may send while the session is streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightCommand {
    Takeoff,
    Land,
    /// Cut all motors immediately.
    Emergency,
    Rc(RcSticks),
}

impl FlightCommand {
    /// Wire form of the command.
    pub fn encode(&self) -> String {
        match self {
            Self::Takeoff => "takeoff".to_string(),
            Self::Land => "land".to_string(),
            Self::Emergency => "emergency".to_string(),
            Self::Rc(s) => format!("rc {} {} {} {}", s.roll, s.pitch, s.throttle, s.yaw),
        }
    }
}

impl fmt::Display for FlightCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for FlightCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let name = parts.next().ok_or_else(|| "empty command".to_string())?;
        let cmd = match name.to_lowercase().as_str() {
            "takeoff" => Self::Takeoff,
            "land" => Self::Land,
            "emergency" => Self::Emergency,
            "rc" => {
                let mut channels = [0i16; 4];
                for slot in channels.iter_mut() {
                    let raw = parts
                        .next()
                        .ok_or_else(|| "rc needs four values: roll pitch throttle yaw".to_string())?;
                    *slot = raw
                        .parse()
                        .map_err(|_| format!("invalid rc value: {raw}"))?;
                }
                let [roll, pitch, throttle, yaw] = channels;
                return match parts.next() {
                    None => Ok(Self::Rc(RcSticks::new(roll, pitch, throttle, yaw))),
                    Some(extra) => Err(format!("unexpected argument: {extra}")),
                };
            }
            _ => return Err(format!("Unknown flight command: {s}")),
        };
        match parts.next() {
            None => Ok(cmd),
            Some(extra) => Err(format!("unexpected argument: {extra}")),
        }
    }
}
