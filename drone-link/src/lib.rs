//! `drone-link`: control link, telemetry and video relay for a small
//! Wi-Fi drone that speaks a text command protocol over UDP.
//!
//! # Architecture
//!
//! ```text
//!            connect / disconnect / flight commands
//!  UI ───────────────────────────────────────────▶ ┌───────────┐
//!     ◀─────────── watch<ConnectionState> ──────── │  Session  │
//!                                                  └──┬─────┬──┘
//!                          send / open / close        │     │  start / stop
//!                      ┌──────────────────────────────┘     └───────────┐
//!                 ┌────▼────┐  LinkEvent                          ┌─────▼──────┐
//!                 │ UdpLink │──────────────▶ pump ◀────RelayEvent─│   Relay    │
//!                 └────┬────┘                                     │ Supervisor │
//!       command + state│sockets                                   └─────┬──────┘
//!                 ┌────▼────┐                                           │ ffmpeg
//!                 │  drone  │─── raw H264 :11111 ──────────────────────▶│──▶ HTTP :11112
//!                 └─────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`telemetry`] — state broadcast decoding
//! - [`command`]   — command vocabulary and wire text
//! - [`socket`]    — async UDP socket abstraction
//! - [`link`]      — dual-socket link and its listener tasks
//! - [`relay`]     — video relay process supervision
//! - [`state`]     — connection state types
//! - [`session`]   — connect / disconnect orchestration
//! - [`config`]    — addresses, ports and timing
//! - [`error`]     — error enums for every layer

pub mod command;
pub mod config;
pub mod error;
pub mod link;
pub mod relay;
pub mod session;
pub mod socket;
pub mod state;
pub mod telemetry;

pub use command::{FlightCommand, RcSticks, SdkCommand};
pub use config::{LinkConfig, RelayConfig, SessionConfig};
pub use error::{DecodeError, LinkError, RelayError, SessionError, SocketRole};
pub use link::{DroneLink, LinkEvent, UdpLink};
pub use relay::{RelayEvent, RelayOutcome, RelaySupervisor, SessionId, VideoRelay};
pub use session::{ConnectOutcome, Session};
pub use state::{ConnectionState, Phase, TelemetryReadout};
pub use telemetry::{decode, TelemetrySnapshot};
