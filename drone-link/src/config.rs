//! Addresses, ports and timing knobs.
//!
//! The drone listens on a fixed address in its own access-point network, so
//! every value here has a sensible default.  The binary maps its CLI flags
//! onto these structs; tests override the ports with ephemeral ones and the
//! settle delays with zero.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Address of the drone on its own Wi-Fi network.
pub const DRONE_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 10, 1);
/// Port the drone accepts commands on.
pub const DRONE_COMMAND_PORT: u16 = 8889;
/// Local port command acknowledgements come back to.
pub const LOCAL_COMMAND_PORT: u16 = 9000;
/// Local port the state broadcast is received on.
pub const LOCAL_STATE_PORT: u16 = 8890;
/// Local port the drone pushes its raw H264 stream to.
pub const VIDEO_INPUT_PORT: u16 = 11111;
/// Local port the relay serves the repackaged stream on.
pub const VIDEO_OUTPUT_PORT: u16 = 11112;

/// Pause after `command` and after `streamon`.
pub const COMMAND_SETTLE_DELAY: Duration = Duration::from_millis(300);
/// Pause after `streamoff`.
pub const STREAMOFF_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// How many trailing lines of relay output are kept for failure reports.
pub const RELAY_LOG_TAIL: usize = 200;

/// Argument template of the default relay (ffmpeg).
///
/// `{input_port}` and `{output_port}` are substituted at start.  The input
/// flags keep latency down and drop corrupt data at the start of the stream.
pub const FFMPEG_ARGS: &[&str] = &[
    "-f", "h264",
    "-analyzeduration", "1000000",
    "-probesize", "1000000",
    "-fflags", "discardcorrupt",
    "-fflags", "nobuffer",
    "-flags", "low_delay",
    "-avioflags", "direct",
    "-i", "udp://0.0.0.0:{input_port}?timeout=5000000",
    "-c:v", "copy",
    "-f", "mpegts",
    "-listen", "1",
    "http://127.0.0.1:{output_port}",
];

/// Socket addresses used by [`crate::link::UdpLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Where commands are sent.
    pub peer: SocketAddr,
    /// Local bind address of the command socket.
    pub command_bind: SocketAddr,
    /// Local bind address of the state socket.
    pub state_bind: SocketAddr,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            peer: SocketAddr::V4(SocketAddrV4::new(DRONE_IP, DRONE_COMMAND_PORT)),
            command_bind: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, LOCAL_COMMAND_PORT)),
            state_bind: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, LOCAL_STATE_PORT)),
        }
    }
}

/// External process used by [`crate::relay::RelaySupervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Program to execute, looked up on `PATH`.
    pub program: String,
    /// Argument template; see [`FFMPEG_ARGS`] for the placeholders.
    pub args: Vec<String>,
    /// Port substituted for `{input_port}`.
    pub input_port: u16,
    /// Trailing output lines kept for failure reports.
    pub log_tail: usize,
}

impl RelayConfig {
    /// Run `program` with a custom argument template.
    pub fn custom(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Argument list with placeholders filled in.
    pub fn render_args(&self, output_port: u16) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input_port}", &self.input_port.to_string())
                    .replace("{output_port}", &output_port.to_string())
            })
            .collect()
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            args: FFMPEG_ARGS.iter().map(|s| s.to_string()).collect(),
            input_port: VIDEO_INPUT_PORT,
            log_tail: RELAY_LOG_TAIL,
        }
    }
}

/// Everything the orchestrator needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub link: LinkConfig,
    pub relay: RelayConfig,
    /// Port handed to the relay for its HTTP output.
    pub video_output_port: u16,
    /// Pause after `command` and after `streamon`.
    pub command_settle: Duration,
    /// Pause after `streamoff`.
    pub streamoff_settle: Duration,
}

impl SessionConfig {
    /// URL the player should open once the session is streaming.
    pub fn video_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.video_output_port)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            relay: RelayConfig::default(),
            video_output_port: VIDEO_OUTPUT_PORT,
            command_settle: COMMAND_SETTLE_DELAY,
            streamoff_settle: STREAMOFF_SETTLE_DELAY,
        }
    }
}
