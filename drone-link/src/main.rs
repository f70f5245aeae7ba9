//! Entry point for `drone-link`.
//!
//! Parses CLI arguments and dispatches into either **fly** or **telemetry**
//! mode.  All protocol work is delegated to library modules; `main.rs` owns
//! only process setup (logging, signal handling, argument parsing) and the
//! operator prompt.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use drone_link::config::{self, LinkConfig, RelayConfig, SessionConfig};
use drone_link::link::{link_event_channel, DroneLink, LinkEvent};
use drone_link::{ConnectOutcome, ConnectionState, FlightCommand, RelaySupervisor, Session, UdpLink};

/// Control link and video relay for a UDP text-protocol drone.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    opts: Opts,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand)]
enum Mode {
    /// Connect, stream video and read flight commands from stdin (default).
    Fly,
    /// Only listen for state broadcasts and print them.
    Telemetry,
}

#[derive(Args)]
struct Opts {
    /// Drone command address.
    #[arg(long, global = true, default_value_t = LinkConfig::default().peer)]
    peer: SocketAddr,

    /// Local address of the command socket.
    #[arg(long, global = true, default_value_t = LinkConfig::default().command_bind)]
    command_bind: SocketAddr,

    /// Local address of the state socket.
    #[arg(long, global = true, default_value_t = LinkConfig::default().state_bind)]
    state_bind: SocketAddr,

    /// Port the drone pushes raw video to.
    #[arg(long, global = true, default_value_t = config::VIDEO_INPUT_PORT)]
    video_in: u16,

    /// Port the relay serves video on.
    #[arg(long, global = true, default_value_t = config::VIDEO_OUTPUT_PORT)]
    video_out: u16,

    /// Pause after `command` and `streamon`, in milliseconds.
    #[arg(long, global = true, default_value_t = config::COMMAND_SETTLE_DELAY.as_millis() as u64)]
    settle_ms: u64,

    /// Pause after `streamoff`, in milliseconds.
    #[arg(long, global = true, default_value_t = config::STREAMOFF_SETTLE_DELAY.as_millis() as u64)]
    streamoff_ms: u64,

    /// Relay program.
    #[arg(long, global = true, default_value = "ffmpeg")]
    relay: String,

    /// Relay argument template, replacing the ffmpeg default.  Repeat once
    /// per argument; `{input_port}` and `{output_port}` are substituted.
    #[arg(long = "relay-arg", global = true, allow_hyphen_values = true)]
    relay_args: Vec<String>,

    /// Relay output lines kept for failure reports.
    #[arg(long, global = true, default_value_t = config::RELAY_LOG_TAIL)]
    log_tail: usize,
}

impl Opts {
    fn session_config(self) -> SessionConfig {
        let mut relay = if self.relay_args.is_empty() {
            RelayConfig {
                program: self.relay,
                ..RelayConfig::default()
            }
        } else {
            RelayConfig::custom(self.relay, self.relay_args)
        };
        relay.input_port = self.video_in;
        relay.log_tail = self.log_tail;

        SessionConfig {
            link: LinkConfig {
                peer: self.peer,
                command_bind: self.command_bind,
                state_bind: self.state_bind,
            },
            relay,
            video_output_port: self.video_out,
            command_settle: Duration::from_millis(self.settle_ms),
            streamoff_settle: Duration::from_millis(self.streamoff_ms),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to info; set RUST_LOG to control verbosity.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.opts.session_config();

    match cli.mode.unwrap_or(Mode::Fly) {
        Mode::Fly => fly(config).await,
        Mode::Telemetry => telemetry(config).await,
    }
}

async fn fly(config: SessionConfig) -> anyhow::Result<()> {
    let session = Session::with_config(config);
    session.attach().await.context("could not open the drone link")?;

    let mut states = session.subscribe();
    let mut last_shown = (states.borrow().phase, states.borrow().error_message.clone());
    try_connect(&session).await;
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted");
                session.suspend().await;
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                // Telemetry arrives several times a second; only report
                // phase and error changes.
                let shown = (state.phase, state.error_message.clone());
                if shown != last_shown {
                    print_state(&state);
                    last_shown = shown;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                if !handle_line(&session, line.trim()).await {
                    break;
                }
            }
        }
    }

    session.detach().await;
    Ok(())
}

/// Run one operator line.  Returns `false` when the operator quits.
async fn handle_line(session: &Session<UdpLink, RelaySupervisor>, line: &str) -> bool {
    match line {
        "" => {}
        "quit" | "exit" => return false,
        "help" => print_help(),
        "connect" => try_connect(session).await,
        "disconnect" => session.disconnect().await,
        "status" => print_state(&session.snapshot()),
        other => match other.parse::<FlightCommand>() {
            Ok(cmd) => {
                if let Err(e) = session.send_flight_command(cmd).await {
                    println!("! {e}");
                }
            }
            Err(e) => println!("! {e}"),
        },
    }
    true
}

async fn try_connect(session: &Session<UdpLink, RelaySupervisor>) {
    match session.connect().await {
        Ok(ConnectOutcome::Connected(_)) => println!("video: {}", session.video_url()),
        Ok(ConnectOutcome::AlreadyActive) => println!("already connected"),
        Err(e) => println!("! connect failed: {e}"),
    }
}

fn print_state(state: &ConnectionState) {
    let battery = state
        .telemetry
        .battery
        .map_or_else(|| "-".to_string(), |b| format!("{b}%"));
    let flight_time = state.telemetry.flight_time.as_deref().unwrap_or("-");
    print!("[{}] battery {battery}  flight {flight_time}", state.phase);
    if let Some(error) = &state.error_message {
        print!("  error: {error}");
    }
    println!();
}

fn print_help() {
    println!("commands: connect, disconnect, takeoff, land, emergency, rc <roll> <pitch> <throttle> <yaw>, status, quit");
}

async fn telemetry(config: SessionConfig) -> anyhow::Result<()> {
    let link = UdpLink::new(config.link);
    let (tx, mut rx) = link_event_channel();
    link.open(tx).await.context("could not bind the link sockets")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => match event {
                Some(LinkEvent::Telemetry(snapshot)) => {
                    let fields: Vec<String> =
                        snapshot.iter().map(|(k, v)| format!("{k}={v}")).collect();
                    println!("{}", fields.join(" "));
                }
                Some(LinkEvent::TransportError { message, .. }) => {
                    link.close().await;
                    anyhow::bail!(message);
                }
                None => break,
            }
        }
    }

    link.close().await;
    Ok(())
}
