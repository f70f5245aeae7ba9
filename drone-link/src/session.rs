//! Session orchestrator.
//!
//! [`Session`] owns the published [`ConnectionState`] and drives the link and
//! relay through the connect and disconnect sequences:
//!
//! ```text
//!  connect():    "command" ─settle─▶ "streamon" ─settle─▶ relay.start(out)
//!                    │                   │                     │
//!                    └───────── any failure: unwind ───────────┘
//!
//!  disconnect(): phase = Idle ─▶ relay.stop() ─▶ "streamoff" ─settle─▶ telemetry = none
//!                              (each step logged and swallowed on failure)
//! ```
//!
//! Connect and disconnect share one admission token.  A `connect` that finds
//! the token taken, or the session already connecting or streaming, returns
//! [`ConnectOutcome::AlreadyActive`] without touching the network.  A
//! `disconnect` waits for the token and runs after whatever holds it.
//!
//! Link and relay events are consumed by a background pump started in
//! [`Session::attach`].  The pump only ever touches telemetry and the error
//! message, so it never waits on a connect or disconnect in flight.
//!
//! The link closes itself after a transport error.  While attached, the
//! next `connect` reopens it on the same event channel.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::command::{FlightCommand, SdkCommand};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::link::{
    link_event_channel, DroneLink, LinkEvent, LinkEventReceiver, LinkEventSender, UdpLink,
};
use crate::relay::{
    relay_event_channel, RelayEvent, RelayEventReceiver, RelayOutcome, RelaySupervisor,
    SessionId, VideoRelay,
};
use crate::state::{ConnectionState, Phase};

/// Result of a [`Session::connect`] call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The sequence ran to completion; the relay runs as `SessionId`.
    Connected(SessionId),
    /// Another operation was in flight or the session was already up.
    AlreadyActive,
}

/// Held by whichever orchestrator operation is running.
#[derive(Debug, Default)]
struct Attempt {
    /// `streamon` left this host since the last unwind.
    stream_on: bool,
}

/// Receiving ends the pump consumes; handed back when it stops.
struct Receivers {
    link: LinkEventReceiver,
    relay: RelayEventReceiver,
}

struct Pump {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<Receivers>,
}

/// Drone session over a [`DroneLink`] and a [`VideoRelay`].
pub struct Session<L, R> {
    config: SessionConfig,
    link: Arc<L>,
    relay: Arc<R>,
    state: Arc<watch::Sender<ConnectionState>>,
    admission: tokio::sync::Mutex<Attempt>,
    /// Given to every `open`, so a reopened link reports to the same pump.
    link_events: LinkEventSender,
    receivers: Mutex<Option<Receivers>>,
    pump: Mutex<Option<Pump>>,
}

impl Session<UdpLink, RelaySupervisor> {
    /// Session over real UDP sockets and an OS relay process.
    pub fn with_config(config: SessionConfig) -> Self {
        let (relay_tx, relay_rx) = relay_event_channel();
        let link = Arc::new(UdpLink::new(config.link.clone()));
        let relay = Arc::new(RelaySupervisor::new(config.relay.clone(), relay_tx));
        Self::new(config, link, relay, relay_rx)
    }
}

impl<L, R> Session<L, R>
where
    L: DroneLink + 'static,
    R: VideoRelay + 'static,
{
    /// `relay_events` must be the receiving end of the channel `relay`
    /// reports completions on.
    pub fn new(
        config: SessionConfig,
        link: Arc<L>,
        relay: Arc<R>,
        relay_events: RelayEventReceiver,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::default());
        let (link_events, link_rx) = link_event_channel();
        Self {
            config,
            link,
            relay,
            state: Arc::new(state),
            admission: tokio::sync::Mutex::new(Attempt::default()),
            link_events,
            receivers: Mutex::new(Some(Receivers {
                link: link_rx,
                relay: relay_events,
            })),
            pump: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn link(&self) -> &Arc<L> {
        &self.link
    }

    pub fn relay(&self) -> &Arc<R> {
        &self.relay
    }

    /// Receiver that sees every published state.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Where the player should point once streaming.
    pub fn video_url(&self) -> String {
        self.config.video_url()
    }

    /// Open the link and start consuming link and relay events.
    ///
    /// A bind failure is published as the error message and returned.
    pub async fn attach(&self) -> Result<(), SessionError> {
        self.stop_pump().await;

        if let Err(e) = self.link.open(self.link_events.clone()).await {
            log::error!("[session] service init failed: {e}");
            self.state
                .send_modify(|s| s.error_message = Some(format!("Service init failed: {e}")));
            return Err(e.into());
        }

        let receivers = lock(&self.receivers).take().unwrap_or_else(|| {
            log::warn!("[session] event receivers lost; starting with fresh channels");
            Receivers {
                link: link_event_channel().1,
                relay: relay_event_channel().1,
            }
        });
        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(pump(Arc::clone(&self.state), receivers, shutdown_rx));
        *lock(&self.pump) = Some(Pump { shutdown, handle });

        log::info!("[session] attached");
        Ok(())
    }

    /// Enter SDK mode, turn video on and start the relay.
    pub async fn connect(&self) -> Result<ConnectOutcome, SessionError> {
        let Ok(mut attempt) = self.admission.try_lock() else {
            log::info!("[session] connect ignored: another operation is in progress");
            return Ok(ConnectOutcome::AlreadyActive);
        };
        let phase = self.state.borrow().phase;
        if phase != Phase::Idle {
            log::info!("[session] connect ignored: already {phase}");
            return Ok(ConnectOutcome::AlreadyActive);
        }

        log::info!("[session] connecting");
        self.state.send_modify(|s| {
            s.phase = Phase::Connecting;
            s.error_message = None;
            s.telemetry.clear();
        });

        match self.connect_sequence(&mut attempt).await {
            Ok(id) => {
                self.state.send_modify(|s| s.phase = Phase::Streaming);
                log::info!("[session] streaming; video at {}", self.video_url());
                Ok(ConnectOutcome::Connected(id))
            }
            Err(e) => {
                log::error!("[session] connect failed: {e}; unwinding");
                self.unwind(&mut attempt).await;
                self.state.send_modify(|s| {
                    s.error_message = Some(format!("Connect error: {e}"));
                    s.telemetry.clear();
                });
                Err(e)
            }
        }
    }

    async fn connect_sequence(&self, attempt: &mut Attempt) -> Result<SessionId, SessionError> {
        self.reopen_link().await?;

        self.link.send(SdkCommand::Command.as_str()).await?;
        tokio::time::sleep(self.config.command_settle).await;

        self.link.send(SdkCommand::StreamOn.as_str()).await?;
        attempt.stream_on = true;
        tokio::time::sleep(self.config.command_settle).await;

        let id = self.relay.start(self.config.video_output_port).await?;
        Ok(id)
    }

    /// Reopen a link that closed itself after a transport error.
    ///
    /// Only while attached: without a pump nobody would drain its events.
    async fn reopen_link(&self) -> Result<(), SessionError> {
        let attached = lock(&self.pump).is_some();
        if !attached || self.link.is_open() {
            return Ok(());
        }
        log::info!("[session] link is closed; reopening before connect");
        self.link.open(self.link_events.clone()).await?;
        Ok(())
    }

    /// Stop the relay and the drone's video.  Always ends `Idle`.
    ///
    /// Runs after any connect already in flight.
    pub async fn disconnect(&self) {
        let mut attempt = self.admission.lock().await;
        self.unwind(&mut attempt).await;
    }

    /// The host application went to the background.
    pub async fn suspend(&self) {
        if self.state.borrow().is_streaming() {
            log::info!("[session] suspended while streaming; disconnecting");
            self.disconnect().await;
        }
    }

    async fn unwind(&self, attempt: &mut Attempt) {
        let prior = self.state.borrow().phase;
        self.state.send_modify(|s| {
            s.phase = Phase::Idle;
            s.error_message = None;
        });
        log::info!("[session] disconnecting from {prior}");

        self.relay.stop().await;

        if prior == Phase::Streaming || attempt.stream_on {
            if let Err(e) = self.link.send(SdkCommand::StreamOff.as_str()).await {
                log::warn!("[session] streamoff during disconnect failed: {e}");
            }
            tokio::time::sleep(self.config.streamoff_settle).await;
        }
        attempt.stream_on = false;

        self.state.send_modify(|s| s.telemetry.clear());
        log::info!("[session] idle");
    }

    /// Send one flight command.  Only valid while streaming.
    pub async fn send_flight_command(&self, command: FlightCommand) -> Result<(), SessionError> {
        if !self.state.borrow().is_streaming() {
            log::warn!("[session] {command} rejected: drone not connected");
            self.state.send_modify(|s| {
                s.error_message = Some("Cannot send command, drone not connected.".to_string())
            });
            return Err(SessionError::NotConnected);
        }

        if let Err(e) = self.link.send(&command.encode()).await {
            self.state
                .send_modify(|s| s.error_message = Some(format!("Command '{command}' failed: {e}")));
            return Err(e.into());
        }
        Ok(())
    }

    /// Disconnect, close the link and stop consuming events.
    pub async fn detach(&self) {
        self.disconnect().await;
        self.link.close().await;
        self.stop_pump().await;
        log::info!("[session] detached");
    }

    async fn stop_pump(&self) {
        let pump = lock(&self.pump).take();
        let Some(pump) = pump else {
            return;
        };

        let _ = pump.shutdown.send(());
        match pump.handle.await {
            Ok(receivers) => *lock(&self.receivers) = Some(receivers),
            Err(e) => log::error!("[session] event pump failed: {e}"),
        }
    }
}

impl<L, R> Drop for Session<L, R> {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.handle.abort();
        }
    }
}

fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fold link and relay events into the published state until shut down.
///
/// Hands the receivers back so a later attach can reuse them.
async fn pump(
    state: Arc<watch::Sender<ConnectionState>>,
    mut receivers: Receivers,
    mut shutdown: oneshot::Receiver<()>,
) -> Receivers {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(event) = receivers.link.recv() => handle_link_event(&state, event),
            Some(event) = receivers.relay.recv() => handle_relay_event(&state, event),
            else => break,
        }
    }
    receivers
}

fn handle_link_event(state: &watch::Sender<ConnectionState>, event: LinkEvent) {
    match event {
        LinkEvent::Telemetry(snapshot) => {
            log::debug!("[session] telemetry: {snapshot:?}");
            state.send_modify(|s| s.telemetry.apply(&snapshot, SystemTime::now()));
        }
        LinkEvent::TransportError { socket, message } => {
            // The link is gone but the phase is left alone; the next
            // connect reopens it.
            log::error!("[session] {socket} listener error: {message}");
            state.send_modify(|s| s.error_message = Some(format!("Status listener error: {message}")));
        }
    }
}

fn handle_relay_event(state: &watch::Sender<ConnectionState>, event: RelayEvent) {
    let RelayEvent::Completed { id, outcome } = event;
    match outcome {
        RelayOutcome::Success | RelayOutcome::Cancelled => {
            log::debug!("[session] relay session {id} ended: {outcome:?}");
        }
        RelayOutcome::Failed { code, output } => {
            let mut cause = match code {
                Some(code) => format!("session {id} exited with code {code}"),
                None => format!("session {id} was terminated by a signal"),
            };
            if let Some(last) = output.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
                cause.push_str(": ");
                cause.push_str(last);
            }
            log::error!("[session] video relay failed: {cause}");
            state.send_modify(|s| s.error_message = Some(format!("Video relay failed: {cause}")));
        }
    }
}
