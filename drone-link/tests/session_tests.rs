//! Orchestrator tests against in-memory link and relay backends.
//!
//! The mocks record every call and can be told to fail a given step, so the
//! connect and disconnect sequences can be checked without a drone or an
//! ffmpeg binary.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use drone_link::error::{LinkError, RelayError, SessionError, SocketRole};
use drone_link::link::{DroneLink, LinkEvent, LinkEventSender};
use drone_link::relay::{
    relay_event_channel, RelayEvent, RelayEventSender, RelayOutcome, SessionId, VideoRelay,
};
use drone_link::state::{ConnectionState, Phase};
use drone_link::telemetry::decode;
use drone_link::{ConnectOutcome, FlightCommand, RcSticks, Session, SessionConfig};

/// ------------------------------------------------------------
/// Mock link (NO NETWORK)
/// ------------------------------------------------------------

#[derive(Default)]
struct MockLink {
    inner: Mutex<MockLinkInner>,
}

#[derive(Default)]
struct MockLinkInner {
    events: Option<LinkEventSender>,
    sent: Vec<String>,
    sent_at: Vec<Instant>,
    fail_on: Option<String>,
    fail_open: bool,
    opens: usize,
    closes: usize,
}

impl MockLink {
    fn failing_on(command: &str) -> Self {
        let link = Self::default();
        link.inner.lock().unwrap().fail_on = Some(command.to_string());
        link
    }

    fn sent(&self) -> Vec<String> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Times at which each command in `sent` went out.
    fn sent_at(&self) -> Vec<Instant> {
        self.inner.lock().unwrap().sent_at.clone()
    }

    /// Report a receive failure and close, the way the UDP link does.
    fn fail_transport(&self, message: &str) {
        let mut inner = self.inner.lock().unwrap();
        let events = inner.events.take().expect("link not open");
        events
            .send(LinkEvent::TransportError {
                socket: SocketRole::State,
                message: message.to_string(),
            })
            .unwrap();
    }

    fn emit(&self, event: LinkEvent) {
        let inner = self.inner.lock().unwrap();
        inner
            .events
            .as_ref()
            .expect("link not open")
            .send(event)
            .unwrap();
    }
}

#[async_trait]
impl DroneLink for MockLink {
    async fn open(&self, events: LinkEventSender) -> Result<(), LinkError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_open {
            return Err(LinkError::Bind {
                which: SocketRole::State,
                source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
            });
        }
        inner.opens += 1;
        inner.events = Some(events);
        Ok(())
    }

    async fn send(&self, command: &str) -> Result<(), LinkError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.events.is_none() {
            return Err(LinkError::NotOpen);
        }
        inner.sent.push(command.to_string());
        inner.sent_at.push(Instant::now());
        if inner.fail_on.as_deref() == Some(command) {
            return Err(LinkError::Send {
                command: command.to_string(),
                source: io::Error::new(io::ErrorKind::Other, "network unreachable"),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closes += 1;
        inner.events = None;
    }

    fn is_open(&self) -> bool {
        self.inner.lock().unwrap().events.is_some()
    }
}

/// ------------------------------------------------------------
/// Mock relay (NO PROCESS)
/// ------------------------------------------------------------

#[derive(Default)]
struct MockRelay {
    inner: Mutex<MockRelayInner>,
}

#[derive(Default)]
struct MockRelayInner {
    fail_start: bool,
    started: Vec<u16>,
    stops: usize,
    next_id: u64,
}

impl MockRelay {
    fn failing() -> Self {
        let relay = Self::default();
        relay.inner.lock().unwrap().fail_start = true;
        relay
    }

    fn started(&self) -> Vec<u16> {
        self.inner.lock().unwrap().started.clone()
    }

    fn stops(&self) -> usize {
        self.inner.lock().unwrap().stops
    }
}

#[async_trait]
impl VideoRelay for MockRelay {
    async fn start(&self, output_port: u16) -> Result<SessionId, RelayError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_start {
            return Err(RelayError::Launch {
                program: "ffmpeg".to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
            });
        }
        inner.started.push(output_port);
        inner.next_id += 1;
        Ok(SessionId(inner.next_id))
    }

    async fn stop(&self) {
        self.inner.lock().unwrap().stops += 1;
    }
}

/// ------------------------------------------------------------
/// Helpers
/// ------------------------------------------------------------

type TestSession = Session<MockLink, MockRelay>;

fn quick_config() -> SessionConfig {
    SessionConfig {
        command_settle: Duration::ZERO,
        streamoff_settle: Duration::ZERO,
        ..SessionConfig::default()
    }
}

fn session_with(link: MockLink, relay: MockRelay, config: SessionConfig) -> (TestSession, RelayEventSender) {
    let (relay_tx, relay_rx) = relay_event_channel();
    let session = Session::new(config, Arc::new(link), Arc::new(relay), relay_rx);
    (session, relay_tx)
}

async fn attached(link: MockLink, relay: MockRelay) -> (TestSession, RelayEventSender) {
    let (session, relay_tx) = session_with(link, relay, quick_config());
    session.attach().await.unwrap();
    (session, relay_tx)
}

async fn wait_until(
    rx: &mut watch::Receiver<ConnectionState>,
    pred: impl FnMut(&ConnectionState) -> bool,
) -> ConnectionState {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("timed out waiting for state")
        .expect("session dropped")
        .clone()
}

/// ------------------------------------------------------------
/// Connect
/// ------------------------------------------------------------

#[tokio::test]
async fn connect_runs_the_sequence_and_streams() {
    let (session, _relay_tx) = attached(MockLink::default(), MockRelay::default()).await;

    let outcome = session.connect().await.unwrap();
    assert_eq!(outcome, ConnectOutcome::Connected(SessionId(1)));

    let state = session.snapshot();
    assert_eq!(state.phase, Phase::Streaming);
    assert!(state.error_message.is_none());
    assert_eq!(session.link().sent(), ["command", "streamon"]);
    assert_eq!(session.relay().started(), [11112]);
    assert_eq!(session.video_url(), "http://127.0.0.1:11112");
}

#[tokio::test]
async fn second_connect_is_a_no_op() {
    let (session, _relay_tx) = attached(MockLink::default(), MockRelay::default()).await;

    session.connect().await.unwrap();
    let again = session.connect().await.unwrap();

    assert_eq!(again, ConnectOutcome::AlreadyActive);
    assert_eq!(session.link().sent(), ["command", "streamon"]);
    assert_eq!(session.relay().started().len(), 1);
}

#[tokio::test]
async fn concurrent_connect_is_rejected_while_one_is_in_flight() {
    let config = SessionConfig {
        command_settle: Duration::from_millis(50),
        ..quick_config()
    };
    let (session, _relay_tx) = session_with(MockLink::default(), MockRelay::default(), config);
    session.attach().await.unwrap();

    let (first, second) = tokio::join!(session.connect(), session.connect());

    assert_eq!(first.unwrap(), ConnectOutcome::Connected(SessionId(1)));
    assert_eq!(second.unwrap(), ConnectOutcome::AlreadyActive);
    assert_eq!(session.link().sent(), ["command", "streamon"]);
    assert_eq!(session.relay().started().len(), 1);
}

#[tokio::test]
async fn connecting_phase_is_published() {
    let config = SessionConfig {
        command_settle: Duration::from_millis(50),
        ..quick_config()
    };
    let (session, _relay_tx) = session_with(MockLink::default(), MockRelay::default(), config);
    session.attach().await.unwrap();
    let mut states = session.subscribe();

    let watcher = async {
        wait_until(&mut states, |s| s.phase == Phase::Connecting).await;
    };
    let (outcome, ()) = tokio::join!(session.connect(), watcher);

    assert!(matches!(outcome.unwrap(), ConnectOutcome::Connected(_)));
    assert!(session.snapshot().is_streaming());
}

#[tokio::test]
async fn streamon_failure_unwinds_to_idle() {
    let (session, _relay_tx) = attached(MockLink::failing_on("streamon"), MockRelay::default()).await;

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::Link(LinkError::Send { .. })));

    let state = session.snapshot();
    assert_eq!(state.phase, Phase::Idle);
    let message = state.error_message.expect("error message set");
    assert!(message.starts_with("Connect error: "), "{message}");
    assert!(message.contains("streamon"), "{message}");
    assert!(state.telemetry.is_empty());
    assert_eq!(session.relay().stops(), 1);
    assert!(session.relay().started().is_empty());
    // streamon never left the host, so no streamoff.
    assert_eq!(session.link().sent(), ["command", "streamon"]);
}

#[tokio::test]
async fn relay_launch_failure_turns_video_back_off() {
    let (session, _relay_tx) = attached(MockLink::default(), MockRelay::failing()).await;

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::Relay(RelayError::Launch { .. })));

    let state = session.snapshot();
    assert_eq!(state.phase, Phase::Idle);
    assert!(state.error_message.unwrap().starts_with("Connect error: failed to start video relay"));
    assert_eq!(session.link().sent(), ["command", "streamon", "streamoff"]);
}

#[tokio::test]
async fn connect_without_attach_reports_the_link_error() {
    let (session, _relay_tx) = session_with(MockLink::default(), MockRelay::default(), quick_config());

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::Link(LinkError::NotOpen)));
    assert_eq!(
        session.snapshot().error_message.as_deref(),
        Some("Connect error: command socket not initialized")
    );

    // A retry after attaching succeeds.
    session.attach().await.unwrap();
    assert!(matches!(session.connect().await.unwrap(), ConnectOutcome::Connected(_)));
}

/// ------------------------------------------------------------
/// Disconnect
/// ------------------------------------------------------------

#[tokio::test]
async fn disconnect_from_idle_is_a_no_op() {
    let (session, _relay_tx) = attached(MockLink::default(), MockRelay::default()).await;

    session.disconnect().await;

    let state = session.snapshot();
    assert_eq!(state.phase, Phase::Idle);
    assert!(state.error_message.is_none());
    assert!(session.link().sent().is_empty());
}

#[tokio::test]
async fn disconnect_from_streaming_stops_everything() {
    let (session, _relay_tx) = attached(MockLink::default(), MockRelay::default()).await;
    session.connect().await.unwrap();
    session.link().emit(LinkEvent::Telemetry(decode(b"bat:55").unwrap()));
    let mut states = session.subscribe();
    wait_until(&mut states, |s| s.telemetry.battery.is_some()).await;

    session.disconnect().await;

    let state = session.snapshot();
    assert_eq!(state.phase, Phase::Idle);
    assert!(state.telemetry.is_empty());
    assert_eq!(session.relay().stops(), 1);
    assert_eq!(session.link().sent(), ["command", "streamon", "streamoff"]);
}

#[tokio::test]
async fn disconnect_survives_a_failing_streamoff() {
    let (session, _relay_tx) = attached(MockLink::failing_on("streamoff"), MockRelay::default()).await;
    session.connect().await.unwrap();

    session.disconnect().await;

    let state = session.snapshot();
    assert_eq!(state.phase, Phase::Idle);
    assert!(state.error_message.is_none());
    assert_eq!(session.relay().stops(), 1);
}

#[tokio::test]
async fn disconnect_waits_for_an_in_flight_connect() {
    let config = SessionConfig {
        command_settle: Duration::from_millis(30),
        ..quick_config()
    };
    let (session, _relay_tx) = session_with(MockLink::default(), MockRelay::default(), config);
    session.attach().await.unwrap();

    let (outcome, ()) = tokio::join!(session.connect(), session.disconnect());

    assert!(matches!(outcome.unwrap(), ConnectOutcome::Connected(_)));
    assert_eq!(session.snapshot().phase, Phase::Idle);
    assert_eq!(session.link().sent(), ["command", "streamon", "streamoff"]);
}

#[tokio::test]
async fn suspend_only_disconnects_while_streaming() {
    let (session, _relay_tx) = attached(MockLink::default(), MockRelay::default()).await;

    session.suspend().await;
    assert_eq!(session.relay().stops(), 0);

    session.connect().await.unwrap();
    session.suspend().await;
    assert_eq!(session.snapshot().phase, Phase::Idle);
    assert_eq!(session.relay().stops(), 1);
}

#[tokio::test]
async fn detach_closes_the_link() {
    let (session, _relay_tx) = attached(MockLink::default(), MockRelay::default()).await;
    session.connect().await.unwrap();

    session.detach().await;

    assert_eq!(session.snapshot().phase, Phase::Idle);
    assert_eq!(session.link().inner.lock().unwrap().closes, 1);
    assert!(matches!(
        session.send_flight_command(FlightCommand::Land).await,
        Err(SessionError::NotConnected)
    ));
}

/// ------------------------------------------------------------
/// Flight commands
/// ------------------------------------------------------------

#[tokio::test]
async fn flight_command_requires_streaming() {
    let (session, _relay_tx) = attached(MockLink::default(), MockRelay::default()).await;

    let err = session.send_flight_command(FlightCommand::Takeoff).await.unwrap_err();

    assert!(matches!(err, SessionError::NotConnected));
    assert_eq!(
        session.snapshot().error_message.as_deref(),
        Some("Cannot send command, drone not connected.")
    );
    assert!(session.link().sent().is_empty());
}

#[tokio::test]
async fn flight_commands_are_sent_while_streaming() {
    let (session, _relay_tx) = attached(MockLink::default(), MockRelay::default()).await;
    session.connect().await.unwrap();

    session.send_flight_command(FlightCommand::Takeoff).await.unwrap();
    session
        .send_flight_command(FlightCommand::Rc(RcSticks::new(10, -20, 150, 0)))
        .await
        .unwrap();

    assert_eq!(
        session.link().sent(),
        ["command", "streamon", "takeoff", "rc 10 -20 100 0"]
    );
}

#[tokio::test]
async fn failed_flight_command_is_reported() {
    let (session, _relay_tx) = attached(MockLink::failing_on("land"), MockRelay::default()).await;
    session.connect().await.unwrap();

    let err = session.send_flight_command(FlightCommand::Land).await.unwrap_err();

    assert!(matches!(err, SessionError::Link(_)));
    let state = session.snapshot();
    assert!(state.is_streaming());
    assert!(state.error_message.unwrap().starts_with("Command 'land' failed: "));
}

/// ------------------------------------------------------------
/// Events
/// ------------------------------------------------------------

#[tokio::test]
async fn telemetry_updates_the_readout() {
    let (session, _relay_tx) = attached(MockLink::default(), MockRelay::default()).await;
    session.connect().await.unwrap();
    let mut states = session.subscribe();

    session
        .link()
        .emit(LinkEvent::Telemetry(decode(b"bat:87;time:125;other:x").unwrap()));

    let state = wait_until(&mut states, |s| s.telemetry.battery.is_some()).await;
    assert_eq!(state.telemetry.battery, Some(87));
    assert_eq!(state.telemetry.flight_time.as_deref(), Some("2m 5s"));
    assert!(state.telemetry.last_update_at.is_some());
}

#[tokio::test]
async fn transport_error_is_surfaced_but_keeps_streaming() {
    let (session, _relay_tx) = attached(MockLink::default(), MockRelay::default()).await;
    session.connect().await.unwrap();
    let mut states = session.subscribe();

    session.link().emit(LinkEvent::TransportError {
        socket: SocketRole::State,
        message: "UDP state socket error: connection reset".to_string(),
    });

    let state = wait_until(&mut states, |s| s.error_message.is_some()).await;
    assert_eq!(
        state.error_message.as_deref(),
        Some("Status listener error: UDP state socket error: connection reset")
    );
    assert_eq!(state.phase, Phase::Streaming);
}

#[tokio::test]
async fn relay_runtime_failure_is_surfaced() {
    let (session, relay_tx) = attached(MockLink::default(), MockRelay::default()).await;
    let Ok(ConnectOutcome::Connected(id)) = session.connect().await else {
        panic!("connect failed");
    };
    let mut states = session.subscribe();

    relay_tx
        .send(RelayEvent::Completed {
            id,
            outcome: RelayOutcome::Failed {
                code: Some(1),
                output: "Address already in use".to_string(),
            },
        })
        .unwrap();

    let state = wait_until(&mut states, |s| s.error_message.is_some()).await;
    let message = state.error_message.unwrap();
    assert!(message.starts_with("Video relay failed: "), "{message}");
    assert!(message.contains("code 1"), "{message}");
}

#[tokio::test]
async fn relay_failure_message_ends_with_the_last_output_line() {
    let (session, relay_tx) = attached(MockLink::default(), MockRelay::default()).await;
    let mut states = session.subscribe();

    relay_tx
        .send(RelayEvent::Completed {
            id: SessionId(3),
            outcome: RelayOutcome::Failed {
                code: Some(1),
                output: "Input #0, h264\nhttp://127.0.0.1:11112: Address already in use\n\n".to_string(),
            },
        })
        .unwrap();

    let state = wait_until(&mut states, |s| s.error_message.is_some()).await;
    assert_eq!(
        state.error_message.as_deref(),
        Some("Video relay failed: session #3 exited with code 1: http://127.0.0.1:11112: Address already in use")
    );
}

#[tokio::test]
async fn cancelled_relay_is_not_an_error() {
    let (session, relay_tx) = attached(MockLink::default(), MockRelay::default()).await;
    let mut states = session.subscribe();

    relay_tx
        .send(RelayEvent::Completed {
            id: SessionId(1),
            outcome: RelayOutcome::Cancelled,
        })
        .unwrap();
    session
        .link()
        .emit(LinkEvent::Telemetry(decode(b"bat:1").unwrap()));

    let state = wait_until(&mut states, |s| s.telemetry.battery.is_some()).await;
    assert!(state.error_message.is_none());
}

#[tokio::test]
async fn attach_failure_is_published() {
    let link = MockLink::default();
    link.inner.lock().unwrap().fail_open = true;
    let (session, _relay_tx) = session_with(link, MockRelay::default(), quick_config());

    let err = session.attach().await.unwrap_err();
    assert!(matches!(err, SessionError::Link(LinkError::Bind { .. })));
    assert!(session
        .snapshot()
        .error_message
        .unwrap()
        .starts_with("Service init failed: UDP state socket bind failed"));
}

#[tokio::test]
async fn reattach_keeps_relay_events_flowing() {
    let (session, relay_tx) = attached(MockLink::default(), MockRelay::default()).await;
    session.detach().await;
    session.attach().await.unwrap();
    assert_eq!(session.link().inner.lock().unwrap().opens, 2);
    let mut states = session.subscribe();

    relay_tx
        .send(RelayEvent::Completed {
            id: SessionId(7),
            outcome: RelayOutcome::Failed {
                code: None,
                output: String::new(),
            },
        })
        .unwrap();

    let state = wait_until(&mut states, |s| s.error_message.is_some()).await;
    assert!(state.error_message.unwrap().starts_with("Video relay failed: "));
}

/// ------------------------------------------------------------
/// Recovery and timing
/// ------------------------------------------------------------

#[tokio::test]
async fn connect_after_a_transport_error_reopens_the_link() {
    let (session, _relay_tx) = attached(MockLink::default(), MockRelay::default()).await;
    session.connect().await.unwrap();
    let mut states = session.subscribe();

    session.link().fail_transport("UDP state socket error: connection reset");
    wait_until(&mut states, |s| s.error_message.is_some()).await;
    assert!(!session.link().is_open());

    session.disconnect().await;
    let outcome = session.connect().await.unwrap();

    assert!(matches!(outcome, ConnectOutcome::Connected(SessionId(2))));
    let state = session.snapshot();
    assert_eq!(state.phase, Phase::Streaming);
    assert!(state.error_message.is_none());
    assert_eq!(session.link().inner.lock().unwrap().opens, 2);
    assert_eq!(session.link().sent(), ["command", "streamon", "command", "streamon"]);

    // Events from the reopened link still reach the session.
    session.link().emit(LinkEvent::Telemetry(decode(b"bat:64").unwrap()));
    let state = wait_until(&mut states, |s| s.telemetry.battery.is_some()).await;
    assert_eq!(state.telemetry.battery, Some(64));
}

#[tokio::test(start_paused = true)]
async fn settle_delays_are_awaited_between_steps() {
    let config = SessionConfig {
        command_settle: Duration::from_millis(300),
        streamoff_settle: Duration::from_millis(100),
        ..SessionConfig::default()
    };
    let (session, _relay_tx) = session_with(MockLink::default(), MockRelay::default(), config);
    session.attach().await.unwrap();

    let start = Instant::now();
    session.connect().await.unwrap();
    let connected = Instant::now();
    session.disconnect().await;
    let disconnected = Instant::now();

    let at = session.link().sent_at();
    assert_eq!(session.link().sent(), ["command", "streamon", "streamoff"]);
    assert!(at[1] - at[0] >= Duration::from_millis(300));
    assert!(connected - at[1] >= Duration::from_millis(300));
    assert!(connected - start >= Duration::from_millis(600));
    assert!(disconnected - at[2] >= Duration::from_millis(100));
}
