//! Dual-socket UDP link to the drone.
//!
//! The drone answers commands from its command port but pushes its state
//! broadcast from a different one, so the link keeps two sockets:
//!
//! ```text
//!                 "command" / "takeoff" / ...
//!  command socket ───────────────────────────────▶ drone :8889
//!   (local :9000) ◀─────────────────────────────── "ok" / "error"   (logged)
//!
//!    state socket ◀─────────────────────────────── "bat:87;time:125;..."
//!   (local :8890)        │
//!                        ▼ telemetry::decode
//!                   LinkEvent channel ──▶ single consumer (the session)
//! ```
//!
//! Both sockets are bound together or not at all.  Each has a listener task;
//! a receive error on either one emits a single
//! [`LinkEvent::TransportError`] and closes the whole link.  Nothing is
//! retried automatically.
//!
//! [`UdpLink`] is generic over [`DatagramSocket`] so tests can stand in a
//! socket that fails on demand; production code uses [`Socket`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::LinkConfig;
use crate::error::{LinkError, SocketRole};
use crate::socket::{DatagramSocket, Socket};
use crate::telemetry::{self, TelemetrySnapshot};

/// Something the link has to report to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A state broadcast decoded into at least one field.
    Telemetry(TelemetrySnapshot),
    /// A socket failed while receiving.  The link has closed itself.
    TransportError { socket: SocketRole, message: String },
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;
pub type LinkEventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

/// Create the channel handed to [`DroneLink::open`].
pub fn link_event_channel() -> (LinkEventSender, LinkEventReceiver) {
    mpsc::unbounded_channel()
}

/// Operations the session needs from a link.
#[async_trait]
pub trait DroneLink: Send + Sync {
    /// Bind both sockets and start delivering events on `events`.
    ///
    /// An already-open link is closed first.  On failure nothing stays bound.
    async fn open(&self, events: LinkEventSender) -> Result<(), LinkError>;

    /// Send one text command to the drone.  Resolves on local transmission.
    async fn send(&self, command: &str) -> Result<(), LinkError>;

    /// Tear down whatever is bound.  Never fails; a no-op when closed.
    async fn close(&self);

    /// `true` while the link can send.
    fn is_open(&self) -> bool;
}

/// The production [`DroneLink`] over two UDP sockets.
pub struct UdpLink<S = Socket> {
    config: LinkConfig,
    inner: Arc<Mutex<LinkInner<S>>>,
}

struct LinkInner<S> {
    /// Bumped on every successful open; listeners carry the value they were
    /// started with so a stale one can never close a newer pair.
    generation: u64,
    bound: Option<BoundPair<S>>,
}

struct BoundPair<S> {
    generation: u64,
    command: Arc<S>,
    state: Arc<S>,
    events: LinkEventSender,
    listeners: Vec<JoinHandle<()>>,
}

impl<S> BoundPair<S> {
    /// Stop both listeners and drop the event sender.
    ///
    /// The sockets are released once the aborted listeners have finished;
    /// await the returned handles to be sure of that.
    fn abort(self) -> Vec<JoinHandle<()>> {
        for handle in &self.listeners {
            handle.abort();
        }
        self.listeners
    }
}

impl UdpLink {
    pub fn new(config: LinkConfig) -> Self {
        Self::with_socket(config)
    }
}

impl<S: DatagramSocket> UdpLink<S> {
    /// A link whose sockets are bound through `S`.
    pub fn with_socket(config: LinkConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(LinkInner {
                generation: 0,
                bound: None,
            })),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// `(command, state)` local addresses while open.
    pub fn local_addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        lock(&self.inner)
            .bound
            .as_ref()
            .map(|b| (b.command.local_addr(), b.state.local_addr()))
    }

    async fn bind_pair(&self) -> Result<(S, S), LinkError> {
        log::info!("[link] binding command socket on {}", self.config.command_bind);
        let command = S::bind(self.config.command_bind)
            .await
            .map_err(|source| LinkError::Bind {
                which: SocketRole::Command,
                source,
            })?;

        log::info!("[link] binding state socket on {}", self.config.state_bind);
        match S::bind(self.config.state_bind).await {
            Ok(state) => Ok((command, state)),
            Err(source) => {
                // Never leave a half-open pair behind.
                drop(command);
                Err(LinkError::Bind {
                    which: SocketRole::State,
                    source,
                })
            }
        }
    }
}

#[async_trait]
impl<S: DatagramSocket> DroneLink for UdpLink<S> {
    async fn open(&self, events: LinkEventSender) -> Result<(), LinkError> {
        if self.is_open() {
            log::warn!("[link] sockets already bound; closing before re-opening");
            self.close().await;
        }

        let (command, state) = match self.bind_pair().await {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("[link] {e}");
                return Err(e);
            }
        };
        let command = Arc::new(command);
        let state = Arc::new(state);

        let stale = {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            let generation = inner.generation;

            let listeners = vec![
                tokio::spawn(listen::<S>(
                    SocketRole::Command,
                    Arc::clone(&command),
                    generation,
                    Arc::clone(&self.inner),
                )),
                tokio::spawn(listen::<S>(
                    SocketRole::State,
                    Arc::clone(&state),
                    generation,
                    Arc::clone(&self.inner),
                )),
            ];

            log::info!(
                "[link] open: command {} / state {} -> peer {}",
                command.local_addr(),
                state.local_addr(),
                self.config.peer
            );
            inner.bound.replace(BoundPair {
                generation,
                command,
                state,
                events,
                listeners,
            })
        };

        // Only reachable when two opens raced past the initial close.
        if let Some(old) = stale {
            log::warn!("[link] replaced a concurrently opened socket pair");
            old.abort();
        }
        Ok(())
    }

    async fn send(&self, command: &str) -> Result<(), LinkError> {
        let socket = lock(&self.inner).bound.as_ref().map(|b| Arc::clone(&b.command));
        let Some(socket) = socket else {
            log::error!("[link] send({command:?}) called but command socket is not bound");
            return Err(LinkError::NotOpen);
        };

        log::info!("[link] → {command}");
        socket
            .send_to(command.as_bytes(), self.config.peer)
            .await
            .map_err(|source| {
                log::error!("[link] failed to send {command:?}: {source}");
                LinkError::Send {
                    command: command.to_string(),
                    source,
                }
            })
    }

    async fn close(&self) {
        let pair = lock(&self.inner).bound.take();
        let Some(pair) = pair else {
            log::debug!("[link] close called but no sockets are bound");
            return;
        };

        log::info!("[link] closing sockets");
        for handle in pair.abort() {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => log::error!("[link] listener task failed during close: {e}"),
            }
        }
        log::info!("[link] closed");
    }

    fn is_open(&self) -> bool {
        lock(&self.inner).bound.is_some()
    }
}

impl<S> Drop for UdpLink<S> {
    fn drop(&mut self) {
        if let Some(pair) = lock(&self.inner).bound.take() {
            pair.abort();
        }
    }
}

fn lock<S>(inner: &Mutex<LinkInner<S>>) -> MutexGuard<'_, LinkInner<S>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Receive loop for one socket.
///
/// Exits on the first receive error after reporting it and closing the link
/// it belongs to.
async fn listen<S: DatagramSocket>(
    role: SocketRole,
    socket: Arc<S>,
    generation: u64,
    inner: Arc<Mutex<LinkInner<S>>>,
) {
    loop {
        let (payload, from) = match socket.recv_from().await {
            Ok(v) => v,
            Err(e) => {
                log::error!("[link] UDP {role} socket error: {e}");
                fail(&inner, generation, role, e.to_string());
                return;
            }
        };

        match role {
            SocketRole::Command => {
                log::info!(
                    "[link] drone response: {:?} from {from}",
                    String::from_utf8_lossy(&payload).trim()
                );
            }
            SocketRole::State => match telemetry::decode(&payload) {
                Ok(snapshot) => {
                    let events = lock(&inner)
                        .bound
                        .as_ref()
                        .filter(|b| b.generation == generation)
                        .map(|b| b.events.clone());
                    match events {
                        Some(tx) if tx.send(LinkEvent::Telemetry(snapshot)).is_ok() => {}
                        _ => log::trace!("[link] telemetry dropped; nobody is listening"),
                    }
                }
                Err(e) if e.is_noise() => log::trace!("[link] ignored state datagram: {e}"),
                Err(e) => log::warn!("[link] dropped state datagram: {e}"),
            },
        }
    }
}

/// Report a transport error once and tear the pair down, if the pair is
/// still the one this listener was started for.
fn fail<S>(inner: &Mutex<LinkInner<S>>, generation: u64, role: SocketRole, message: String) {
    let pair = {
        let mut guard = lock(inner);
        match guard.bound.as_ref() {
            Some(b) if b.generation == generation => guard.bound.take(),
            _ => None,
        }
    };
    let Some(pair) = pair else {
        log::debug!("[link] {role} listener from a closed pair exited");
        return;
    };

    let _ = pair.events.send(LinkEvent::TransportError {
        socket: role,
        message: format!("UDP {role} socket error: {message}"),
    });
    log::warn!("[link] closing link after {role} socket failure");
    pair.abort();
}
