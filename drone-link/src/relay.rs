//! Supervisor for the external video relay process.
//!
//! The drone pushes a raw H264 elementary stream to a local UDP port.  A
//! transcoder (ffmpeg by default) reads that port and serves the stream as
//! MPEG-TS over HTTP so a player can open it.  [`RelaySupervisor`] owns at
//! most one such process at a time.
//!
//! # Lifecycle
//!
//! ```text
//!  start(port) ──spawn──▶ session #n current ──exit──▶ RelayEvent::Completed
//!                               │                       (Success / Failed)
//!                             stop()
//!                               │
//!                               ▼
//!                        kill requested ──exit──▶ RelayEvent::Completed
//!                                                  (Cancelled)
//! ```
//!
//! `start` resolves as soon as the process is spawned, so a failure that
//! happens later can only be observed through the completion event.  The
//! supervisor keeps the tail of the process's stderr for that report.

use std::collections::VecDeque;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};

use crate::config::RelayConfig;
use crate::error::RelayError;

/// Identifier of one relay process run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a relay session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The process exited with status 0.
    Success,
    /// The process was stopped on request.
    Cancelled,
    /// The process exited on its own with a failure status.
    Failed {
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// Trailing stderr lines of the process.
        output: String,
    },
}

/// Completion report of one relay session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Completed { id: SessionId, outcome: RelayOutcome },
}

pub type RelayEventSender = mpsc::UnboundedSender<RelayEvent>;
pub type RelayEventReceiver = mpsc::UnboundedReceiver<RelayEvent>;

pub fn relay_event_channel() -> (RelayEventSender, RelayEventReceiver) {
    mpsc::unbounded_channel()
}

/// Operations the session needs from a video relay.
#[async_trait]
pub trait VideoRelay: Send + Sync {
    /// Launch a relay serving on `output_port`, replacing any current one.
    ///
    /// Resolves once the process is running, not when it finishes.
    async fn start(&self, output_port: u16) -> Result<SessionId, RelayError>;

    /// Ask the current session, if any, to stop.  Best-effort; never fails.
    async fn stop(&self);
}

struct Current {
    id: SessionId,
    /// Firing or dropping this kills the process.
    cancel: oneshot::Sender<()>,
}

/// The production [`VideoRelay`] running an OS process.
pub struct RelaySupervisor {
    config: RelayConfig,
    events: RelayEventSender,
    next_id: AtomicU64,
    current: Arc<Mutex<Option<Current>>>,
}

impl RelaySupervisor {
    /// Completion events for every session are delivered on `events`.
    pub fn new(config: RelayConfig, events: RelayEventSender) -> Self {
        Self {
            config,
            events,
            next_id: AtomicU64::new(0),
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Id of the most recently started session still considered running.
    pub fn current(&self) -> Option<SessionId> {
        lock(&self.current).as_ref().map(|c| c.id)
    }

    fn command(&self, output_port: u16) -> Command {
        let args = self.config.render_args(output_port);
        log::info!("[relay] starting: {} {}", self.config.program, args.join(" "));

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl VideoRelay for RelaySupervisor {
    async fn start(&self, output_port: u16) -> Result<SessionId, RelayError> {
        if let Some(previous) = self.current() {
            log::warn!("[relay] session {previous} still current; cancelling it first");
            self.stop().await;
        }

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let child = self.command(output_port).spawn().map_err(|source| {
            log::error!("[relay] failed to start session {id}: {source}");
            RelayError::Launch {
                program: self.config.program.clone(),
                source,
            }
        })?;

        let (cancel, cancel_rx) = oneshot::channel();
        if let Some(raced) = lock(&self.current).replace(Current { id, cancel }) {
            // Another start slipped in between our stop and spawn.
            log::warn!("[relay] session {} replaced by {id}; cancelling it", raced.id);
            let _ = raced.cancel.send(());
        }
        log::info!("[relay] session {id} running (pid {:?})", child.id());

        tokio::spawn(supervise(
            id,
            child,
            cancel_rx,
            Arc::clone(&self.current),
            self.events.clone(),
            self.config.log_tail,
        ));
        Ok(id)
    }

    async fn stop(&self) {
        // Clear before cancelling so a completion racing with us can only
        // ever match its own id.
        let current = lock(&self.current).take();
        let Some(current) = current else {
            log::debug!("[relay] stop called but no session is current");
            return;
        };

        log::info!("[relay] cancelling session {}", current.id);
        if current.cancel.send(()).is_err() {
            log::warn!("[relay] {}", RelayError::Cancel(current.id));
        }
    }
}

fn lock(current: &Mutex<Option<Current>>) -> MutexGuard<'_, Option<Current>> {
    current.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait for one relay process to end, then report how it ended.
async fn supervise(
    id: SessionId,
    mut child: Child,
    cancel_rx: oneshot::Receiver<()>,
    current: Arc<Mutex<Option<Current>>>,
    events: RelayEventSender,
    log_tail: usize,
) {
    let output = tokio::spawn(collect_output(id, child.stderr.take(), log_tail));

    let mut cancelled = false;
    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel_rx => {
            cancelled = true;
            if let Err(e) = child.start_kill() {
                log::warn!("[relay] kill of session {id} failed: {e}");
            }
            child.wait().await
        }
    };

    // A killed process may leave children holding stderr open; the tail
    // only matters for failures anyway.
    let tail = if cancelled {
        output.abort();
        String::new()
    } else {
        match output.await {
            Ok(lines) => lines.into_iter().collect::<Vec<_>>().join("\n"),
            Err(e) => {
                log::warn!("[relay] output collector of session {id} failed: {e}");
                String::new()
            }
        }
    };

    {
        let mut guard = lock(&current);
        if guard.as_ref().is_some_and(|c| c.id == id) {
            guard.take();
        }
    }

    let outcome = match status {
        _ if cancelled => RelayOutcome::Cancelled,
        Ok(status) if status.success() => RelayOutcome::Success,
        Ok(status) => RelayOutcome::Failed {
            code: status.code(),
            output: tail,
        },
        Err(e) => RelayOutcome::Failed {
            code: None,
            output: format!("waiting for relay process failed: {e}"),
        },
    };

    match &outcome {
        RelayOutcome::Success => log::info!("[relay] session {id} finished successfully"),
        RelayOutcome::Cancelled => log::info!("[relay] session {id} cancelled"),
        RelayOutcome::Failed { code, output } => {
            log::error!("[relay] session {id} failed (exit code {code:?})");
            log::error!("------ relay output start ------");
            log::error!("{}", if output.is_empty() { "no output captured" } else { output.as_str() });
            log::error!("------ relay output end --------");
        }
    }

    if events.send(RelayEvent::Completed { id, outcome }).is_err() {
        log::debug!("[relay] completion of session {id} dropped; nobody is listening");
    }
}

/// Stream the process's stderr to the debug log, keeping the last
/// `log_tail` lines.
async fn collect_output(
    id: SessionId,
    stderr: Option<ChildStderr>,
    log_tail: usize,
) -> VecDeque<String> {
    let mut tail = VecDeque::with_capacity(log_tail.min(64));
    let Some(stderr) = stderr else {
        return tail;
    };

    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                log::debug!("[relay {id}] {line}");
                if log_tail == 0 {
                    continue;
                }
                if tail.len() == log_tail {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                log::debug!("[relay {id}] output stream error: {e}");
                break;
            }
        }
    }
    tail
}
