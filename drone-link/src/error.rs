//! Error types for every layer of the link.
//!
//! Each component reports its own enum; [`SessionError`] wraps them at the
//! orchestrator boundary.  Errors that only ever reach a log line
//! (telemetry decode failures, cleanup failures during disconnect) still get
//! a variant here so the log text is produced in one place.

use std::io;

use thiserror::Error;

use crate::relay::SessionId;

/// Which of the two link sockets an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketRole {
    /// Sends commands, receives acknowledgements.
    Command,
    /// Receives the periodic state broadcast.
    State,
}

impl std::fmt::Display for SocketRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command => f.write_str("command"),
            Self::State => f.write_str("state"),
        }
    }
}

/// Errors raised by [`crate::link::UdpLink`].
#[derive(Debug, Error)]
pub enum LinkError {
    /// Binding one of the two sockets failed; the other one was torn down.
    #[error("UDP {which} socket bind failed: {source}")]
    Bind {
        which: SocketRole,
        #[source]
        source: io::Error,
    },

    /// `send` was called while the command socket is absent.
    #[error("command socket not initialized")]
    NotOpen,

    /// The datagram could not be handed to the OS.
    #[error("failed to send '{command}': {source}")]
    Send {
        command: String,
        #[source]
        source: io::Error,
    },
}

/// A state broadcast that could not be turned into a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Non-empty input that produced no `key:value` field.
    #[error("malformed state broadcast: {0:?}")]
    Invalid(String),
}

/// Errors raised by [`crate::relay::RelaySupervisor`].
#[derive(Debug, Error)]
pub enum RelayError {
    /// The host refused to start the relay process.
    #[error("failed to start video relay '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The cancel request found the process already gone.  Only ever logged.
    #[error("could not cancel relay session {0}: process already exited")]
    Cancel(SessionId),
}

/// Errors returned by [`crate::session::Session`] operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    /// A flight command was requested outside the `Streaming` phase.
    #[error("drone not connected")]
    NotConnected,
}
