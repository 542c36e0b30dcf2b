//! The pairing state machine.
//!
//! [`SessionManager`] is a synchronous transition function.  It never touches
//! a socket or a clock on its own: the daemon feeds it local commands,
//! [`LinkEvent`]s from the transport and keepalive ticks, and executes the
//! ordered [`Effect`]s it returns.
//!
//! # Why effects instead of callbacks (for beginners)
//!
//! Returning a `Vec<Effect>` keeps every transition testable without a
//! network: a test calls `handle_link(...)` and asserts on the exact frames
//! that would be sent and the exact events the UI would see, in order.

pub mod events;
pub mod manager;

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::domain::peer::DeviceType;
use crate::domain::session::{ConnectionState, PeerInfo, SessionId};

pub use events::{Effect, LinkEvent, SessionEvent};
pub use manager::SessionManager;

/// How this device presents itself to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub device_name: String,
    pub device_type: DeviceType,
    /// Port the local listener is bound to.  Reported in status only.
    pub port: u16,
}

/// PING cadence and loss detection while connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Time between PINGs.
    pub interval: Duration,
    /// A PING unanswered for this long means the peer is gone.
    pub timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Identifies one outbound connection attempt so a late result for an
/// abandoned attempt can be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(pub u64);

/// A local command that is not valid right now.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// `connect()` while a session already exists.
    #[error("a session is already active (state: {state})")]
    SessionActive { state: ConnectionState },

    /// The command is not accepted in the current state.
    #[error("{command} is not valid in state {state}")]
    InvalidState {
        command: &'static str,
        state: ConnectionState,
    },

    /// `submit_passphrase()` after an attempt was already sent.
    #[error("a passphrase attempt is already awaiting its result")]
    AttemptPending,

    /// `submit_passphrase()` with nothing but whitespace.
    #[error("passphrase is empty")]
    EmptyPassphrase,

    /// `connect()` with an empty host.
    #[error("host is empty")]
    EmptyHost,

    /// `send_notification()` without an authenticated session.
    #[error("not connected")]
    NotConnected,
}

/// Read-only view returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub device_name: String,
    pub device_type: DeviceType,
    pub port: u16,
    pub peer: Option<PeerInfo>,
    pub session_id: Option<SessionId>,
}
