//! Inputs from the transport, outputs to the daemon, and UI-facing events.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::domain::session::{ConnectionId, ConnectionState, SessionId};
use crate::pairing::AttemptId;
use crate::protocol::codec::ProtocolError;
use crate::protocol::messages::Message;

/// Something that happened on a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The listener accepted a connection.
    InboundAccepted {
        conn: ConnectionId,
        remote: SocketAddr,
    },
    /// An [`Effect::OpenOutbound`] succeeded.
    OutboundOpened { attempt: AttemptId, conn: ConnectionId },
    /// An [`Effect::OpenOutbound`] failed or timed out.
    OutboundFailed { attempt: AttemptId, error: String },
    /// A frame was decoded.
    Received { conn: ConnectionId, message: Message },
    /// A frame arrived but could not be decoded.  The frame is dropped.
    Malformed {
        conn: ConnectionId,
        error: ProtocolError,
    },
    /// The peer closed the connection cleanly.
    Closed { conn: ConnectionId },
    /// The connection broke.
    Failed { conn: ConnectionId, error: String },
}

/// Work the daemon must carry out, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Dial `ws://host:port` and report back with the same `attempt`.
    OpenOutbound {
        attempt: AttemptId,
        host: String,
        port: u16,
    },
    /// Queue a frame on a connection.
    Send { conn: ConnectionId, message: Message },
    /// Close a connection after everything queued before it is flushed.
    Close { conn: ConnectionId },
    /// Publish an event to the UI.
    Emit(SessionEvent),
}

/// Lifecycle notifications for the UI collaborator.
///
/// Serialises as `{"event": "<name>", "data": {...}}`, which is also the
/// IPC bridge's event line format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        old: ConnectionState,
        new: ConnectionState,
    },
    /// Receiver: show `passphrase` on screen.
    ChallengeGenerated {
        session_id: SessionId,
        passphrase: String,
        peer_name: String,
    },
    /// Initiator: ask the human for the word shown on the peer.
    PassphraseRequired {
        session_id: SessionId,
        peer_name: String,
    },
    Connected {
        peer_name: String,
        peer_ip: String,
    },
    Disconnected {},
    AuthFailed {
        reason: String,
    },
    ConnectionError {
        error: String,
    },
    Notification {
        title: String,
        body: String,
    },
}

impl SessionEvent {
    /// The `event` tag as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::StateChanged { .. } => "state_changed",
            SessionEvent::ChallengeGenerated { .. } => "challenge_generated",
            SessionEvent::PassphraseRequired { .. } => "passphrase_required",
            SessionEvent::Connected { .. } => "connected",
            SessionEvent::Disconnected {} => "disconnected",
            SessionEvent::AuthFailed { .. } => "auth_failed",
            SessionEvent::ConnectionError { .. } => "connection_error",
            SessionEvent::Notification { .. } => "notification",
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
