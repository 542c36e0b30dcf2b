//! The single active pairing context.
//!
//! A [`Session`] exists from the moment a pairing attempt starts (a local
//! `connect()` on the initiator, an inbound `connection_request` on the
//! receiver) until it reaches a terminal state.  Only the
//! [`SessionManager`](crate::pairing::SessionManager) creates, mutates and
//! destroys sessions.
//!
//! # Lifecycle
//!
//! ```text
//!   initiator                                   receiver
//!   ─────────                                   ────────
//!   disconnected                                disconnected
//!     │ connect()                                 │ connection_request
//!     ▼                                           ▼
//!   awaiting_challenge ◄──── challenge_response ── challenge_sent
//!     │                                           │
//!     ▼                                           │
//!   awaiting_auth_input ───── auth_attempt ──────►│
//!     │                                           │
//!     ◄──────────────────────── auth_result ──────┤
//!     ▼                                           ▼
//!   connected                                   connected
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::peer::DeviceType;

/// State of the pairing state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No session.  Initial state and normal terminal state.
    Disconnected,
    /// Initiator: outbound connection requested, waiting for the challenge.
    AwaitingChallenge,
    /// Receiver: challenge issued, passphrase on screen, waiting for the attempt.
    ChallengeSent,
    /// Initiator: the human must type the passphrase shown on the receiver.
    AwaitingAuthInput,
    /// Authenticated session.
    Connected,
    /// A transport or protocol failure ended the session.  Leaves only via
    /// `disconnect()`.
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::AwaitingChallenge => "awaiting_challenge",
            ConnectionState::ChallengeSent => "challenge_sent",
            ConnectionState::AwaitingAuthInput => "awaiting_auth_input",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the handshake this process plays.  Fixed for a session's
/// whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Receiver,
}

/// Opaque token minted by the receiver when it issues a challenge.
///
/// Binds the `auth_attempt` and `auth_result` that follow to that particular
/// challenge.  Random UUIDv4, so collisions across attempts are not a
/// practical concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Transport-assigned handle for one open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What is known about the counterpart of the active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Display name; empty until the counterpart has introduced itself.
    pub name: String,
    /// Host or IP address of the counterpart.
    pub host: String,
    pub port: u16,
    /// Only the receiver learns this (from `connection_request`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
}

/// The single active pairing context.
#[derive(Debug, Clone)]
pub struct Session {
    pub role: Role,
    pub state: ConnectionState,
    pub session_id: Option<SessionId>,
    pub peer: Option<PeerInfo>,
    /// Receiver only: the word displayed on this device's screen.
    pub expected_passphrase: Option<String>,
    /// Initiator only: the word the human typed, held until the result arrives.
    pub entered_passphrase: Option<String>,
}

impl Session {
    /// A session started by a local `connect()`.
    pub fn initiator(peer: PeerInfo) -> Self {
        Self {
            role: Role::Initiator,
            state: ConnectionState::AwaitingChallenge,
            session_id: None,
            peer: Some(peer),
            expected_passphrase: None,
            entered_passphrase: None,
        }
    }

    /// A session started by an inbound `connection_request`.
    pub fn receiver(peer: PeerInfo, session_id: SessionId, passphrase: String) -> Self {
        Self {
            role: Role::Receiver,
            state: ConnectionState::ChallengeSent,
            session_id: Some(session_id),
            peer: Some(peer),
            expected_passphrase: Some(passphrase),
            entered_passphrase: None,
        }
    }

    /// Drops both passphrase fields.
    pub fn clear_secrets(&mut self) {
        self.expected_passphrase = None;
        self.entered_passphrase = None;
    }

    pub fn peer_name(&self) -> &str {
        self.peer.as_ref().map(|p| p.name.as_str()).unwrap_or("")
    }

    pub fn peer_host(&self) -> &str {
        self.peer.as_ref().map(|p| p.host.as_str()).unwrap_or("")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
