//! All Deck-Link protocol message types.
//!
//! Every message travels as one JSON object (see [`codec`](super::codec)).
//! The `type` field selects a variant of [`Message`]; each variant carries a
//! fixed payload shape.  Messages are stateless: the only session context
//! on the wire is the `session_id`, present from `challenge_response` onward.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::peer::DeviceType;
use crate::domain::session::SessionId;

/// Largest frame the codec will attempt to parse, in bytes.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

// ── Message type discriminators ───────────────────────────────────────────────

/// Value of the `type` field on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    // Pairing handshake
    ConnectionRequest,
    ChallengeResponse,
    AuthAttempt,
    AuthResult,
    // Connection management
    Ping,
    Pong,
    Disconnect,
    Error,
    // Payload traffic
    Notification,
}

impl MessageType {
    pub const ALL: [MessageType; 9] = [
        MessageType::ConnectionRequest,
        MessageType::ChallengeResponse,
        MessageType::AuthAttempt,
        MessageType::AuthResult,
        MessageType::Ping,
        MessageType::Pong,
        MessageType::Disconnect,
        MessageType::Error,
        MessageType::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ConnectionRequest => "connection_request",
            MessageType::ChallengeResponse => "challenge_response",
            MessageType::AuthAttempt => "auth_attempt",
            MessageType::AuthResult => "auth_result",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Disconnect => "disconnect",
            MessageType::Error => "error",
            MessageType::Notification => "notification",
        }
    }

    /// Messages that must carry the envelope `session_id`.
    pub fn is_session_bound(&self) -> bool {
        matches!(
            self,
            MessageType::ChallengeResponse | MessageType::AuthAttempt | MessageType::AuthResult
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Error codes ───────────────────────────────────────────────────────────────

/// Machine-readable reason carried by an `error` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The receiver already has a session or a bound connection.
    AlreadyConnected,
    /// An `auth_attempt` arrived with no matching challenge.
    NoSession,
    /// A `session_id` did not match the active session.
    InvalidSession,
    /// The receiver is in an error state and is not accepting pairings.
    Unavailable,
    /// The frame could not be decoded.
    InvalidMessage,
    /// Anything else, including codes added by newer peers.
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AlreadyConnected => "already_connected",
            ErrorCode::NoSession => "no_session",
            ErrorCode::InvalidSession => "invalid_session",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::InvalidMessage => "invalid_message",
            ErrorCode::Unknown => "unknown",
        }
    }
}

// ── Per-message payload structs ───────────────────────────────────────────────

/// CONNECTION_REQUEST: the initiator introduces itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequestMessage {
    pub device_name: String,
    pub device_type: DeviceType,
}

/// CHALLENGE_RESPONSE: the receiver has put a passphrase on its screen.
///
/// The passphrase itself is never sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeResponseMessage {
    pub session_id: SessionId,
    /// The receiver's device name.
    pub peer_name: String,
}

/// AUTH_ATTEMPT: the word typed on the initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAttemptMessage {
    pub session_id: SessionId,
    pub passphrase: String,
}

/// AUTH_RESULT: the receiver's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResultMessage {
    pub session_id: SessionId,
    pub success: bool,
    pub reason: Option<String>,
}

/// NOTIFICATION: a user-visible message for the peer's screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// ERROR: the sender refused something.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    #[serde(default)]
    pub message: String,
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// The closed set of protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ConnectionRequest(ConnectionRequestMessage),
    ChallengeResponse(ChallengeResponseMessage),
    AuthAttempt(AuthAttemptMessage),
    AuthResult(AuthResultMessage),
    Ping,
    Pong,
    /// Graceful close announced before the socket goes away.
    Disconnect { reason: Option<String> },
    Error(ErrorMessage),
    Notification(NotificationMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ConnectionRequest(_) => MessageType::ConnectionRequest,
            Message::ChallengeResponse(_) => MessageType::ChallengeResponse,
            Message::AuthAttempt(_) => MessageType::AuthAttempt,
            Message::AuthResult(_) => MessageType::AuthResult,
            Message::Ping => MessageType::Ping,
            Message::Pong => MessageType::Pong,
            Message::Disconnect { .. } => MessageType::Disconnect,
            Message::Error(_) => MessageType::Error,
            Message::Notification(_) => MessageType::Notification,
        }
    }

    /// The envelope `session_id`, for the variants that carry one.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Message::ChallengeResponse(m) => Some(m.session_id),
            Message::AuthAttempt(m) => Some(m.session_id),
            Message::AuthResult(m) => Some(m.session_id),
            _ => None,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Message::Error(ErrorMessage {
            code,
            message: message.into(),
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
