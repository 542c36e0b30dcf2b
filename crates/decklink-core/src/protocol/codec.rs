//! JSON codec for encoding and decoding Deck-Link protocol messages.
//!
//! Wire format, one JSON object per WebSocket text frame:
//! ```text
//! {"type": "<kind>", "payload": {...}, "session_id": "<uuid>", "timestamp": 1700000000.25}
//! ```
//! The frame is modelled as an [`Envelope`] whose `type`/`payload` pair is an
//! adjacently tagged enum, so field names and types are checked by serde.
//! `session_id` is required only on the handshake replies
//! ([`MessageType::is_session_bound`]) and ignored elsewhere.  Unknown extra
//! fields are ignored.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::error::Category;
use thiserror::Error;

use crate::domain::session::SessionId;
use crate::protocol::messages::{
    AuthAttemptMessage, AuthResultMessage, ChallengeResponseMessage, ConnectionRequestMessage,
    ErrorMessage, Message, MessageType, NotificationMessage, MAX_FRAME_LEN,
};

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    /// The frame is not well-formed JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// Well-formed JSON that is not a known message: not an object, an
    /// unknown `type`, or a payload field that is missing or mistyped.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// A handshake reply arrived without its envelope `session_id`.
    #[error("{0} frame has no session_id")]
    MissingSessionId(MessageType),

    /// The frame exceeds [`MAX_FRAME_LEN`].
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Serialisation failed while encoding.
    #[error("serialization failed: {0}")]
    Serialize(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        match e.classify() {
            Category::Data => ProtocolError::InvalidFrame(e.to_string()),
            _ => ProtocolError::InvalidJson(e.to_string()),
        }
    }
}

// ── Wire model ────────────────────────────────────────────────────────────────

/// One frame as it appears on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(flatten)]
    body: Body,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<SessionId>,
    #[serde(default)]
    timestamp: f64,
}

/// The `type` discriminator and its `payload`.
///
/// Kinds that carry nothing (or only optional fields) accept a missing or
/// `null` payload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
enum Body {
    ConnectionRequest(ConnectionRequestMessage),
    ChallengeResponse(PeerNamePayload),
    AuthAttempt(PassphrasePayload),
    AuthResult(VerdictPayload),
    Ping(Option<EmptyPayload>),
    Pong(Option<EmptyPayload>),
    Disconnect(Option<ReasonPayload>),
    Error(ErrorMessage),
    Notification(NotificationMessage),
}

#[derive(Debug, Serialize, Deserialize)]
struct PeerNamePayload {
    peer_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PassphrasePayload {
    passphrase: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct VerdictPayload {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EmptyPayload {}

#[derive(Debug, Serialize, Deserialize)]
struct ReasonPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl Envelope {
    fn new(msg: &Message, timestamp: f64) -> Self {
        let body = match msg.clone() {
            Message::ConnectionRequest(m) => Body::ConnectionRequest(m),
            Message::ChallengeResponse(m) => Body::ChallengeResponse(PeerNamePayload {
                peer_name: m.peer_name,
            }),
            Message::AuthAttempt(m) => Body::AuthAttempt(PassphrasePayload {
                passphrase: m.passphrase,
            }),
            Message::AuthResult(m) => Body::AuthResult(VerdictPayload {
                success: m.success,
                reason: m.reason,
            }),
            Message::Ping => Body::Ping(Some(EmptyPayload::default())),
            Message::Pong => Body::Pong(Some(EmptyPayload::default())),
            Message::Disconnect { reason } => Body::Disconnect(Some(ReasonPayload { reason })),
            Message::Error(m) => Body::Error(m),
            Message::Notification(m) => Body::Notification(m),
        };
        Self {
            body,
            session_id: msg.session_id(),
            timestamp,
        }
    }
}

impl TryFrom<Envelope> for Message {
    type Error = ProtocolError;

    fn try_from(frame: Envelope) -> Result<Self, ProtocolError> {
        let Envelope {
            body, session_id, ..
        } = frame;
        let bound = |kind: MessageType| session_id.ok_or(ProtocolError::MissingSessionId(kind));

        let msg = match body {
            Body::ConnectionRequest(m) => Message::ConnectionRequest(m),
            Body::ChallengeResponse(p) => Message::ChallengeResponse(ChallengeResponseMessage {
                session_id: bound(MessageType::ChallengeResponse)?,
                peer_name: p.peer_name,
            }),
            Body::AuthAttempt(p) => Message::AuthAttempt(AuthAttemptMessage {
                session_id: bound(MessageType::AuthAttempt)?,
                passphrase: p.passphrase,
            }),
            Body::AuthResult(p) => Message::AuthResult(AuthResultMessage {
                session_id: bound(MessageType::AuthResult)?,
                success: p.success,
                reason: p.reason,
            }),
            Body::Ping(_) => Message::Ping,
            Body::Pong(_) => Message::Pong,
            Body::Disconnect(p) => Message::Disconnect {
                reason: p.and_then(|p| p.reason),
            },
            Body::Error(m) => Message::Error(m),
            Body::Notification(m) => Message::Notification(m),
        };
        Ok(msg)
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`Message`] into one JSON text frame.
///
/// `timestamp` is seconds since the Unix epoch; use [`encode_message_now`]
/// to stamp with the current wall-clock time.
///
/// # Errors
///
/// Returns [`ProtocolError::Serialize`] if JSON serialisation fails.
///
/// # Examples
///
/// ```rust
/// use decklink_core::protocol::{decode_message, encode_message, Message};
///
/// let text = encode_message(&Message::Ping, 0.0).unwrap();
/// assert_eq!(decode_message(&text).unwrap(), Message::Ping);
/// ```
pub fn encode_message(msg: &Message, timestamp: f64) -> Result<String, ProtocolError> {
    serde_json::to_string(&Envelope::new(msg, timestamp))
        .map_err(|e| ProtocolError::Serialize(e.to_string()))
}

/// Encodes a [`Message`] stamped with the current time.
pub fn encode_message_now(msg: &Message) -> Result<String, ProtocolError> {
    encode_message(msg, unix_now())
}

/// Decodes one JSON text frame into a [`Message`].
///
/// # Errors
///
/// Returns a [`ProtocolError`] describing the first problem found.  Never
/// panics on arbitrary input.
pub fn decode_message(text: &str) -> Result<Message, ProtocolError> {
    if text.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let frame: Envelope = serde_json::from_str(text)?;
    Message::try_from(frame)
}

/// Seconds since the Unix epoch as a float, the format of the `timestamp` field.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
