//! # decklink-core
//!
//! Shared library for Deck-Link containing the wire protocol codec, the
//! passphrase generator, domain entities, and the pairing state machine.
//!
//! This crate has zero dependencies on sockets, async runtimes, or UI
//! frameworks.  The daemon crate feeds it events and executes the effects it
//! returns.
//!
//! # Architecture overview
//!
//! Deck-Link pairs two machines on a local network (a handheld "deck" and a
//! laptop) into one trusted session.  Instead of certificates, the receiving
//! device shows a short word on its screen and the human operating the
//! initiating device types it in.
//!
//! - **`protocol`** – The message set and its JSON framing.  Every frame is a
//!   JSON object with a `type` discriminator and a named-field payload.
//!
//! - **`passphrase`** – The fixed wordlist and the matching rule used to
//!   confirm the word typed by the human.
//!
//! - **`domain`** – Plain data: peers, device types, session identifiers and
//!   the [`ConnectionState`] enum.
//!
//! - **`pairing`** – The [`SessionManager`]: a synchronous transition
//!   function that owns the single active session and turns inputs into an
//!   ordered list of [`Effect`]s.

pub mod domain;
pub mod pairing;
pub mod passphrase;
pub mod protocol;

pub use domain::peer::{DeviceType, Peer};
pub use domain::session::{ConnectionId, ConnectionState, PeerInfo, Role, Session, SessionId};
pub use pairing::{
    AttemptId, CommandError, Effect, KeepaliveConfig, LinkEvent, LocalIdentity, SessionEvent,
    SessionManager, StatusSnapshot,
};
pub use passphrase::{generate_passphrase, passphrases_match};
pub use protocol::codec::{decode_message, encode_message, encode_message_now, ProtocolError};
pub use protocol::messages::Message;

/// Default TCP port the daemon listens on.
pub const DEFAULT_PORT: u16 = 52525;

/// mDNS service type advertised by every Deck-Link peer.
pub const SERVICE_TYPE: &str = "_decklink._tcp.local.";

/// Version string advertised in discovery TXT records.
pub const PROTOCOL_VERSION: &str = "0.1.0";
