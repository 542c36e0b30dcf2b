//! # decklink-daemon
//!
//! The long-running Deck-Link process.  It wires the pure pairing state
//! machine from `decklink-core` to real sockets and a local UI.
//!
//! # Layers
//!
//! - **`application`** – The session service: a single Tokio task that owns
//!   the [`decklink_core::SessionManager`], serialises every command and
//!   transport event through it, and carries out the returned effects.  It
//!   depends only on the [`application::LinkControl`] and
//!   [`application::PeerDirectory`] traits.
//!
//! - **`infrastructure::network`** – The WebSocket transport (listener and
//!   outbound dialer) and mDNS discovery, which implement those traits.
//!
//! - **`infrastructure::storage`** – The TOML configuration file.
//!
//! - **`infrastructure::ui_bridge`** – A JSON-lines request/response bridge
//!   over stdin/stdout that a desktop or handheld UI drives.

pub mod application;
pub mod infrastructure;

pub use application::{spawn_session_service, ServiceConfig, ServiceError, SessionHandle};
