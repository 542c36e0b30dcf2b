//! Peer-facing networking: the WebSocket transport and mDNS discovery.

pub mod discovery;
pub mod transport;

pub use discovery::{DiscoveryError, DiscoverySettings, MdnsDiscovery, PeerRegistry};
pub use transport::{TransportConfig, TransportError, WsTransport};
