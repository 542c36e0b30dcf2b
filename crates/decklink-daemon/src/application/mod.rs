//! Application layer: the session service and the ports it depends on.

pub mod session_service;

pub use session_service::{
    spawn_session_service, LinkControl, PeerDirectory, ServiceConfig, ServiceError, SessionHandle,
};
