//! `SessionManager`: owns the single [`Session`] and every transition of it.
//!
//! # Bound connection
//!
//! At most one connection is *bound* at a time.  For the initiator that is the
//! outbound connection opened by `connect()`.  For the receiver it is the
//! latest inbound connection accepted while idle; it becomes the session's
//! connection once its `connection_request` arrives.  Until then it holds no
//! claim: a newer inbound connection replaces it, and [`SessionManager::tick`]
//! closes it if it stays silent for `INTRODUCTION_TIMEOUT`.  While a session
//! exists or a dial is pending, any other connection is refused with an
//! `already_connected` error frame and closed.  Events on connections that are
//! not bound are ignored.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::domain::session::{ConnectionId, ConnectionState, PeerInfo, Role, Session, SessionId};
use crate::pairing::events::{Effect, LinkEvent, SessionEvent};
use crate::pairing::{AttemptId, CommandError, KeepaliveConfig, LocalIdentity, StatusSnapshot};
use crate::passphrase::{generate_passphrase, passphrases_match};
use crate::protocol::messages::{
    AuthAttemptMessage, AuthResultMessage, ChallengeResponseMessage, ConnectionRequestMessage,
    ErrorCode, Message, NotificationMessage,
};

const INCORRECT_PASSPHRASE: &str = "Incorrect passphrase";

/// How long a bound inbound connection may stay silent before it is dropped.
const INTRODUCTION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct Link {
    conn: ConnectionId,
    /// Remote host as the transport reported it.
    host: String,
    port: u16,
    /// First tick that saw this link with no session behind it.
    silent_since: Option<Instant>,
}

impl Link {
    fn new(conn: ConnectionId, host: String, port: u16) -> Self {
        Self {
            conn,
            host,
            port,
            silent_since: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Keepalive {
    last_ping: Option<Instant>,
    unanswered_since: Option<Instant>,
}

/// The pairing state machine.  See the [module docs](crate::pairing).
#[derive(Debug)]
pub struct SessionManager {
    identity: LocalIdentity,
    keepalive_config: KeepaliveConfig,
    session: Option<Session>,
    /// State reported while no session exists: `Disconnected` or `Error`.
    idle_state: ConnectionState,
    link: Option<Link>,
    pending_attempt: Option<AttemptId>,
    next_attempt: u64,
    keepalive: Keepalive,
}

impl SessionManager {
    pub fn new(identity: LocalIdentity, keepalive_config: KeepaliveConfig) -> Self {
        Self {
            identity,
            keepalive_config,
            session: None,
            idle_state: ConnectionState::Disconnected,
            link: None,
            pending_attempt: None,
            next_attempt: 1,
            keepalive: Keepalive::default(),
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(self.idle_state)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// The connection currently bound to the session, if any.
    pub fn bound_connection(&self) -> Option<ConnectionId> {
        self.link.as_ref().map(|l| l.conn)
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state(),
            device_name: self.identity.device_name.clone(),
            device_type: self.identity.device_type,
            port: self.identity.port,
            peer: self.session.as_ref().and_then(|s| s.peer.clone()),
            session_id: self.session.as_ref().and_then(|s| s.session_id),
        }
    }

    // ── Local commands ────────────────────────────────────────────────────────

    /// Starts pairing with `host:port` as the initiator.
    ///
    /// # Errors
    ///
    /// [`CommandError::SessionActive`] if a session exists,
    /// [`CommandError::InvalidState`] from `error` (call `disconnect()` first).
    pub fn connect(&mut self, host: &str, port: u16) -> Result<Vec<Effect>, CommandError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(CommandError::EmptyHost);
        }
        if let Some(session) = &self.session {
            return Err(CommandError::SessionActive {
                state: session.state,
            });
        }
        if self.idle_state == ConnectionState::Error {
            return Err(CommandError::InvalidState {
                command: "connect",
                state: self.idle_state,
            });
        }

        let mut effects = Vec::new();

        // An inbound connection that has not introduced itself yet gives way.
        if let Some(link) = self.link.take() {
            debug!("dropping idle inbound {} for outbound connect", link.conn);
            effects.push(Effect::Close { conn: link.conn });
        }

        let attempt = AttemptId(self.next_attempt);
        self.next_attempt += 1;
        self.pending_attempt = Some(attempt);

        info!("connecting to {host}:{port}");
        self.begin_session(
            Session::initiator(PeerInfo {
                name: String::new(),
                host: host.to_string(),
                port,
                device_type: None,
            }),
            &mut effects,
        );
        effects.push(Effect::OpenOutbound {
            attempt,
            host: host.to_string(),
            port,
        });
        Ok(effects)
    }

    /// Sends the word the human typed.  One attempt per session.
    ///
    /// # Errors
    ///
    /// [`CommandError::InvalidState`] outside `awaiting_auth_input`,
    /// [`CommandError::EmptyPassphrase`] for blank input and
    /// [`CommandError::AttemptPending`] if an attempt was already sent.
    pub fn submit_passphrase(&mut self, passphrase: &str) -> Result<Vec<Effect>, CommandError> {
        let state = self.state();
        let conn = self.link.as_ref().map(|l| l.conn);
        let session = match (&mut self.session, conn) {
            (Some(s), Some(_)) if s.state == ConnectionState::AwaitingAuthInput => s,
            _ => {
                return Err(CommandError::InvalidState {
                    command: "submit_passphrase",
                    state,
                })
            }
        };
        if passphrase.trim().is_empty() {
            return Err(CommandError::EmptyPassphrase);
        }
        if session.entered_passphrase.is_some() {
            return Err(CommandError::AttemptPending);
        }
        let (Some(session_id), Some(conn)) = (session.session_id, conn) else {
            return Err(CommandError::InvalidState {
                command: "submit_passphrase",
                state,
            });
        };

        session.entered_passphrase = Some(passphrase.to_string());
        Ok(vec![Effect::Send {
            conn,
            message: Message::AuthAttempt(AuthAttemptMessage {
                session_id,
                passphrase: passphrase.to_string(),
            }),
        }])
    }

    /// Ends whatever is going on and returns to `disconnected`.
    ///
    /// Valid from every state and idempotent.  Announces the close to the
    /// peer with a DISCONNECT frame only when connected.
    pub fn disconnect(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.pending_attempt = None;

        if let Some(link) = self.link.take() {
            if self.state() == ConnectionState::Connected {
                effects.push(Effect::Send {
                    conn: link.conn,
                    message: Message::Disconnect { reason: None },
                });
            }
            effects.push(Effect::Close { conn: link.conn });
        }

        if self.state() != ConnectionState::Disconnected {
            info!("disconnected by local request");
            self.end_session(ConnectionState::Disconnected, &mut effects);
            effects.push(Effect::Emit(SessionEvent::Disconnected {}));
        }
        effects
    }

    /// Sends a NOTIFICATION to the connected peer.
    ///
    /// # Errors
    ///
    /// [`CommandError::NotConnected`] unless the session is authenticated.
    pub fn send_notification(
        &mut self,
        title: &str,
        body: &str,
    ) -> Result<Vec<Effect>, CommandError> {
        match (&self.link, self.state()) {
            (Some(link), ConnectionState::Connected) => Ok(vec![Effect::Send {
                conn: link.conn,
                message: Message::Notification(NotificationMessage {
                    title: title.to_string(),
                    body: body.to_string(),
                    icon: None,
                }),
            }]),
            _ => Err(CommandError::NotConnected),
        }
    }

    // ── Transport input ───────────────────────────────────────────────────────

    pub fn handle_link(&mut self, event: LinkEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event {
            LinkEvent::InboundAccepted { conn, remote } => {
                self.on_inbound(conn, remote.ip().to_string(), remote.port(), &mut effects)
            }
            LinkEvent::OutboundOpened { attempt, conn } => {
                self.on_outbound_opened(attempt, conn, &mut effects)
            }
            LinkEvent::OutboundFailed { attempt, error } => {
                self.on_outbound_failed(attempt, error, &mut effects)
            }
            LinkEvent::Received { conn, message } => {
                if self.is_bound(conn) {
                    self.on_message(conn, message, &mut effects);
                } else {
                    debug!("ignoring {} from unbound {conn}", message.message_type());
                }
            }
            LinkEvent::Malformed { conn, error } => {
                if self.is_bound(conn) {
                    self.on_malformed(conn, error.to_string(), &mut effects);
                }
            }
            LinkEvent::Closed { conn } => {
                if self.is_bound(conn) {
                    self.on_link_lost(None, &mut effects);
                }
            }
            LinkEvent::Failed { conn, error } => {
                if self.is_bound(conn) {
                    self.on_link_lost(Some(error), &mut effects);
                }
            }
        }
        effects
    }

    /// Drives the keepalive and drops inbound connections that never
    /// introduce themselves.  Call periodically.
    pub fn tick(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.expire_silent_inbound(now, &mut effects);
        let Some(conn) = self.bound_connection() else {
            return effects;
        };
        if self.state() != ConnectionState::Connected {
            return effects;
        }

        if let Some(since) = self.keepalive.unanswered_since {
            if now.saturating_duration_since(since) >= self.keepalive_config.timeout {
                warn!("keepalive timeout on {conn}");
                self.link = None;
                effects.push(Effect::Close { conn });
                self.end_session(ConnectionState::Disconnected, &mut effects);
                effects.push(Effect::Emit(SessionEvent::ConnectionError {
                    error: "ping timeout".to_string(),
                }));
                effects.push(Effect::Emit(SessionEvent::Disconnected {}));
                return effects;
            }
        }

        let due = self
            .keepalive
            .last_ping
            .map_or(true, |at| now.saturating_duration_since(at) >= self.keepalive_config.interval);
        if due {
            self.keepalive.last_ping = Some(now);
            if self.keepalive.unanswered_since.is_none() {
                self.keepalive.unanswered_since = Some(now);
            }
            effects.push(Effect::Send {
                conn,
                message: Message::Ping,
            });
        }
        effects
    }

    // ── Link event handlers ───────────────────────────────────────────────────

    fn on_inbound(&mut self, conn: ConnectionId, host: String, port: u16, effects: &mut Vec<Effect>) {
        let busy = self.session.is_some() || self.pending_attempt.is_some();
        if busy {
            info!("refusing inbound {conn} from {host}: already connected");
            refuse(conn, ErrorCode::AlreadyConnected, "Already connected to another peer", effects);
        } else if self.idle_state == ConnectionState::Error {
            info!("refusing inbound {conn} from {host}: in error state");
            refuse(conn, ErrorCode::Unavailable, "Not accepting connections", effects);
        } else {
            if let Some(silent) = self.link.take() {
                info!("{conn} replaces inbound {} that never sent a request", silent.conn);
                effects.push(Effect::Close { conn: silent.conn });
            }
            debug!("bound inbound {conn} from {host}:{port}");
            self.link = Some(Link::new(conn, host, port));
        }
    }

    fn expire_silent_inbound(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        if self.session.is_some() || self.pending_attempt.is_some() {
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let since = *link.silent_since.get_or_insert(now);
        if now.saturating_duration_since(since) >= INTRODUCTION_TIMEOUT {
            info!("closing inbound {}: no connection_request received", link.conn);
            effects.push(Effect::Close { conn: link.conn });
            self.link = None;
        }
    }

    fn on_outbound_opened(&mut self, attempt: AttemptId, conn: ConnectionId, effects: &mut Vec<Effect>) {
        let current = self.pending_attempt == Some(attempt)
            && self.state() == ConnectionState::AwaitingChallenge;
        if !current {
            debug!("closing stale outbound {conn}");
            effects.push(Effect::Close { conn });
            return;
        }
        self.pending_attempt = None;

        let (host, port) = self
            .session
            .as_ref()
            .and_then(|s| s.peer.as_ref())
            .map(|p| (p.host.clone(), p.port))
            .unwrap_or_default();
        info!("outbound {conn} open to {host}:{port}");
        self.link = Some(Link::new(conn, host, port));
        effects.push(Effect::Send {
            conn,
            message: Message::ConnectionRequest(ConnectionRequestMessage {
                device_name: self.identity.device_name.clone(),
                device_type: self.identity.device_type,
            }),
        });
    }

    fn on_outbound_failed(&mut self, attempt: AttemptId, error: String, effects: &mut Vec<Effect>) {
        if self.pending_attempt != Some(attempt) {
            debug!("ignoring failure of stale outbound attempt: {error}");
            return;
        }
        self.pending_attempt = None;
        warn!("outbound connection failed: {error}");
        self.end_session(ConnectionState::Error, effects);
        effects.push(Effect::Emit(SessionEvent::ConnectionError { error }));
    }

    fn on_message(&mut self, conn: ConnectionId, message: Message, effects: &mut Vec<Effect>) {
        match message {
            Message::ConnectionRequest(req) => self.on_connection_request(conn, req, effects),
            Message::ChallengeResponse(resp) => self.on_challenge_response(resp, effects),
            Message::AuthAttempt(attempt) => self.on_auth_attempt(conn, attempt, effects),
            Message::AuthResult(result) => self.on_auth_result(conn, result, effects),
            Message::Ping => {
                if self.state() == ConnectionState::Connected {
                    effects.push(Effect::Send {
                        conn,
                        message: Message::Pong,
                    });
                } else {
                    debug!("ignoring ping in state {}", self.state());
                }
            }
            Message::Pong => self.keepalive.unanswered_since = None,
            Message::Notification(n) => {
                if self.state() == ConnectionState::Connected {
                    effects.push(Effect::Emit(SessionEvent::Notification {
                        title: n.title,
                        body: n.body,
                    }));
                } else {
                    warn!("dropping notification received before authentication");
                }
            }
            Message::Disconnect { reason } => {
                info!("peer disconnected ({})", reason.as_deref().unwrap_or("no reason"));
                self.link = None;
                effects.push(Effect::Close { conn });
                if self.session.is_some() {
                    self.end_session(ConnectionState::Disconnected, effects);
                    effects.push(Effect::Emit(SessionEvent::Disconnected {}));
                }
            }
            Message::Error(err) => {
                warn!("peer reported error {}: {}", err.code.as_str(), err.message);
                self.link = None;
                effects.push(Effect::Close { conn });
                if self.session.is_some() {
                    self.end_session(ConnectionState::Error, effects);
                    effects.push(Effect::Emit(SessionEvent::ConnectionError {
                        error: format!("{}: {}", err.code.as_str(), err.message),
                    }));
                }
            }
        }
    }

    fn on_connection_request(
        &mut self,
        conn: ConnectionId,
        req: ConnectionRequestMessage,
        effects: &mut Vec<Effect>,
    ) {
        if self.session.is_some() {
            warn!("repeated connection_request on {conn}");
            effects.push(Effect::Send {
                conn,
                message: Message::error(ErrorCode::AlreadyConnected, "Session already in progress"),
            });
            return;
        }

        let (host, port) = self
            .link
            .as_ref()
            .map(|l| (l.host.clone(), l.port))
            .unwrap_or_default();
        let session_id = SessionId::generate();
        let passphrase = generate_passphrase().to_string();
        info!("pairing request from {} ({})", req.device_name, req.device_type);

        let peer = PeerInfo {
            name: req.device_name.clone(),
            host,
            port,
            device_type: Some(req.device_type),
        };
        self.begin_session(Session::receiver(peer, session_id, passphrase.clone()), effects);
        effects.push(Effect::Emit(SessionEvent::ChallengeGenerated {
            session_id,
            passphrase,
            peer_name: req.device_name,
        }));
        effects.push(Effect::Send {
            conn,
            message: Message::ChallengeResponse(ChallengeResponseMessage {
                session_id,
                peer_name: self.identity.device_name.clone(),
            }),
        });
    }

    fn on_challenge_response(&mut self, resp: ChallengeResponseMessage, effects: &mut Vec<Effect>) {
        let Some(session) = self.session.as_mut() else {
            warn!("unexpected challenge_response with no session");
            return;
        };
        if session.role != Role::Initiator || session.state != ConnectionState::AwaitingChallenge {
            warn!("unexpected challenge_response in state {}", session.state);
            return;
        }

        session.session_id = Some(resp.session_id);
        if let Some(peer) = session.peer.as_mut() {
            peer.name = resp.peer_name.clone();
        }
        self.set_state(ConnectionState::AwaitingAuthInput, effects);
        effects.push(Effect::Emit(SessionEvent::PassphraseRequired {
            session_id: resp.session_id,
            peer_name: resp.peer_name,
        }));
    }

    fn on_auth_attempt(&mut self, conn: ConnectionId, attempt: AuthAttemptMessage, effects: &mut Vec<Effect>) {
        let Some(session) = self.session.as_ref() else {
            effects.push(Effect::Send {
                conn,
                message: Message::error(ErrorCode::NoSession, "No active session"),
            });
            return;
        };
        if session.role != Role::Receiver || session.state != ConnectionState::ChallengeSent {
            warn!("unexpected auth_attempt in state {}", session.state);
            return;
        }

        let id_matches = session.session_id == Some(attempt.session_id);
        let word_matches = session
            .expected_passphrase
            .as_deref()
            .is_some_and(|expected| passphrases_match(&attempt.passphrase, expected));

        if id_matches && word_matches {
            let (peer_name, peer_ip) = (session.peer_name().to_string(), session.peer_host().to_string());
            info!("{peer_name} authenticated");
            effects.push(Effect::Send {
                conn,
                message: Message::AuthResult(AuthResultMessage {
                    session_id: attempt.session_id,
                    success: true,
                    reason: None,
                }),
            });
            self.enter_connected(peer_name, peer_ip, effects);
        } else {
            if !id_matches {
                warn!("auth_attempt for unknown session {}", attempt.session_id);
            }
            info!("pairing attempt rejected");
            effects.push(Effect::Send {
                conn,
                message: Message::AuthResult(AuthResultMessage {
                    session_id: attempt.session_id,
                    success: false,
                    reason: Some(INCORRECT_PASSPHRASE.to_string()),
                }),
            });
            effects.push(Effect::Close { conn });
            self.link = None;
            self.end_session(ConnectionState::Disconnected, effects);
            effects.push(Effect::Emit(SessionEvent::AuthFailed {
                reason: INCORRECT_PASSPHRASE.to_string(),
            }));
        }
    }

    fn on_auth_result(&mut self, conn: ConnectionId, result: AuthResultMessage, effects: &mut Vec<Effect>) {
        let Some(session) = self.session.as_ref() else {
            warn!("unexpected auth_result with no session");
            return;
        };
        if session.role != Role::Initiator
            || session.state != ConnectionState::AwaitingAuthInput
            || session.entered_passphrase.is_none()
        {
            warn!("unexpected auth_result in state {}", session.state);
            return;
        }

        if session.session_id != Some(result.session_id) {
            warn!("auth_result for unknown session {}", result.session_id);
            effects.push(Effect::Send {
                conn,
                message: Message::error(ErrorCode::InvalidSession, "Invalid session"),
            });
            effects.push(Effect::Close { conn });
            self.link = None;
            self.end_session(ConnectionState::Error, effects);
            effects.push(Effect::Emit(SessionEvent::ConnectionError {
                error: "auth_result carried a mismatched session id".to_string(),
            }));
            return;
        }

        if result.success {
            let (peer_name, peer_ip) = (session.peer_name().to_string(), session.peer_host().to_string());
            info!("paired with {peer_name}");
            self.enter_connected(peer_name, peer_ip, effects);
        } else {
            let reason = result
                .reason
                .unwrap_or_else(|| "Authentication failed".to_string());
            info!("pairing rejected by peer: {reason}");
            effects.push(Effect::Close { conn });
            self.link = None;
            self.end_session(ConnectionState::Disconnected, effects);
            effects.push(Effect::Emit(SessionEvent::AuthFailed { reason }));
        }
    }

    fn on_malformed(&mut self, conn: ConnectionId, error: String, effects: &mut Vec<Effect>) {
        warn!("malformed frame on {conn}: {error}");
        effects.push(Effect::Send {
            conn,
            message: Message::error(ErrorCode::InvalidMessage, error.clone()),
        });
        effects.push(Effect::Close { conn });
        self.link = None;
        if self.session.is_some() {
            self.end_session(ConnectionState::Error, effects);
            effects.push(Effect::Emit(SessionEvent::ConnectionError {
                error: format!("protocol violation: {error}"),
            }));
        }
    }

    fn on_link_lost(&mut self, error: Option<String>, effects: &mut Vec<Effect>) {
        self.link = None;
        let state = self.state();
        if self.session.is_none() {
            return;
        }
        let description = error
            .clone()
            .unwrap_or_else(|| "connection closed by peer".to_string());
        warn!("connection lost in state {state}: {description}");

        if state == ConnectionState::Connected {
            self.end_session(ConnectionState::Disconnected, effects);
            if error.is_some() {
                effects.push(Effect::Emit(SessionEvent::ConnectionError { error: description }));
            }
            effects.push(Effect::Emit(SessionEvent::Disconnected {}));
        } else {
            self.end_session(ConnectionState::Error, effects);
            effects.push(Effect::Emit(SessionEvent::ConnectionError { error: description }));
        }
    }

    // ── State helpers ─────────────────────────────────────────────────────────

    fn is_bound(&self, conn: ConnectionId) -> bool {
        self.link.as_ref().is_some_and(|l| l.conn == conn)
    }

    fn begin_session(&mut self, session: Session, effects: &mut Vec<Effect>) {
        let old = self.state();
        let new = session.state;
        self.session = Some(session);
        self.idle_state = ConnectionState::Disconnected;
        push_state_change(old, new, effects);
    }

    fn set_state(&mut self, new: ConnectionState, effects: &mut Vec<Effect>) {
        if let Some(session) = self.session.as_mut() {
            let old = session.state;
            session.state = new;
            push_state_change(old, new, effects);
        }
    }

    fn enter_connected(&mut self, peer_name: String, peer_ip: String, effects: &mut Vec<Effect>) {
        if let Some(session) = self.session.as_mut() {
            session.clear_secrets();
        }
        self.keepalive = Keepalive::default();
        self.set_state(ConnectionState::Connected, effects);
        effects.push(Effect::Emit(SessionEvent::Connected { peer_name, peer_ip }));
    }

    /// Destroys the session (secrets included) and parks in `idle`.
    fn end_session(&mut self, idle: ConnectionState, effects: &mut Vec<Effect>) {
        let old = self.state();
        self.session = None;
        self.idle_state = idle;
        self.keepalive = Keepalive::default();
        push_state_change(old, idle, effects);
    }
}

fn push_state_change(old: ConnectionState, new: ConnectionState, effects: &mut Vec<Effect>) {
    if old != new {
        debug!("state {old} -> {new}");
        effects.push(Effect::Emit(SessionEvent::StateChanged { old, new }));
    }
}

fn refuse(conn: ConnectionId, code: ErrorCode, text: &str, effects: &mut Vec<Effect>) {
    effects.push(Effect::Send {
        conn,
        message: Message::error(code, text),
    });
    effects.push(Effect::Close { conn });
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::peer::DeviceType;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn manager() -> SessionManager {
        SessionManager::new(
            LocalIdentity {
                device_name: "Steam Deck".to_string(),
                device_type: DeviceType::Deck,
                port: 52525,
            },
            KeepaliveConfig::default(),
        )
    }

    fn remote() -> SocketAddr {
        "192.168.1.50:40000".parse().unwrap()
    }

    fn emitted(effects: &[Effect]) -> Vec<SessionEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(ev) => Some(ev.clone()),
                _ => None,
            })
            .collect()
    }

    fn sent(effects: &[Effect]) -> Vec<Message> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Receiver with an inbound connection that has sent its request.
    fn challenged() -> (SessionManager, ConnectionId, SessionId, String) {
        let mut m = manager();
        let conn = ConnectionId(1);
        m.handle_link(LinkEvent::InboundAccepted { conn, remote: remote() });
        let effects = m.handle_link(LinkEvent::Received {
            conn,
            message: Message::ConnectionRequest(ConnectionRequestMessage {
                device_name: "Laptop".to_string(),
                device_type: DeviceType::Laptop,
            }),
        });
        let (id, word) = emitted(&effects)
            .into_iter()
            .find_map(|e| match e {
                SessionEvent::ChallengeGenerated {
                    session_id,
                    passphrase,
                    ..
                } => Some((session_id, passphrase)),
                _ => None,
            })
            .expect("no challenge generated");
        (m, conn, id, word)
    }

    #[test]
    fn test_new_manager_is_disconnected_without_session() {
        let m = manager();
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.session().is_none());
        assert!(m.bound_connection().is_none());
    }

    #[test]
    fn test_connect_opens_outbound_and_enters_awaiting_challenge() {
        // Arrange
        let mut m = manager();

        // Act
        let effects = m.connect("10.0.0.2", 52525).unwrap();

        // Assert
        assert_eq!(m.state(), ConnectionState::AwaitingChallenge);
        assert!(matches!(
            effects.last(),
            Some(Effect::OpenOutbound { host, port: 52525, .. }) if host == "10.0.0.2"
        ));
        assert_eq!(
            emitted(&effects),
            vec![SessionEvent::StateChanged {
                old: ConnectionState::Disconnected,
                new: ConnectionState::AwaitingChallenge,
            }]
        );
    }

    #[test]
    fn test_connect_while_session_active_is_rejected_and_session_kept() {
        let mut m = manager();
        m.connect("10.0.0.2", 52525).unwrap();

        let result = m.connect("10.0.0.3", 52525);

        assert_eq!(
            result,
            Err(CommandError::SessionActive {
                state: ConnectionState::AwaitingChallenge
            })
        );
        assert_eq!(m.session().unwrap().peer_host(), "10.0.0.2");
    }

    #[test]
    fn test_connect_with_blank_host_is_rejected() {
        let mut m = manager();
        assert_eq!(m.connect("  ", 52525), Err(CommandError::EmptyHost));
    }

    #[test]
    fn test_outbound_opened_sends_connection_request() {
        let mut m = manager();
        let attempt = match m.connect("10.0.0.2", 52525).unwrap().pop() {
            Some(Effect::OpenOutbound { attempt, .. }) => attempt,
            other => panic!("unexpected {other:?}"),
        };

        let effects = m.handle_link(LinkEvent::OutboundOpened {
            attempt,
            conn: ConnectionId(9),
        });

        assert_eq!(
            sent(&effects),
            vec![Message::ConnectionRequest(ConnectionRequestMessage {
                device_name: "Steam Deck".to_string(),
                device_type: DeviceType::Deck,
            })]
        );
        assert_eq!(m.bound_connection(), Some(ConnectionId(9)));
    }

    #[test]
    fn test_stale_outbound_open_is_closed() {
        let mut m = manager();
        m.connect("10.0.0.2", 52525).unwrap();
        m.disconnect();

        let effects = m.handle_link(LinkEvent::OutboundOpened {
            attempt: AttemptId(1),
            conn: ConnectionId(4),
        });

        assert_eq!(effects, vec![Effect::Close { conn: ConnectionId(4) }]);
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connection_request_issues_challenge_without_passphrase_on_wire() {
        let (m, _, id, word) = challenged();

        assert_eq!(m.state(), ConnectionState::ChallengeSent);
        assert_eq!(m.session().unwrap().session_id, Some(id));
        assert!(crate::passphrase::is_wordlist_word(&word));
    }

    #[test]
    fn test_correct_attempt_connects_and_clears_secrets() {
        // Arrange
        let (mut m, conn, id, word) = challenged();

        // Act
        let effects = m.handle_link(LinkEvent::Received {
            conn,
            message: Message::AuthAttempt(AuthAttemptMessage {
                session_id: id,
                passphrase: format!(" {} ", word.to_uppercase()),
            }),
        });

        // Assert
        assert_eq!(m.state(), ConnectionState::Connected);
        let session = m.session().unwrap();
        assert!(session.expected_passphrase.is_none());
        assert!(session.entered_passphrase.is_none());
        assert!(emitted(&effects).contains(&SessionEvent::Connected {
            peer_name: "Laptop".to_string(),
            peer_ip: "192.168.1.50".to_string(),
        }));
    }

    #[test]
    fn test_wrong_session_id_counts_as_failed_attempt() {
        let (mut m, conn, _, word) = challenged();

        let effects = m.handle_link(LinkEvent::Received {
            conn,
            message: Message::AuthAttempt(AuthAttemptMessage {
                session_id: SessionId::generate(),
                passphrase: word,
            }),
        });

        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.session().is_none());
        assert!(effects.contains(&Effect::Close { conn }));
    }

    #[test]
    fn test_second_inbound_connection_refused_while_bound() {
        let (mut m, _, _, _) = challenged();
        let intruder = ConnectionId(2);

        let effects = m.handle_link(LinkEvent::InboundAccepted {
            conn: intruder,
            remote: "192.168.1.99:41000".parse().unwrap(),
        });

        assert_eq!(
            effects,
            vec![
                Effect::Send {
                    conn: intruder,
                    message: Message::error(
                        ErrorCode::AlreadyConnected,
                        "Already connected to another peer"
                    ),
                },
                Effect::Close { conn: intruder },
            ]
        );
        assert_eq!(m.state(), ConnectionState::ChallengeSent);
    }

    #[test]
    fn test_new_inbound_replaces_one_that_never_sent_a_request() {
        // Arrange
        let mut m = manager();
        let silent = ConnectionId(1);
        m.handle_link(LinkEvent::InboundAccepted { conn: silent, remote: remote() });
        let t0 = Instant::now();
        m.tick(t0 + Duration::from_secs(1));

        // Act
        let replaced = m.handle_link(LinkEvent::InboundAccepted {
            conn: ConnectionId(2),
            remote: "192.168.1.51:40001".parse().unwrap(),
        });
        let requested = m.handle_link(LinkEvent::Received {
            conn: ConnectionId(2),
            message: Message::ConnectionRequest(ConnectionRequestMessage {
                device_name: "Laptop".to_string(),
                device_type: DeviceType::Laptop,
            }),
        });

        // Assert
        assert_eq!(replaced, vec![Effect::Close { conn: silent }]);
        assert_eq!(m.state(), ConnectionState::ChallengeSent);
        assert_eq!(m.bound_connection(), Some(ConnectionId(2)));
        assert!(matches!(sent(&requested).as_slice(), [Message::ChallengeResponse(_)]));
    }

    #[test]
    fn test_silent_inbound_is_closed_after_introduction_timeout() {
        // Arrange
        let mut m = manager();
        let conn = ConnectionId(1);
        m.handle_link(LinkEvent::InboundAccepted { conn, remote: remote() });
        let t0 = Instant::now();

        // Act
        let first = m.tick(t0);
        let early = m.tick(t0 + INTRODUCTION_TIMEOUT - Duration::from_millis(1));
        let expired = m.tick(t0 + INTRODUCTION_TIMEOUT);

        // Assert
        assert!(first.is_empty());
        assert!(early.is_empty());
        assert_eq!(expired, vec![Effect::Close { conn }]);
        assert!(m.bound_connection().is_none());
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m
            .handle_link(LinkEvent::InboundAccepted {
                conn: ConnectionId(2),
                remote: remote(),
            })
            .is_empty());
    }

    #[test]
    fn test_introduced_connection_is_not_expired() {
        let (mut m, conn, _, _) = challenged();
        let t0 = Instant::now();

        m.tick(t0);
        let effects = m.tick(t0 + INTRODUCTION_TIMEOUT * 6);

        assert!(effects.is_empty());
        assert_eq!(m.bound_connection(), Some(conn));
        assert_eq!(m.state(), ConnectionState::ChallengeSent);
    }

    #[test]
    fn test_messages_from_unbound_connection_are_ignored() {
        let (mut m, _, id, word) = challenged();

        let effects = m.handle_link(LinkEvent::Received {
            conn: ConnectionId(77),
            message: Message::AuthAttempt(AuthAttemptMessage {
                session_id: id,
                passphrase: word,
            }),
        });

        assert!(effects.is_empty());
        assert_eq!(m.state(), ConnectionState::ChallengeSent);
    }

    #[test]
    fn test_peer_close_before_connected_goes_to_error() {
        let (mut m, conn, _, _) = challenged();

        let effects = m.handle_link(LinkEvent::Closed { conn });

        assert_eq!(m.state(), ConnectionState::Error);
        assert!(m.session().is_none());
        assert!(emitted(&effects)
            .iter()
            .any(|e| matches!(e, SessionEvent::ConnectionError { .. })));
    }

    #[test]
    fn test_inbound_refused_while_in_error_state() {
        let (mut m, conn, _, _) = challenged();
        m.handle_link(LinkEvent::Closed { conn });

        let effects = m.handle_link(LinkEvent::InboundAccepted {
            conn: ConnectionId(3),
            remote: remote(),
        });

        assert!(matches!(
            sent(&effects).first(),
            Some(Message::Error(e)) if e.code == ErrorCode::Unavailable
        ));
    }

    #[test]
    fn test_connect_from_error_requires_disconnect_first() {
        let (mut m, conn, _, _) = challenged();
        m.handle_link(LinkEvent::Closed { conn });

        assert!(matches!(
            m.connect("10.0.0.2", 52525),
            Err(CommandError::InvalidState { .. })
        ));
        m.disconnect();
        assert!(m.connect("10.0.0.2", 52525).is_ok());
    }

    #[test]
    fn test_keepalive_pings_on_interval_and_times_out() {
        // Arrange
        let (mut m, conn, id, word) = challenged();
        m.handle_link(LinkEvent::Received {
            conn,
            message: Message::AuthAttempt(AuthAttemptMessage {
                session_id: id,
                passphrase: word,
            }),
        });
        let t0 = Instant::now();

        // Act / Assert: first tick pings, an early second tick does not.
        assert_eq!(sent(&m.tick(t0)), vec![Message::Ping]);
        assert!(m.tick(t0 + Duration::from_secs(1)).is_empty());
        assert_eq!(sent(&m.tick(t0 + Duration::from_secs(5))), vec![Message::Ping]);

        let effects = m.tick(t0 + Duration::from_secs(10));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(effects.contains(&Effect::Close { conn }));
        assert!(emitted(&effects).contains(&SessionEvent::Disconnected {}));
    }

    #[test]
    fn test_pong_resets_keepalive_deadline() {
        let (mut m, conn, id, word) = challenged();
        m.handle_link(LinkEvent::Received {
            conn,
            message: Message::AuthAttempt(AuthAttemptMessage {
                session_id: id,
                passphrase: word,
            }),
        });
        let t0 = Instant::now();

        m.tick(t0);
        m.handle_link(LinkEvent::Received {
            conn,
            message: Message::Pong,
        });
        m.tick(t0 + Duration::from_secs(5));
        m.handle_link(LinkEvent::Received {
            conn,
            message: Message::Pong,
        });
        m.tick(t0 + Duration::from_secs(10));

        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_tick_is_noop_when_not_connected() {
        let (mut m, _, _, _) = challenged();
        assert!(m.tick(Instant::now()).is_empty());
    }

    #[test]
    fn test_status_reports_identity_and_peer() {
        let (m, _, id, _) = challenged();

        let status = m.status();

        assert_eq!(status.state, ConnectionState::ChallengeSent);
        assert_eq!(status.device_name, "Steam Deck");
        assert_eq!(status.session_id, Some(id));
        assert_eq!(status.peer.unwrap().name, "Laptop");
    }
}
