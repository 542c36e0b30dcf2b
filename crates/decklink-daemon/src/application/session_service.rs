//! Session service: the one task that owns the pairing state machine.
//!
//! Every input (UI commands, transport events and keepalive ticks) is
//! funnelled into a single Tokio task through channels, so the
//! [`SessionManager`] is only ever touched from one place.  Its returned
//! effects are executed in order against the [`LinkControl`] port and the
//! event broadcast.
//!
//! # Why a task instead of a shared mutex (for beginners)
//!
//! With `Arc<Mutex<SessionManager>>` every caller would have to remember to
//! hold the lock across "transition + execute effects".  A single owning task
//! makes that ordering automatic: a command reply is only sent after the
//! effects it produced have been handed to the transport.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use decklink_core::{
    AttemptId, CommandError, ConnectionId, ConnectionState, Effect, KeepaliveConfig, LinkEvent,
    LocalIdentity, Message, Peer, SessionEvent, SessionManager, StatusSnapshot,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

// ── Ports ─────────────────────────────────────────────────────────────────────

/// Source of currently discovered peers.
#[cfg_attr(test, mockall::automock)]
pub trait PeerDirectory: Send + Sync {
    fn list_peers(&self) -> Vec<Peer>;
}

/// Abstraction over the peer transport.
///
/// Implementations report what happens on each connection through the
/// `LinkEvent` channel handed to [`spawn_session_service`].  The methods here
/// only queue work; they never wait for the network.
#[async_trait]
pub trait LinkControl: Send + Sync {
    /// Starts dialing `host:port`.  The outcome arrives later as
    /// `OutboundOpened` or `OutboundFailed` carrying the same `attempt`.
    async fn open_outbound(&self, attempt: AttemptId, host: String, port: u16)
        -> Result<(), String>;

    /// Queues one frame on `conn`.
    async fn send(&self, conn: ConnectionId, message: Message) -> Result<(), String>;

    /// Closes `conn` after the frames queued before it.
    async fn close(&self, conn: ConnectionId) -> Result<(), String>;
}

// ── Configuration and errors ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub identity: LocalIdentity,
    pub keepalive: KeepaliveConfig,
    /// How often the keepalive clock is advanced.
    pub tick_interval: Duration,
    /// Leave `error` for `disconnected` as soon as it is entered.  For
    /// daemons with no UI attached to call `disconnect()`.
    pub reset_after_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The service task has exited.
    #[error("session service is not running")]
    Stopped,

    /// The state machine rejected the command.
    #[error(transparent)]
    Command(#[from] CommandError),
}

// ── Handle ────────────────────────────────────────────────────────────────────

enum Command {
    Connect {
        host: String,
        port: u16,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    SubmitPassphrase {
        passphrase: String,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    SendNotification {
        title: String,
        body: String,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
}

/// Cloneable front door to the session service.
///
/// The service stops once every handle has been dropped.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    directory: Arc<dyn PeerDirectory>,
}

impl SessionHandle {
    /// Starts pairing with `host:port` as the initiator.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Connect {
                host: host.to_string(),
                port,
                reply,
            },
            rx,
        )
        .await?
        .map_err(ServiceError::from)
    }

    /// Sends the word the human typed.  The outcome arrives as an event.
    pub async fn submit_passphrase(&self, passphrase: &str) -> Result<(), ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::SubmitPassphrase {
                passphrase: passphrase.to_string(),
                reply,
            },
            rx,
        )
        .await?
        .map_err(ServiceError::from)
    }

    /// Ends the current session, if any.  Always succeeds while running.
    pub async fn disconnect(&self) -> Result<(), ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Disconnect { reply }, rx).await
    }

    pub async fn send_notification(&self, title: &str, body: &str) -> Result<(), ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::SendNotification {
                title: title.to_string(),
                body: body.to_string(),
                reply,
            },
            rx,
        )
        .await?
        .map_err(ServiceError::from)
    }

    pub async fn get_status(&self) -> Result<StatusSnapshot, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Status { reply }, rx).await
    }

    /// Peers currently visible through discovery.
    pub fn get_peers(&self) -> Vec<Peer> {
        self.directory.list_peers()
    }

    /// A new receiver for lifecycle events.  Events sent before this call
    /// are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, command: Command, rx: oneshot::Receiver<T>) -> Result<T, ServiceError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ServiceError::Stopped)?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }
}

// ── Service task ──────────────────────────────────────────────────────────────

/// Starts the session service on the current Tokio runtime.
///
/// `link_events` is the receiving end of the channel the transport reports
/// into.  The returned [`JoinHandle`] completes after the last
/// [`SessionHandle`] is dropped and the active session has been torn down.
pub fn spawn_session_service(
    config: ServiceConfig,
    link: Arc<dyn LinkControl>,
    directory: Arc<dyn PeerDirectory>,
    link_events: mpsc::Receiver<LinkEvent>,
) -> (SessionHandle, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(32);
    let (event_tx, _) = broadcast::channel(64);

    let service = SessionService {
        manager: SessionManager::new(config.identity, config.keepalive),
        link,
        events: event_tx.clone(),
        reset_after_error: config.reset_after_error,
    };
    let task = tokio::spawn(service.run(command_rx, link_events, config.tick_interval));

    let handle = SessionHandle {
        commands: command_tx,
        events: event_tx,
        directory,
    };
    (handle, task)
}

struct SessionService {
    manager: SessionManager,
    link: Arc<dyn LinkControl>,
    events: broadcast::Sender<SessionEvent>,
    reset_after_error: bool,
}

impl SessionService {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut link_events: mpsc::Receiver<LinkEvent>,
        tick_interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut transport_open = true;

        info!(
            "session service started as {:?} ({})",
            self.manager.identity().device_name,
            self.manager.identity().device_type
        );

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = link_events.recv(), if transport_open => match event {
                    Some(event) => {
                        let effects = self.manager.handle_link(event);
                        self.apply(effects).await;
                    }
                    None => {
                        warn!("transport event channel closed");
                        transport_open = false;
                    }
                },
                _ = ticker.tick() => {
                    let now = tokio::time::Instant::now().into_std();
                    let effects = self.manager.tick(now);
                    self.apply(effects).await;
                }
            }
            self.leave_error_state().await;
        }

        let effects = self.manager.disconnect();
        self.apply(effects).await;
        info!("session service stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { host, port, reply } => {
                let result = self.manager.connect(&host, port);
                let _ = reply.send(self.apply_result(result).await);
            }
            Command::SubmitPassphrase { passphrase, reply } => {
                let result = self.manager.submit_passphrase(&passphrase);
                let _ = reply.send(self.apply_result(result).await);
            }
            Command::Disconnect { reply } => {
                let effects = self.manager.disconnect();
                self.apply(effects).await;
                let _ = reply.send(());
            }
            Command::SendNotification { title, body, reply } => {
                let result = self.manager.send_notification(&title, &body);
                let _ = reply.send(self.apply_result(result).await);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.manager.status());
            }
        }
    }

    async fn leave_error_state(&mut self) {
        if self.reset_after_error && self.manager.state() == ConnectionState::Error {
            info!("resetting after error; accepting new pairings");
            let effects = self.manager.disconnect();
            self.apply(effects).await;
        }
    }

    async fn apply_result(
        &mut self,
        result: Result<Vec<Effect>, CommandError>,
    ) -> Result<(), CommandError> {
        match result {
            Ok(effects) => {
                self.apply(effects).await;
                Ok(())
            }
            Err(e) => {
                debug!("command rejected: {e}");
                Err(e)
            }
        }
    }

    /// Executes effects in order.  A dial that cannot even be started is fed
    /// back into the state machine as a failed attempt.
    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::OpenOutbound {
                    attempt,
                    host,
                    port,
                } => {
                    if let Err(error) = self.link.open_outbound(attempt, host, port).await {
                        let follow_up = self
                            .manager
                            .handle_link(LinkEvent::OutboundFailed { attempt, error });
                        queue.extend(follow_up);
                    }
                }
                Effect::Send { conn, message } => {
                    let kind = message.message_type();
                    if let Err(e) = self.link.send(conn, message).await {
                        debug!("could not send {kind} on {conn}: {e}");
                    }
                }
                Effect::Close { conn } => {
                    if let Err(e) = self.link.close(conn).await {
                        debug!("could not close {conn}: {e}");
                    }
                }
                Effect::Emit(event) => {
                    debug!("event: {}", event.name());
                    // No subscribers is not an error.
                    let _ = self.events.send(event);
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use decklink_core::protocol::{AuthAttemptMessage, ConnectionRequestMessage};
    use decklink_core::{ConnectionState, DeviceType};
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tokio::time::timeout;

    // ── Test doubles ──────────────────────────────────────────────────────────

    #[derive(Debug, Clone, PartialEq)]
    enum LinkCall {
        Open(AttemptId, String, u16),
        Send(ConnectionId, Message),
        Close(ConnectionId),
    }

    /// Records every transport call; optionally refuses to dial.
    #[derive(Default)]
    struct RecordingLink {
        calls: Mutex<Vec<LinkCall>>,
        refuse_dial: bool,
    }

    impl RecordingLink {
        fn calls(&self) -> Vec<LinkCall> {
            self.calls.lock().unwrap().clone()
        }

        fn sent(&self) -> Vec<Message> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    LinkCall::Send(_, m) => Some(m),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl LinkControl for RecordingLink {
        async fn open_outbound(
            &self,
            attempt: AttemptId,
            host: String,
            port: u16,
        ) -> Result<(), String> {
            if self.refuse_dial {
                return Err("no route to host".to_string());
            }
            self.calls
                .lock()
                .unwrap()
                .push(LinkCall::Open(attempt, host, port));
            Ok(())
        }

        async fn send(&self, conn: ConnectionId, message: Message) -> Result<(), String> {
            self.calls.lock().unwrap().push(LinkCall::Send(conn, message));
            Ok(())
        }

        async fn close(&self, conn: ConnectionId) -> Result<(), String> {
            self.calls.lock().unwrap().push(LinkCall::Close(conn));
            Ok(())
        }
    }

    struct Harness {
        handle: SessionHandle,
        task: JoinHandle<()>,
        link: Arc<RecordingLink>,
        link_tx: mpsc::Sender<LinkEvent>,
    }

    fn config() -> ServiceConfig {
        ServiceConfig {
            identity: LocalIdentity {
                device_name: "Steam Deck".to_string(),
                device_type: DeviceType::Deck,
                port: 52525,
            },
            keepalive: KeepaliveConfig::default(),
            tick_interval: Duration::from_secs(3600),
            reset_after_error: false,
        }
    }

    fn start(link: RecordingLink, directory: MockPeerDirectory) -> Harness {
        start_with(config(), link, directory)
    }

    fn start_with(config: ServiceConfig, link: RecordingLink, directory: MockPeerDirectory) -> Harness {
        let link = Arc::new(link);
        let (link_tx, link_rx) = mpsc::channel(16);
        let (handle, task) = spawn_session_service(
            config,
            Arc::clone(&link) as Arc<dyn LinkControl>,
            Arc::new(directory),
            link_rx,
        );
        Harness {
            handle,
            task,
            link,
            link_tx,
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event within 2s")
            .expect("event channel open")
    }

    async fn wait_for_event(
        rx: &mut broadcast::Receiver<SessionEvent>,
        name: &str,
    ) -> SessionEvent {
        loop {
            let event = next_event(rx).await;
            if event.name() == name {
                return event;
            }
        }
    }

    fn remote() -> SocketAddr {
        "192.168.1.50:40100".parse().unwrap()
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_connect_dials_and_moves_to_awaiting_challenge() {
        // Arrange
        let h = start(RecordingLink::default(), MockPeerDirectory::new());

        // Act
        h.handle.connect("192.168.1.20", 52525).await.unwrap();

        // Assert
        let calls = h.link.calls();
        assert!(matches!(
            calls.as_slice(),
            [LinkCall::Open(_, host, 52525)] if host == "192.168.1.20"
        ));
        let status = h.handle.get_status().await.unwrap();
        assert_eq!(status.state, ConnectionState::AwaitingChallenge);
    }

    #[tokio::test]
    async fn test_connect_while_busy_returns_command_error() {
        let h = start(RecordingLink::default(), MockPeerDirectory::new());
        h.handle.connect("192.168.1.20", 52525).await.unwrap();

        let result = h.handle.connect("192.168.1.21", 52525).await;

        assert!(matches!(
            result,
            Err(ServiceError::Command(CommandError::SessionActive { .. }))
        ));
    }

    #[tokio::test]
    async fn test_dial_that_cannot_start_ends_in_error_state() {
        // Arrange
        let h = start(
            RecordingLink {
                refuse_dial: true,
                ..RecordingLink::default()
            },
            MockPeerDirectory::new(),
        );
        let mut events = h.handle.subscribe();

        // Act
        h.handle.connect("10.0.0.9", 52525).await.unwrap();

        // Assert
        let event = wait_for_event(&mut events, "connection_error").await;
        assert_eq!(
            event,
            SessionEvent::ConnectionError {
                error: "no route to host".to_string()
            }
        );
        let status = h.handle.get_status().await.unwrap();
        assert_eq!(status.state, ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_headless_service_leaves_error_state_on_its_own() {
        // Arrange
        let h = start_with(
            ServiceConfig {
                reset_after_error: true,
                ..config()
            },
            RecordingLink {
                refuse_dial: true,
                ..RecordingLink::default()
            },
            MockPeerDirectory::new(),
        );
        let mut events = h.handle.subscribe();

        // Act
        h.handle.connect("10.0.0.9", 52525).await.unwrap();

        // Assert
        wait_for_event(&mut events, "connection_error").await;
        wait_for_event(&mut events, "disconnected").await;
        let status = h.handle.get_status().await.unwrap();
        assert_eq!(status.state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_headless_receiver_accepts_new_peer_after_initiator_vanishes() {
        // Arrange: a laptop sends its request, then drops mid-handshake.
        let h = start_with(
            ServiceConfig {
                reset_after_error: true,
                ..config()
            },
            RecordingLink::default(),
            MockPeerDirectory::new(),
        );
        let mut events = h.handle.subscribe();
        let first = ConnectionId(1);
        h.link_tx
            .send(LinkEvent::InboundAccepted {
                conn: first,
                remote: remote(),
            })
            .await
            .unwrap();
        h.link_tx
            .send(LinkEvent::Received {
                conn: first,
                message: Message::ConnectionRequest(ConnectionRequestMessage {
                    device_name: "Laptop".to_string(),
                    device_type: DeviceType::Laptop,
                }),
            })
            .await
            .unwrap();
        wait_for_event(&mut events, "challenge_generated").await;
        h.link_tx.send(LinkEvent::Closed { conn: first }).await.unwrap();
        wait_for_event(&mut events, "disconnected").await;

        // Act
        let second = ConnectionId(2);
        h.link_tx
            .send(LinkEvent::InboundAccepted {
                conn: second,
                remote: remote(),
            })
            .await
            .unwrap();
        h.link_tx
            .send(LinkEvent::Received {
                conn: second,
                message: Message::ConnectionRequest(ConnectionRequestMessage {
                    device_name: "Other Laptop".to_string(),
                    device_type: DeviceType::Laptop,
                }),
            })
            .await
            .unwrap();

        // Assert
        let SessionEvent::ChallengeGenerated { peer_name, .. } =
            wait_for_event(&mut events, "challenge_generated").await
        else {
            panic!("expected challenge_generated");
        };
        assert_eq!(peer_name, "Other Laptop");
        assert_eq!(
            h.handle.get_status().await.unwrap().state,
            ConnectionState::ChallengeSent
        );
    }

    #[tokio::test]
    async fn test_send_notification_without_session_is_rejected() {
        let h = start(RecordingLink::default(), MockPeerDirectory::new());

        let result = h.handle.send_notification("t", "b").await;

        assert_eq!(
            result,
            Err(ServiceError::Command(CommandError::NotConnected))
        );
        assert!(h.link.calls().is_empty());
    }

    #[tokio::test]
    async fn test_get_peers_reads_from_directory() {
        // Arrange
        let mut directory = MockPeerDirectory::new();
        directory.expect_list_peers().times(1).returning(|| {
            vec![Peer::new("Laptop", "192.168.1.30", 52525, DeviceType::Laptop)]
        });
        let h = start(RecordingLink::default(), directory);

        // Act
        let peers = h.handle.get_peers();

        // Assert
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "Laptop");
    }

    // ── Transport-driven flow ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_inbound_request_then_correct_passphrase_connects() {
        // Arrange
        let h = start(RecordingLink::default(), MockPeerDirectory::new());
        let mut events = h.handle.subscribe();
        let conn = ConnectionId(7);

        // Act
        h.link_tx
            .send(LinkEvent::InboundAccepted {
                conn,
                remote: remote(),
            })
            .await
            .unwrap();
        h.link_tx
            .send(LinkEvent::Received {
                conn,
                message: Message::ConnectionRequest(ConnectionRequestMessage {
                    device_name: "Alice's Laptop".to_string(),
                    device_type: DeviceType::Laptop,
                }),
            })
            .await
            .unwrap();
        let SessionEvent::ChallengeGenerated {
            session_id,
            passphrase,
            peer_name,
        } = wait_for_event(&mut events, "challenge_generated").await
        else {
            panic!("expected challenge_generated");
        };
        h.link_tx
            .send(LinkEvent::Received {
                conn,
                message: Message::AuthAttempt(AuthAttemptMessage {
                    session_id,
                    passphrase: passphrase.to_uppercase(),
                }),
            })
            .await
            .unwrap();

        // Assert
        assert_eq!(peer_name, "Alice's Laptop");
        let connected = wait_for_event(&mut events, "connected").await;
        assert_eq!(
            connected,
            SessionEvent::Connected {
                peer_name: "Alice's Laptop".to_string(),
                peer_ip: "192.168.1.50".to_string(),
            }
        );
        let sent = h.link.sent();
        assert!(matches!(sent[0], Message::ChallengeResponse(_)));
        assert!(matches!(&sent[1], Message::AuthResult(r) if r.success));
    }

    #[tokio::test]
    async fn test_disconnect_when_connected_sends_disconnect_then_close() {
        // Arrange
        let h = start(RecordingLink::default(), MockPeerDirectory::new());
        let mut events = h.handle.subscribe();
        let conn = ConnectionId(1);
        h.link_tx
            .send(LinkEvent::InboundAccepted {
                conn,
                remote: remote(),
            })
            .await
            .unwrap();
        h.link_tx
            .send(LinkEvent::Received {
                conn,
                message: Message::ConnectionRequest(ConnectionRequestMessage {
                    device_name: "Laptop".to_string(),
                    device_type: DeviceType::Laptop,
                }),
            })
            .await
            .unwrap();
        let SessionEvent::ChallengeGenerated {
            session_id,
            passphrase,
            ..
        } = wait_for_event(&mut events, "challenge_generated").await
        else {
            panic!("expected challenge_generated");
        };
        h.link_tx
            .send(LinkEvent::Received {
                conn,
                message: Message::AuthAttempt(AuthAttemptMessage {
                    session_id,
                    passphrase,
                }),
            })
            .await
            .unwrap();
        wait_for_event(&mut events, "connected").await;

        // Act
        h.handle.disconnect().await.unwrap();

        // Assert
        let calls = h.link.calls();
        let tail = &calls[calls.len() - 2..];
        assert_eq!(
            tail,
            &[
                LinkCall::Send(conn, Message::Disconnect { reason: None }),
                LinkCall::Close(conn),
            ]
        );
        let status = h.handle.get_status().await.unwrap();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.session_id.is_none());
    }

    #[tokio::test]
    async fn test_dropping_every_handle_stops_the_service() {
        // Arrange
        let h = start(RecordingLink::default(), MockPeerDirectory::new());
        h.handle.connect("192.168.1.20", 52525).await.unwrap();

        // Act
        drop(h.handle);

        // Assert
        timeout(Duration::from_secs(2), h.task)
            .await
            .expect("service stops")
            .expect("service task does not panic");
    }

    #[tokio::test]
    async fn test_stopped_service_reports_stopped() {
        let h = start(RecordingLink::default(), MockPeerDirectory::new());
        h.task.abort();
        let _ = h.task.await;

        let result = h.handle.get_status().await;

        assert_eq!(result, Err(ServiceError::Stopped));
    }
}
