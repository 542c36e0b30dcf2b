//! WebSocket transport: listener, outbound dialer and per-connection tasks.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener and upgrading accepted sockets to WebSocket.
//! 2. Dialing `ws://host:port` when the session service asks for it.
//! 3. Running a reader and a writer task per connection.
//! 4. Reporting everything that happens as [`LinkEvent`]s on one channel.
//!
//! The transport has no opinion about sessions.  It accepts every inbound
//! connection and lets the state machine decide whether to refuse it, which
//! is how a second device gets a proper `already_connected` error instead of
//! a bare TCP reset.
//!
//! # Ordering
//!
//! A connection's `InboundAccepted` / `OutboundOpened` event is always queued
//! before its reader task starts, so the session service never sees a
//! `Received` for a connection it has not been told about.  Frames sent on one
//! connection are written in the order [`WsTransport::send`] was called, and a
//! close is only performed after every frame queued before it.
//!
//! # Limits
//!
//! Both directions cap WebSocket messages and frames at [`MAX_FRAME_LEN`],
//! so an oversized message fails the connection before it is buffered.  An
//! inbound socket that does not finish the upgrade within `connect_timeout`
//! is dropped without ever being reported.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use decklink_core::protocol::MAX_FRAME_LEN;
use decklink_core::{decode_message, encode_message_now, AttemptId, ConnectionId, LinkEvent, Message};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_async_with_config, connect_async_with_config,
    tungstenite::{protocol::WebSocketConfig, Error as WsError, Message as WsMessage},
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::application::LinkControl;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The listener could not be bound.
    #[error("failed to bind WebSocket listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A frame could not be encoded.
    #[error("failed to encode frame: {0}")]
    Encode(#[from] decklink_core::ProtocolError),

    /// The connection is not (or no longer) open.
    #[error("no open connection {0}")]
    UnknownConnection(ConnectionId),
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Address the listener binds to, e.g. `"0.0.0.0"`.
    pub bind_address: String,
    /// Listener port.  `0` lets the OS pick one.
    pub port: u16,
    /// Upper bound on an outbound dial, WebSocket handshake included.  Also
    /// bounds the upgrade of an accepted inbound socket.
    pub connect_timeout: Duration,
}

enum Outgoing {
    Frame(String),
    Close,
}

struct Shared {
    events: mpsc::Sender<LinkEvent>,
    connections: Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<Outgoing>>>,
    next_conn: AtomicU64,
    running: AtomicBool,
}

impl Shared {
    /// Allocates an id and registers the writer queue for a new connection.
    async fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Outgoing>) {
        let conn = ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.lock().await.insert(conn, tx);
        (conn, rx)
    }

    async fn report(&self, event: LinkEvent) {
        if self.events.send(event).await.is_err() {
            debug!("session service gone; dropping transport event");
        }
    }
}

/// WebSocket implementation of [`LinkControl`].
pub struct WsTransport {
    config: TransportConfig,
    shared: Arc<Shared>,
}

impl WsTransport {
    /// Creates a transport that reports into `events`.  Nothing is bound
    /// until [`WsTransport::listen`] is called.
    pub fn new(config: TransportConfig, events: mpsc::Sender<LinkEvent>) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                events,
                connections: Mutex::new(HashMap::new()),
                next_conn: AtomicU64::new(1),
                running: AtomicBool::new(true),
            }),
        }
    }

    /// Binds the listener and starts the accept loop in the background.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// the configured port is `0`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if the address is in use or the
    /// process lacks permission to bind.
    pub async fn listen(&self) -> Result<SocketAddr, TransportError> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr().map_err(|source| TransportError::Bind {
            addr: addr.clone(),
            source,
        })?;
        info!("listening for peers on ws://{local}");

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            self.config.connect_timeout,
        ));
        Ok(local)
    }

    /// Stops accepting and closes every open connection.
    pub async fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
        let mut connections = self.shared.connections.lock().await;
        for (conn, tx) in connections.drain() {
            debug!("closing {conn} for shutdown");
            let _ = tx.send(Outgoing::Close);
        }
    }

    async fn queue(&self, conn: ConnectionId, item: Outgoing) -> Result<(), TransportError> {
        let connections = self.shared.connections.lock().await;
        let tx = connections
            .get(&conn)
            .ok_or(TransportError::UnknownConnection(conn))?;
        tx.send(item)
            .map_err(|_| TransportError::UnknownConnection(conn))
    }

    /// Queues `message` on `conn`.
    ///
    /// # Errors
    ///
    /// [`TransportError::Encode`] if the frame cannot be serialised and
    /// [`TransportError::UnknownConnection`] if `conn` is not open.
    pub async fn send(&self, conn: ConnectionId, message: &Message) -> Result<(), TransportError> {
        let text = encode_message_now(message)?;
        self.queue(conn, Outgoing::Frame(text)).await
    }

    /// Closes `conn` once its queued frames are written.  Closing a
    /// connection that is already gone succeeds.
    pub async fn close(&self, conn: ConnectionId) {
        let tx = self.shared.connections.lock().await.remove(&conn);
        if let Some(tx) = tx {
            let _ = tx.send(Outgoing::Close);
        }
    }

    /// Starts dialing `host:port` in the background.
    pub fn open_outbound(&self, attempt: AttemptId, host: String, port: u16) {
        let shared = Arc::clone(&self.shared);
        let limit = self.config.connect_timeout;
        tokio::spawn(async move {
            let url = ws_url(&host, port);
            debug!("dialing {url}");
            let dial = connect_async_with_config(url.as_str(), Some(ws_config()), false);
            match timeout(limit, dial).await {
                Ok(Ok((ws_stream, _response))) => {
                    let (conn, outgoing) = shared.register().await;
                    info!("outbound {conn} connected to {host}:{port}");
                    shared
                        .report(LinkEvent::OutboundOpened { attempt, conn })
                        .await;
                    spawn_io(shared, conn, ws_stream, outgoing);
                }
                Ok(Err(e)) => {
                    warn!("connection to {host}:{port} failed: {e}");
                    shared
                        .report(LinkEvent::OutboundFailed {
                            attempt,
                            error: format!("connection to {host}:{port} failed: {e}"),
                        })
                        .await;
                }
                Err(_) => {
                    warn!("connection to {host}:{port} timed out");
                    shared
                        .report(LinkEvent::OutboundFailed {
                            attempt,
                            error: format!("connection to {host}:{port} timed out"),
                        })
                        .await;
                }
            }
        });
    }
}

#[async_trait]
impl LinkControl for WsTransport {
    async fn open_outbound(
        &self,
        attempt: AttemptId,
        host: String,
        port: u16,
    ) -> Result<(), String> {
        if !self.shared.running.load(Ordering::Relaxed) {
            return Err("transport is shut down".to_string());
        }
        WsTransport::open_outbound(self, attempt, host, port);
        Ok(())
    }

    async fn send(&self, conn: ConnectionId, message: Message) -> Result<(), String> {
        WsTransport::send(self, conn, &message)
            .await
            .map_err(|e| e.to_string())
    }

    async fn close(&self, conn: ConnectionId) -> Result<(), String> {
        WsTransport::close(self, conn).await;
        Ok(())
    }
}

/// `ws://host:port`, bracketing bare IPv6 literals.
pub fn ws_url(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("ws://[{host}]:{port}")
    } else {
        format!("ws://{host}:{port}")
    }
}

fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_FRAME_LEN),
        max_frame_size: Some(MAX_FRAME_LEN),
        ..WebSocketConfig::default()
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, handshake_limit: Duration) {
    loop {
        if !shared.running.load(Ordering::Relaxed) {
            info!("transport shut down; stopping accept loop");
            break;
        }

        // Short timeout so the running flag is re-checked while idle.
        match timeout(Duration::from_millis(200), listener.accept()).await {
            Ok(Ok((stream, remote))) => {
                debug!("tcp connection from {remote}");
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let upgrade = accept_async_with_config(stream, Some(ws_config()));
                    let ws_stream = match timeout(handshake_limit, upgrade).await {
                        Ok(Ok(ws)) => ws,
                        Ok(Err(e)) => {
                            warn!("WebSocket handshake with {remote} failed: {e}");
                            return;
                        }
                        Err(_) => {
                            warn!("WebSocket handshake with {remote} timed out");
                            return;
                        }
                    };
                    let (conn, outgoing) = shared.register().await;
                    info!("inbound {conn} from {remote}");
                    shared
                        .report(LinkEvent::InboundAccepted { conn, remote })
                        .await;
                    spawn_io(shared, conn, ws_stream, outgoing);
                });
            }
            Ok(Err(e)) => error!("accept error: {e}"),
            Err(_) => {}
        }
    }
}

// ── Per-connection tasks ──────────────────────────────────────────────────────

fn spawn_io<S>(
    shared: Arc<Shared>,
    conn: ConnectionId,
    ws_stream: WebSocketStream<S>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws_stream.split();

    tokio::spawn(async move {
        while let Some(item) = outgoing.recv().await {
            match item {
                Outgoing::Frame(text) => {
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        debug!("{conn}: write failed: {e}");
                        break;
                    }
                }
                Outgoing::Close => {
                    debug!("{conn}: closing");
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        let outcome = loop {
            let frame = match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => text,
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        shared
                            .report(LinkEvent::Malformed {
                                conn,
                                error: decklink_core::ProtocolError::InvalidJson(
                                    "binary frame is not UTF-8".to_string(),
                                ),
                            })
                            .await;
                        continue;
                    }
                },
                Some(Ok(WsMessage::Close(_))) | None => break LinkEvent::Closed { conn },
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    break LinkEvent::Closed { conn }
                }
                Some(Err(e)) => {
                    break LinkEvent::Failed {
                        conn,
                        error: e.to_string(),
                    }
                }
            };

            match decode_message(&frame) {
                Ok(message) => {
                    debug!("{conn}: received {}", message.message_type());
                    shared.report(LinkEvent::Received { conn, message }).await;
                }
                Err(error) => {
                    debug!("{conn}: undecodable frame: {error}");
                    shared.report(LinkEvent::Malformed { conn, error }).await;
                }
            }
        };

        shared.connections.lock().await.remove(&conn);
        debug!("{conn}: reader finished");
        shared.report(outcome).await;
    });
}

// ── Tests ─────────────────────────────────────────────────────────────────────
