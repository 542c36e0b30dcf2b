//! JSON-lines bridge between the daemon and a UI process.
//!
//! The UI spawns `decklink run --ipc` and talks to it over stdin/stdout, one
//! JSON object per line:
//!
//! ```text
//! → {"id": 1, "method": "connect", "params": {"host": "192.168.1.20"}}
//! ← {"id": 1, "result": {"ok": true}}
//! ← {"event": "state_changed", "data": {"old": "disconnected", "new": "awaiting_challenge"}}
//! ```
//!
//! Responses carry the request `id` and either `result` or `error`.  Events
//! are pushed as they happen and carry no `id`.
//!
//! # Methods
//!
//! | method | params | result |
//! |---|---|---|
//! | `ping` | – | `"pong"` |
//! | `get_status` | – | status snapshot |
//! | `get_peers` | – | array of peers |
//! | `connect` | `host`, `port?` | `{"ok": true}` |
//! | `submit_passphrase` | `passphrase` | `{"ok": true}` |
//! | `disconnect` | – | `{"ok": true}` |
//! | `send_notification` | `title`, `body` | `{"ok": true}` |
//!
//! # Why a line protocol (for beginners)
//!
//! Every UI toolkit can spawn a child process and read lines from its stdout.
//! Keeping the daemon a plain process means the Deck and the laptop UIs can
//! be written in whatever they like without linking Rust.  Logs go to stderr
//! in this mode so they never corrupt the protocol stream.

use decklink_core::DEFAULT_PORT;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{debug, info, warn};

use crate::application::SessionHandle;

// ── Wire types ────────────────────────────────────────────────────────────────

/// One request line from the UI.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// One response line to the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcResponse {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, msg: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Debug, Deserialize)]
struct PassphraseParams {
    passphrase: String,
}

#[derive(Debug, Deserialize)]
struct NotificationParams {
    title: String,
    #[serde(default)]
    body: String,
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

fn params<T: DeserializeOwned>(raw: Value) -> Result<T, String> {
    let raw = if raw.is_null() { json!({}) } else { raw };
    serde_json::from_value(raw).map_err(|e| format!("invalid params: {e}"))
}

fn done() -> Value {
    json!({ "ok": true })
}

/// Runs one request against the session service.
pub async fn dispatch(handle: &SessionHandle, request: RpcRequest) -> RpcResponse {
    let RpcRequest { id, method, params: raw } = request;
    debug!("ipc request: {method}");

    let outcome: Result<Value, String> = match method.as_str() {
        "ping" => Ok(json!("pong")),
        "get_status" => match handle.get_status().await {
            Ok(status) => serde_json::to_value(status).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        },
        "get_peers" => serde_json::to_value(handle.get_peers()).map_err(|e| e.to_string()),
        "connect" => match params::<ConnectParams>(raw) {
            Ok(p) => handle
                .connect(&p.host, p.port)
                .await
                .map(|()| done())
                .map_err(|e| e.to_string()),
            Err(e) => Err(e),
        },
        "submit_passphrase" => match params::<PassphraseParams>(raw) {
            Ok(p) => handle
                .submit_passphrase(&p.passphrase)
                .await
                .map(|()| done())
                .map_err(|e| e.to_string()),
            Err(e) => Err(e),
        },
        "disconnect" => handle
            .disconnect()
            .await
            .map(|()| done())
            .map_err(|e| e.to_string()),
        "send_notification" => match params::<NotificationParams>(raw) {
            Ok(p) => handle
                .send_notification(&p.title, &p.body)
                .await
                .map(|()| done())
                .map_err(|e| e.to_string()),
            Err(e) => Err(e),
        },
        other => Err(format!("unknown method: {other}")),
    };

    match outcome {
        Ok(result) => RpcResponse::ok(id, result),
        Err(error) => RpcResponse::err(id, error),
    }
}

/// Parses and dispatches one input line.
pub async fn handle_line(handle: &SessionHandle, line: &str) -> RpcResponse {
    match serde_json::from_str::<RpcRequest>(line) {
        Ok(request) => dispatch(handle, request).await,
        Err(e) => RpcResponse::err(Value::Null, format!("invalid request: {e}")),
    }
}

// ── Serving ───────────────────────────────────────────────────────────────────

/// Serves requests from `input` and writes responses and events to `output`
/// until `input` reaches end of file.
///
/// # Errors
///
/// Returns the first I/O error on `input` or `output`.
pub async fn serve<R, W>(handle: SessionHandle, input: R, output: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();

    // Single writer so responses and events never interleave mid-line.
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(line) = line_rx.recv().await {
            output.write_all(line.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    });

    let mut events = handle.subscribe();
    let event_tx = line_tx.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => {
                        if event_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("could not serialise {} event: {e}", event.name()),
                },
                Err(RecvError::Lagged(skipped)) => warn!("ui bridge dropped {skipped} event(s)"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = input.lines();
    let read_result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&handle, &line).await;
        match serde_json::to_string(&response) {
            Ok(text) => {
                if line_tx.send(text).is_err() {
                    break Ok(());
                }
            }
            Err(e) => warn!("could not serialise response: {e}"),
        }
    };

    info!("ui bridge input closed");
    forwarder.abort();
    drop(line_tx);
    let write_result = match writer.await {
        Ok(result) => result,
        Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
    };
    read_result.and(write_result)
}

/// [`serve`] over the process's stdin and stdout.
pub async fn run_stdio(handle: SessionHandle) -> std::io::Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    serve(handle, stdin, tokio::io::stdout()).await
}

// ── Tests ─────────────────────────────────────────────────────────────────────
