//! Deck-Link daemon: entry point.
//!
//! # Usage
//!
//! ```text
//! decklink [--config PATH] <COMMAND>
//!
//! Commands:
//!   run       Listen for peers, advertise over mDNS and serve the UI
//!   scan      Browse the LAN for Deck-Link peers and print them
//!   connect   Pair with HOST interactively from the terminal
//! ```
//!
//! `run --ipc` is how a UI process embeds the daemon: requests arrive on
//! stdin, responses and events leave on stdout, logs go to stderr.
//!
//! # Environment variable overrides
//!
//! | Variable          | Description                          |
//! |-------------------|--------------------------------------|
//! | `DECKLINK_CONFIG` | Config file path                     |
//! | `DECKLINK_NAME`   | Device name shown to peers           |
//! | `DECKLINK_PORT`   | Listener port                        |
//! | `RUST_LOG`        | Log filter, overrides `log_level`    |
//!
//! Command-line flags take precedence over the config file.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use decklink_core::{DeviceType, LocalIdentity, SessionEvent, DEFAULT_PORT};
use decklink_daemon::application::{
    spawn_session_service, PeerDirectory, ServiceConfig, SessionHandle,
};
use decklink_daemon::infrastructure::network::{
    DiscoverySettings, MdnsDiscovery, TransportConfig, WsTransport,
};
use decklink_daemon::infrastructure::storage::{load_config, DaemonConfig};
use decklink_daemon::infrastructure::ui_bridge;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Deck-Link pairing daemon.
#[derive(Debug, Parser)]
#[command(
    name = "decklink",
    about = "Pair a handheld and a laptop on the local network with a spoken word",
    version
)]
struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, global = true, env = "DECKLINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Listen for peers, advertise over mDNS and serve the UI.
    Run(RunArgs),

    /// Browse the LAN for peers and print what was found.
    Scan {
        /// Seconds to listen for announcements.
        #[arg(long, default_value_t = 3)]
        timeout: u64,
    },

    /// Pair with HOST from this terminal.
    Connect {
        host: String,

        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Which kind of device this is: `laptop` or `deck`.
    #[arg(long)]
    mode: Option<DeviceType>,

    /// Name shown to peers.
    #[arg(long, env = "DECKLINK_NAME")]
    name: Option<String>,

    /// Listener port.
    #[arg(long, env = "DECKLINK_PORT")]
    port: Option<u16>,

    /// Serve the JSON-lines UI bridge on stdin/stdout.
    #[arg(long)]
    ipc: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref()).context("failed to load configuration")?;

    let logs_to_stderr = matches!(&cli.command, Command::Run(args) if args.ipc);
    init_logging(&config.device.log_level, logs_to_stderr);

    match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::Scan { timeout } => scan(config, Duration::from_secs(timeout)).await,
        Command::Connect { host, port } => connect(config, host, port).await,
    }
}

/// `RUST_LOG` wins; otherwise the config's `log_level`.
fn init_logging(default_level: &str, to_stderr: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}

// ── Wiring ────────────────────────────────────────────────────────────────────

/// How the daemon is driven once it is up.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Frontend {
    /// `run` with nothing attached; failures reset on their own.
    Headless,
    /// `run --ipc`; the UI decides when to leave `error`.
    Ipc,
    /// `connect`; dials out only and never listens.
    Dialer,
}

/// Everything a running daemon owns, torn down in reverse order.
struct Daemon {
    handle: SessionHandle,
    service: JoinHandle<()>,
    transport: Arc<WsTransport>,
    discovery: Arc<MdnsDiscovery>,
    /// The identity the service reports, with the port actually bound.
    identity: LocalIdentity,
}

impl Daemon {
    /// Binds the listener first (unless dialing only) so the session
    /// service and the mDNS advert see the real port, even for port 0.
    async fn start(
        config: &DaemonConfig,
        mut identity: LocalIdentity,
        discovery: Arc<MdnsDiscovery>,
        frontend: Frontend,
    ) -> anyhow::Result<Self> {
        let (link_tx, link_rx) = mpsc::channel(256);
        let transport = Arc::new(WsTransport::new(
            TransportConfig {
                bind_address: config.network.bind_address.clone(),
                port: identity.port,
                connect_timeout: config.network.connect_timeout(),
            },
            link_tx,
        ));
        if frontend != Frontend::Dialer {
            let local = transport
                .listen()
                .await
                .context("failed to start the peer listener")?;
            identity.port = local.port();
        }
        let (handle, service) = spawn_session_service(
            ServiceConfig {
                identity: identity.clone(),
                keepalive: config.network.keepalive(),
                tick_interval: Duration::from_secs(1),
                reset_after_error: frontend == Frontend::Headless,
            },
            transport.clone(),
            discovery.clone(),
            link_rx,
        );
        Ok(Self {
            handle,
            service,
            transport,
            discovery,
            identity,
        })
    }

    async fn shutdown(self) {
        let Daemon {
            handle,
            service,
            transport,
            discovery,
            ..
        } = self;
        // Dropping the last handle makes the service disconnect and exit.
        drop(handle);
        if tokio::time::timeout(Duration::from_secs(2), service).await.is_err() {
            warn!("session service did not stop in time");
        }
        transport.shutdown().await;
        discovery.shutdown();
        info!("stopped");
    }
}

fn discovery_settings(config: &DaemonConfig, enabled: bool) -> DiscoverySettings {
    DiscoverySettings {
        enabled,
        staleness: config.discovery.staleness(),
        refresh: config.discovery.refresh(),
    }
}

/// Starts mDNS, falling back to manual connect-by-address if it is
/// unavailable.
fn start_discovery(config: &DaemonConfig) -> anyhow::Result<MdnsDiscovery> {
    if config.discovery.enabled {
        match MdnsDiscovery::new(discovery_settings(config, true)) {
            Ok(discovery) => return Ok(discovery),
            Err(e) => warn!("mDNS unavailable, continuing without discovery: {e}"),
        }
    }
    MdnsDiscovery::new(discovery_settings(config, false)).context("failed to set up discovery")
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn run(config: DaemonConfig, args: RunArgs) -> anyhow::Result<()> {
    let identity = LocalIdentity {
        device_name: args.name.unwrap_or_else(|| config.device.name.clone()),
        device_type: args.mode.unwrap_or(config.device.device_type),
        port: args.port.unwrap_or(config.network.port),
    };

    let discovery = Arc::new(start_discovery(&config)?);
    let frontend = if args.ipc {
        Frontend::Ipc
    } else {
        Frontend::Headless
    };
    let daemon = Daemon::start(&config, identity, discovery, frontend).await?;
    let identity = daemon.identity.clone();
    info!(
        "{} ({}) ready on port {}",
        identity.device_name, identity.device_type, identity.port
    );

    if config.discovery.enabled {
        if let Err(e) = daemon.discovery.start_advertising(&identity) {
            warn!("mDNS advertisement failed: {e}");
        }
        if let Err(e) = daemon.discovery.start_browsing() {
            warn!("mDNS browse failed: {e}");
        }
    }

    if args.ipc {
        tokio::select! {
            result = ui_bridge::run_stdio(daemon.handle.clone()) => {
                if let Err(e) = result {
                    warn!("ui bridge stopped: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => info!("received Ctrl+C; shutting down"),
        }
    } else {
        let printer = tokio::spawn(print_events(daemon.handle.subscribe()));
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
        info!("received Ctrl+C; shutting down");
        printer.abort();
    }

    daemon.shutdown().await;
    Ok(())
}

/// Console rendering of events for headless `run`.
async fn print_events(mut events: tokio::sync::broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::ChallengeGenerated {
                passphrase,
                peer_name,
                ..
            }) => println!("{peer_name} wants to pair. Passphrase: {passphrase}"),
            Ok(SessionEvent::Connected { peer_name, peer_ip }) => {
                println!("Paired with {peer_name} ({peer_ip})")
            }
            Ok(SessionEvent::AuthFailed { reason }) => println!("Pairing failed: {reason}"),
            Ok(SessionEvent::ConnectionError { error }) => println!("Connection error: {error}"),
            Ok(SessionEvent::Disconnected {}) => println!("Disconnected"),
            Ok(SessionEvent::Notification { title, body }) => println!("[{title}] {body}"),
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}

async fn scan(config: DaemonConfig, listen_for: Duration) -> anyhow::Result<()> {
    let discovery = MdnsDiscovery::new(discovery_settings(&config, true))
        .context("failed to start mDNS")?;
    discovery
        .start_browsing()
        .context("failed to browse for peers")?;
    tokio::time::sleep(listen_for).await;

    let peers = discovery.list_peers();
    discovery.shutdown();

    if peers.is_empty() {
        println!("No Deck-Link peers found.");
    }
    for peer in peers {
        println!(
            "{:<24} {:<7} {}:{}",
            peer.name, peer.device_type, peer.host, peer.port
        );
    }
    Ok(())
}

async fn connect(config: DaemonConfig, host: String, port: u16) -> anyhow::Result<()> {
    let identity = LocalIdentity {
        device_name: config.device.name.clone(),
        device_type: config.device.device_type,
        port: config.network.port,
    };
    let discovery = Arc::new(
        MdnsDiscovery::new(discovery_settings(&config, false))
            .context("failed to set up discovery")?,
    );
    let daemon = Daemon::start(&config, identity, discovery, Frontend::Dialer).await?;
    let mut events = daemon.handle.subscribe();

    daemon
        .handle
        .connect(&host, port)
        .await
        .with_context(|| format!("could not start connecting to {host}:{port}"))?;
    println!("Connecting to {host}:{port} ...");

    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let outcome = loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => break Ok(()),
        };
        match event {
            Ok(SessionEvent::PassphraseRequired { peer_name, .. }) => {
                print!("Enter the word shown on {peer_name}: ");
                let _ = std::io::stdout().flush();
                let word = match stdin.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break Err(anyhow!("stdin closed before a passphrase was entered")),
                    Err(e) => break Err(anyhow!(e).context("failed to read passphrase")),
                };
                if let Err(e) = daemon.handle.submit_passphrase(&word).await {
                    break Err(anyhow!(e).context("could not submit passphrase"));
                }
            }
            Ok(SessionEvent::Connected { peer_name, peer_ip }) => {
                println!("Paired with {peer_name} ({peer_ip}). Press Ctrl+C to disconnect.")
            }
            Ok(SessionEvent::Notification { title, body }) => println!("[{title}] {body}"),
            Ok(SessionEvent::AuthFailed { reason }) => break Err(anyhow!("pairing failed: {reason}")),
            Ok(SessionEvent::ConnectionError { error }) => {
                break Err(anyhow!("connection error: {error}"))
            }
            Ok(SessionEvent::Disconnected {}) => {
                println!("Disconnected.");
                break Ok(());
            }
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break Ok(()),
        }
    };

    daemon.shutdown().await;
    outcome
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_defaults_leave_overrides_unset() {
        let cli = Cli::parse_from(["decklink", "run"]);

        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.mode.is_none());
        assert!(args.port.is_none());
        assert!(!args.ipc);
    }

    #[test]
    fn test_run_parses_mode_and_ipc() {
        let cli = Cli::parse_from(["decklink", "run", "--mode", "deck", "--ipc", "--port", "6000"]);

        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.mode, Some(DeviceType::Deck));
        assert_eq!(args.port, Some(6000));
        assert!(args.ipc);
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let result = Cli::try_parse_from(["decklink", "run", "--mode", "phone"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_connect_defaults_to_standard_port() {
        let cli = Cli::parse_from(["decklink", "connect", "192.168.1.20"]);

        match cli.command {
            Command::Connect { host, port } => {
                assert_eq!(host, "192.168.1.20");
                assert_eq!(port, 52525);
            }
            other => panic!("expected connect, got {other:?}"),
        }
    }

    #[test]
    fn test_config_flag_is_global() {
        let cli = Cli::parse_from(["decklink", "scan", "--config", "/tmp/dl.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/dl.toml")));
    }

    #[test]
    fn test_scan_timeout_default() {
        let cli = Cli::parse_from(["decklink", "scan"]);
        assert!(matches!(cli.command, Command::Scan { timeout: 3 }));
    }

    fn local_config() -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.network.bind_address = "127.0.0.1".to_string();
        config.discovery.enabled = false;
        config
    }

    fn identity_on(port: u16) -> LocalIdentity {
        LocalIdentity {
            device_name: "Deck".to_string(),
            device_type: DeviceType::Deck,
            port,
        }
    }

    #[tokio::test]
    async fn test_port_zero_reports_the_bound_port_in_status() {
        // Arrange
        let config = local_config();
        let discovery = Arc::new(MdnsDiscovery::new(discovery_settings(&config, false)).unwrap());

        // Act
        let daemon = Daemon::start(&config, identity_on(0), discovery, Frontend::Headless)
            .await
            .unwrap();
        let status = daemon.handle.get_status().await.unwrap();

        // Assert
        assert_ne!(status.port, 0);
        assert_eq!(status.port, daemon.identity.port);
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_dialer_keeps_the_configured_port_without_listening() {
        // Arrange
        let config = local_config();
        let discovery = Arc::new(MdnsDiscovery::new(discovery_settings(&config, false)).unwrap());

        // Act
        let daemon = Daemon::start(&config, identity_on(52525), discovery, Frontend::Dialer)
            .await
            .unwrap();
        let status = daemon.handle.get_status().await.unwrap();

        // Assert
        assert_eq!(status.port, 52525);
        daemon.shutdown().await;
    }
}
