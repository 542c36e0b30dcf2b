//! mDNS advertisement and browsing for Deck-Link peers.
//!
//! Every running daemon registers one `_decklink._tcp.local.` service whose
//! TXT record carries `device_name`, `device_type` and `version`, and browses
//! the same type to build the list the UI shows.
//!
//! The bookkeeping lives in [`PeerRegistry`], a plain struct with no I/O, so
//! deduplication and staleness rules can be tested directly.  [`MdnsDiscovery`]
//! only translates `mdns-sd` events into registry calls.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, RwLock,
};
use std::time::{Duration, Instant};

use decklink_core::{DeviceType, LocalIdentity, Peer, PROTOCOL_VERSION, SERVICE_TYPE};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::application::PeerDirectory;

const TXT_DEVICE_NAME: &str = "device_name";
const TXT_DEVICE_TYPE: &str = "device_type";
const TXT_VERSION: &str = "version";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mDNS daemon error: {0}")]
    Mdns(#[from] mdns_sd::Error),

    #[error("discovery is disabled")]
    Disabled,
}

/// Knobs for [`MdnsDiscovery`].
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub enabled: bool,
    /// Entries not re-resolved within this window are dropped.
    pub staleness: Duration,
    /// The browse is restarted this often so live peers get re-resolved.
    pub refresh: Duration,
}

// ── Registry ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Entry {
    peer: Peer,
    last_seen: Instant,
}

/// In-memory view of discovered peers, keyed by `(host, port)`.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: HashMap<(String, u16), Entry>,
    /// mDNS full name → endpoint, so removals (which carry only the name)
    /// can find their entry.  Several names may share one endpoint; the entry
    /// lives until the last of them goes.
    names: HashMap<String, (String, u16)>,
    own_fullname: Option<String>,
    staleness: Duration,
}

impl PeerRegistry {
    pub fn new(staleness: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            names: HashMap::new(),
            own_fullname: None,
            staleness,
        }
    }

    /// Marks the service name this process advertises so it is never listed.
    pub fn set_own_fullname(&mut self, fullname: Option<String>) {
        if let Some(name) = &fullname {
            self.remove_service(name);
        }
        self.own_fullname = fullname;
    }

    /// Records a resolved service.  Returns `true` if the endpoint was new.
    pub fn upsert(&mut self, fullname: &str, peer: Peer, now: Instant) -> bool {
        if self.own_fullname.as_deref() == Some(fullname) {
            return false;
        }
        let key = (peer.host.clone(), peer.port);
        // The same name may have moved to a new address.
        if let Some(previous) = self.names.insert(fullname.to_string(), key.clone()) {
            if previous != key {
                self.release_if_unnamed(&previous);
            }
        }
        self.peers
            .insert(key, Entry { peer, last_seen: now })
            .is_none()
    }

    /// Forgets a service by its mDNS full name.
    ///
    /// Returns the peer only if this was the last name for its endpoint.
    pub fn remove_service(&mut self, fullname: &str) -> Option<Peer> {
        let key = self.names.remove(fullname)?;
        self.release_if_unnamed(&key)
    }

    fn release_if_unnamed(&mut self, key: &(String, u16)) -> Option<Peer> {
        if self.names.values().any(|k| k == key) {
            return None;
        }
        self.peers.remove(key).map(|e| e.peer)
    }

    /// Drops entries older than the staleness window.
    pub fn prune(&mut self, now: Instant) -> usize {
        let staleness = self.staleness;
        let before = self.peers.len();
        self.peers
            .retain(|_, e| now.saturating_duration_since(e.last_seen) < staleness);
        let peers = &self.peers;
        self.names.retain(|_, key| peers.contains_key(key));
        before - self.peers.len()
    }

    /// Current peers, sorted by name then endpoint for stable output.
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.values().map(|e| e.peer.clone()).collect();
        peers.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.host.cmp(&b.host))
                .then_with(|| a.port.cmp(&b.port))
        });
        peers
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.names.clear();
    }
}

// ── mDNS daemon wrapper ───────────────────────────────────────────────────────

/// Advertises this device and browses for others over mDNS.
pub struct MdnsDiscovery {
    daemon: Option<ServiceDaemon>,
    registry: Arc<RwLock<PeerRegistry>>,
    settings: DiscoverySettings,
    own_fullname: Mutex<Option<String>>,
    browsing: Arc<AtomicBool>,
}

impl MdnsDiscovery {
    /// Starts the mDNS daemon thread.  With discovery disabled no daemon is
    /// started and every operation is a no-op.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::Mdns`] if the daemon cannot open its sockets.
    pub fn new(settings: DiscoverySettings) -> Result<Self, DiscoveryError> {
        let daemon = if settings.enabled {
            Some(ServiceDaemon::new()?)
        } else {
            info!("mDNS discovery disabled");
            None
        };
        Ok(Self {
            daemon,
            registry: Arc::new(RwLock::new(PeerRegistry::new(settings.staleness))),
            settings,
            own_fullname: Mutex::new(None),
            browsing: Arc::new(AtomicBool::new(false)),
        })
    }

    fn daemon(&self) -> Result<&ServiceDaemon, DiscoveryError> {
        self.daemon.as_ref().ok_or(DiscoveryError::Disabled)
    }

    /// Registers this device under `_decklink._tcp.local.`.
    ///
    /// Calling it again replaces the previous advertisement.
    pub fn start_advertising(&self, identity: &LocalIdentity) -> Result<(), DiscoveryError> {
        let daemon = self.daemon()?;
        self.stop_advertising();

        let instance = instance_name(&identity.device_name);
        let host_name = format!("{}.local.", instance.to_ascii_lowercase());
        let properties = HashMap::from([
            (TXT_DEVICE_NAME.to_string(), identity.device_name.clone()),
            (TXT_DEVICE_TYPE.to_string(), identity.device_type.as_str().to_string()),
            (TXT_VERSION.to_string(), PROTOCOL_VERSION.to_string()),
        ]);
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &instance,
            &host_name,
            "",
            identity.port,
            properties,
        )?
        .enable_addr_auto();

        let fullname = info.get_fullname().to_string();
        daemon.register(info)?;
        info!("advertising {fullname} on port {}", identity.port);

        if let Ok(mut registry) = self.registry.write() {
            registry.set_own_fullname(Some(fullname.clone()));
        }
        if let Ok(mut own) = self.own_fullname.lock() {
            *own = Some(fullname);
        }
        Ok(())
    }

    /// Withdraws the advertisement, if any.
    pub fn stop_advertising(&self) {
        let fullname = self.own_fullname.lock().ok().and_then(|mut own| own.take());
        if let (Some(daemon), Some(fullname)) = (self.daemon.as_ref(), fullname) {
            match daemon.unregister(&fullname) {
                Ok(_) => info!("stopped advertising {fullname}"),
                Err(e) => warn!("failed to unregister {fullname}: {e}"),
            }
        }
    }

    /// Starts the background browse task.  Idempotent.
    pub fn start_browsing(&self) -> Result<(), DiscoveryError> {
        let daemon = self.daemon()?.clone();
        if self.browsing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let registry = Arc::clone(&self.registry);
        let browsing = Arc::clone(&self.browsing);
        let refresh = self.settings.refresh;

        tokio::spawn(async move {
            while browsing.load(Ordering::SeqCst) {
                let receiver: flume::Receiver<ServiceEvent> = match daemon.browse(SERVICE_TYPE) {
                    Ok(rx) => rx,
                    Err(e) => {
                        warn!("mDNS browse failed: {e}");
                        tokio::time::sleep(refresh).await;
                        continue;
                    }
                };
                debug!("browsing for {SERVICE_TYPE}");

                let round_started = Instant::now();
                while browsing.load(Ordering::SeqCst) && round_started.elapsed() < refresh {
                    match timeout(Duration::from_millis(500), receiver.recv_async()).await {
                        Ok(Ok(event)) => handle_event(&registry, event),
                        Ok(Err(_)) => break,
                        Err(_) => {}
                    }
                    if let Ok(mut registry) = registry.write() {
                        let dropped = registry.prune(Instant::now());
                        if dropped > 0 {
                            debug!("pruned {dropped} stale peer(s)");
                        }
                    }
                }

                if let Err(e) = daemon.stop_browse(SERVICE_TYPE) {
                    debug!("stop_browse: {e}");
                }
            }
            debug!("browse task finished");
        });
        Ok(())
    }

    pub fn stop_browsing(&self) {
        self.browsing.store(false, Ordering::SeqCst);
        if let Ok(mut registry) = self.registry.write() {
            registry.clear();
        }
    }

    /// Withdraws the advertisement, stops browsing and stops the daemon.
    pub fn shutdown(&self) {
        self.stop_advertising();
        self.stop_browsing();
        if let Some(daemon) = self.daemon.as_ref() {
            if let Err(e) = daemon.shutdown() {
                debug!("mDNS daemon shutdown: {e}");
            }
        }
    }
}

impl PeerDirectory for MdnsDiscovery {
    fn list_peers(&self) -> Vec<Peer> {
        match self.registry.read() {
            Ok(registry) => registry.snapshot(),
            Err(_) => Vec::new(),
        }
    }
}

fn handle_event(registry: &RwLock<PeerRegistry>, event: ServiceEvent) {
    match event {
        ServiceEvent::ServiceResolved(info) => {
            let Some(peer) = peer_from_service(&info) else {
                return;
            };
            if let Ok(mut registry) = registry.write() {
                if registry.upsert(info.get_fullname(), peer.clone(), Instant::now()) {
                    info!("discovered {} at {}:{}", peer.name, peer.host, peer.port);
                }
            }
        }
        ServiceEvent::ServiceRemoved(_, fullname) => {
            if let Ok(mut registry) = registry.write() {
                if let Some(peer) = registry.remove_service(&fullname) {
                    info!("{} left the network", peer.name);
                }
            }
        }
        _ => {}
    }
}

/// Builds a [`Peer`] from a resolved record.  Records without an address
/// or with an unknown device type are skipped.
fn peer_from_service(info: &ServiceInfo) -> Option<Peer> {
    let host = info
        .get_addresses_v4()
        .into_iter()
        .min()
        .map(|ip| ip.to_string())
        .or_else(|| info.get_addresses().iter().next().map(|ip| ip.to_string()))?;

    let device_type = match info.get_property_val_str(TXT_DEVICE_TYPE) {
        Some(raw) => match raw.parse::<DeviceType>() {
            Ok(t) => t,
            Err(e) => {
                debug!("ignoring {}: {e}", info.get_fullname());
                return None;
            }
        },
        None => DeviceType::Laptop,
    };
    let name = info
        .get_property_val_str(TXT_DEVICE_NAME)
        .map(str::to_string)
        .unwrap_or_else(|| fallback_name(info.get_fullname()));

    Some(Peer::new(name, host, info.get_port(), device_type))
}

/// The instance label with the service type suffix removed.
fn fallback_name(fullname: &str) -> String {
    fullname
        .strip_suffix(SERVICE_TYPE)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

/// A DNS-safe instance label: the device name with unsafe characters
/// replaced, plus a short random suffix so two devices with the same name
/// do not collide.
pub fn instance_name(device_name: &str) -> String {
    let mut label: String = device_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    label.truncate(40);
    let label = label.trim_matches('-');
    let label = if label.is_empty() { "decklink" } else { label };
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{label}-{}", &suffix[..8])
}

// ── Tests ─────────────────────────────────────────────────────────────────────
