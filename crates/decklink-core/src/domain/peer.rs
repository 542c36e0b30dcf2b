//! Remote endpoints that can be paired with.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The kind of machine a peer runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Laptop,
    Deck,
}

impl DeviceType {
    /// Wire / TXT-record representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Laptop => "laptop",
            DeviceType::Deck => "deck",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not a known [`DeviceType`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown device type: {0:?}")]
pub struct UnknownDeviceType(pub String);

impl FromStr for DeviceType {
    type Err = UnknownDeviceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "laptop" => Ok(DeviceType::Laptop),
            "deck" => Ok(DeviceType::Deck),
            _ => Err(UnknownDeviceType(s.to_string())),
        }
    }
}

/// A discoverable or manually addressed remote endpoint.
///
/// Two peers are equal when they share `(host, port)`; the display name and
/// device type are descriptive only.  This is what lets discovery collapse
/// repeated advertisements of one endpoint into a single entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub device_type: DeviceType,
}

impl Peer {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        device_type: DeviceType,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            device_type,
        }
    }

    /// The identity key used for equality and deduplication.
    pub fn endpoint(&self) -> (&str, u16) {
        (&self.host, self.port)
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint() == other.endpoint()
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_peers_with_same_endpoint_are_equal_regardless_of_name() {
        // Arrange
        let a = Peer::new("Steam Deck", "192.168.1.20", 52525, DeviceType::Deck);
        let b = Peer::new("renamed", "192.168.1.20", 52525, DeviceType::Laptop);

        // Assert
        assert_eq!(a, b);
    }

    #[test]
    fn test_peers_with_different_ports_are_not_equal() {
        let a = Peer::new("deck", "192.168.1.20", 52525, DeviceType::Deck);
        let b = Peer::new("deck", "192.168.1.20", 52526, DeviceType::Deck);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_set_collapses_duplicate_endpoints() {
        let mut set = HashSet::new();
        set.insert(Peer::new("one", "10.0.0.2", 52525, DeviceType::Deck));
        set.insert(Peer::new("two", "10.0.0.2", 52525, DeviceType::Deck));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_device_type_parses_case_insensitively() {
        assert_eq!("Deck".parse::<DeviceType>(), Ok(DeviceType::Deck));
        assert_eq!(" laptop ".parse::<DeviceType>(), Ok(DeviceType::Laptop));
        assert!("phone".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_device_type_serializes_lowercase() {
        let json = serde_json::to_string(&DeviceType::Laptop).unwrap();
        assert_eq!(json, "\"laptop\"");
    }
}
