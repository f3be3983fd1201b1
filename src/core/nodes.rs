//! Node identities and the per-node directory.
//!
//! Every node on the LAN has a name from a closed set: the Frontdesk, the
//! Master, and CubeBox1 through CubeBox12, plus the `everyone` broadcast
//! pseudo-name. A node learns its peers' addresses from observed traffic
//! and keeps them in a [`NodesList`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::time::Timestamp;
use crate::CUBEBOX_COUNT;

/// Identity of a node on the shared bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeName {
    /// The operator-facing registration node.
    Frontdesk,
    /// The authoritative coordinator.
    Master,
    /// A puzzle controller, id in 1..=12.
    CubeBox(u8),
    /// Broadcast pseudo-target accepted by every node.
    Everyone,
}

impl NodeName {
    /// Parse a node name, accepting exactly the closed set.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Frontdesk" => Some(Self::Frontdesk),
            "Master" => Some(Self::Master),
            "everyone" => Some(Self::Everyone),
            _ => {
                let id: u8 = name.strip_prefix("CubeBox")?.parse().ok()?;
                if (1..=CUBEBOX_COUNT).contains(&id) {
                    Some(Self::CubeBox(id))
                } else {
                    None
                }
            }
        }
    }

    /// The cube id if this is a cubebox name.
    pub fn cubebox_id(&self) -> Option<u8> {
        match self {
            Self::CubeBox(id) => Some(*id),
            _ => None,
        }
    }

    /// Whether this name is a cubebox.
    pub fn is_cubebox(&self) -> bool {
        matches!(self, Self::CubeBox(_))
    }

    /// Whether a message addressed to `target` concerns this node.
    pub fn accepts(&self, target: NodeName) -> bool {
        target == Self::Everyone || target == *self
    }

    /// Derive a cubebox name from the digits in a hostname
    /// (`cubebox3` → `CubeBox3`).
    pub fn from_hostname_digits(hostname: &str) -> Option<Self> {
        let digits: String = hostname.chars().filter(|c| c.is_ascii_digit()).collect();
        let id: u8 = digits.parse().ok()?;
        if (1..=CUBEBOX_COUNT).contains(&id) {
            Some(Self::CubeBox(id))
        } else {
            None
        }
    }

    /// All addressable node names (no `everyone`).
    pub fn all_real() -> impl Iterator<Item = NodeName> {
        [Self::Frontdesk, Self::Master]
            .into_iter()
            .chain((1..=CUBEBOX_COUNT).map(Self::CubeBox))
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frontdesk => write!(f, "Frontdesk"),
            Self::Master => write!(f, "Master"),
            Self::CubeBox(id) => write!(f, "CubeBox{}", id),
            Self::Everyone => write!(f, "everyone"),
        }
    }
}

impl FromStr for NodeName {
    type Err = InvalidNodeName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| InvalidNodeName(s.to_string()))
    }
}

/// A name outside the closed node-name set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid node name: {0:?}")]
pub struct InvalidNodeName(pub String);

impl Serialize for NodeName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// What a node knows about one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Peer name.
    pub name: NodeName,
    /// Last IP the peer was seen sending from.
    pub ip: String,
    /// Source port of the peer's last datagram (the shared well-known
    /// port in production).
    pub port: u16,
    /// When the last valid message from the peer arrived.
    pub last_seen: Timestamp,
}

/// Directory of peers, derived from observed traffic.
///
/// Owned by one node; only that node's inbound-message handler mutates it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodesList {
    nodes: BTreeMap<NodeName, NodeInfo>,
}

impl NodesList {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or refresh) a peer from an observed datagram.
    pub fn record(&mut self, name: NodeName, ip: &str, port: u16, seen_at: Timestamp) {
        self.nodes
            .entry(name)
            .and_modify(|info| {
                info.ip = ip.to_string();
                info.port = port;
                info.last_seen = seen_at;
            })
            .or_insert_with(|| NodeInfo {
                name,
                ip: ip.to_string(),
                port,
                last_seen: seen_at,
            });
    }

    /// Look up a peer's last known IP.
    pub fn ip_of(&self, name: NodeName) -> Option<&str> {
        self.nodes.get(&name).map(|info| info.ip.as_str())
    }

    /// Look up a peer's full entry.
    pub fn get(&self, name: NodeName) -> Option<&NodeInfo> {
        self.nodes.get(&name)
    }

    /// Last time a peer was heard from.
    pub fn last_seen(&self, name: NodeName) -> Option<Timestamp> {
        self.nodes.get(&name).map(|info| info.last_seen)
    }

    /// All known peers, name-ordered.
    pub fn iter(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no peer has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_closed_set() {
        assert_eq!(NodeName::parse("Frontdesk"), Some(NodeName::Frontdesk));
        assert_eq!(NodeName::parse("Master"), Some(NodeName::Master));
        assert_eq!(NodeName::parse("everyone"), Some(NodeName::Everyone));
        assert_eq!(NodeName::parse("CubeBox1"), Some(NodeName::CubeBox(1)));
        assert_eq!(NodeName::parse("CubeBox12"), Some(NodeName::CubeBox(12)));
    }

    #[test]
    fn test_parse_rejects_everything_else() {
        for bad in ["CubeBox0", "CubeBox13", "cubebox1", "master", "Everyone", "", "CubeBox"] {
            assert_eq!(NodeName::parse(bad), None, "{bad:?} should be invalid");
        }
    }

    #[test]
    fn test_display_roundtrip() {
        for name in NodeName::all_real().chain([NodeName::Everyone]) {
            assert_eq!(NodeName::parse(&name.to_string()), Some(name));
        }
    }

    #[test]
    fn test_accepts_targets() {
        let me = NodeName::CubeBox(3);
        assert!(me.accepts(NodeName::CubeBox(3)));
        assert!(me.accepts(NodeName::Everyone));
        assert!(!me.accepts(NodeName::CubeBox(4)));
        assert!(!me.accepts(NodeName::Master));
    }

    #[test]
    fn test_hostname_digits() {
        assert_eq!(NodeName::from_hostname_digits("cubebox7"), Some(NodeName::CubeBox(7)));
        assert_eq!(NodeName::from_hostname_digits("box12"), Some(NodeName::CubeBox(12)));
        assert_eq!(NodeName::from_hostname_digits("cubebox100"), None);
        assert_eq!(NodeName::from_hostname_digits("cubebox"), None);
    }

    #[test]
    fn test_nodes_list_record_and_refresh() {
        let mut list = NodesList::new();
        list.record(NodeName::CubeBox(2), "192.168.1.42", 5005, 100.0);
        assert_eq!(list.ip_of(NodeName::CubeBox(2)), Some("192.168.1.42"));
        assert_eq!(list.last_seen(NodeName::CubeBox(2)), Some(100.0));

        list.record(NodeName::CubeBox(2), "192.168.1.99", 5005, 250.0);
        assert_eq!(list.ip_of(NodeName::CubeBox(2)), Some("192.168.1.99"));
        assert_eq!(list.last_seen(NodeName::CubeBox(2)), Some(250.0));
        assert_eq!(list.get(NodeName::CubeBox(2)).unwrap().port, 5005);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_serde_node_name() {
        let json = serde_json::to_string(&NodeName::CubeBox(5)).unwrap();
        assert_eq!(json, "\"CubeBox5\"");
        let back: NodeName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, NodeName::CubeBox(5));
        assert!(serde_json::from_str::<NodeName>("\"CubeBox99\"").is_err());
    }
}
