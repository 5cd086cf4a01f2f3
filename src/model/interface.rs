//! Network interfaces
//!
//! An interface belongs to exactly one node for its lifetime and may be
//! associated with at most one link. The link holds the authoritative
//! references; the interface's link id is a non-owning back-reference used
//! only for lookup.

use parking_lot::Mutex;
use std::net::Ipv4Addr;

use super::entity::{prefix_id, EntityKind};

/// Device creation strategy for an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceKind {
    /// Software device; one end of a veth pair when linked, a dummy device
    /// when standalone.
    Virtual,
    /// Pre-existing host device adopted into the node's namespace.
    Physical { host_device: String },
    /// Tap port; created by the owning switch wrapper, not by the interface.
    Tap,
    /// Standalone mirror port on a switch, receiving a copy of all traffic.
    Mirror,
}

/// IPv4 address with prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpAddress {
    pub address: Ipv4Addr,
    pub prefix_length: u8,
}

impl std::fmt::Display for IpAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_length)
    }
}

pub struct NetworkInterface {
    entity_id: String,
    node_id: String,
    interface_name: String,
    kind: InterfaceKind,
    is_management: bool,
    ip: Mutex<Option<IpAddress>>,
    mac: Mutex<Option<String>>,
    link_id: Mutex<Option<String>>,
}

impl NetworkInterface {
    pub fn new(raw_id: &str, node_id: &str, kind: InterfaceKind) -> Self {
        let entity_id = prefix_id(EntityKind::Interface, raw_id);
        // Device names must be unique per host since veth ends are created
        // in the main namespace first; scope them by node.
        let interface_name = match &kind {
            InterfaceKind::Physical { host_device } => host_device.clone(),
            _ => format!("{node_id}-{entity_id}"),
        };
        Self {
            entity_id,
            node_id: node_id.to_string(),
            interface_name,
            kind,
            is_management: false,
            ip: Mutex::new(None),
            mac: Mutex::new(None),
            link_id: Mutex::new(None),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Device name inside the owning node's namespace.
    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn kind(&self) -> &InterfaceKind {
        &self.kind
    }

    pub fn is_physical(&self) -> bool {
        matches!(self.kind, InterfaceKind::Physical { .. })
    }

    pub fn is_tap(&self) -> bool {
        matches!(self.kind, InterfaceKind::Tap)
    }

    pub fn is_mirror(&self) -> bool {
        matches!(self.kind, InterfaceKind::Mirror)
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, InterfaceKind::Virtual | InterfaceKind::Mirror)
    }

    pub fn is_management(&self) -> bool {
        self.is_management
    }

    pub fn set_management(&mut self, management: bool) {
        self.is_management = management;
    }

    pub fn ip_address(&self) -> Option<IpAddress> {
        *self.ip.lock()
    }

    pub fn set_ip_address(&self, ip: Option<IpAddress>) {
        *self.ip.lock() = ip;
    }

    pub fn mac_address(&self) -> Option<String> {
        self.mac.lock().clone()
    }

    pub fn set_mac_address(&self, mac: Option<String>) {
        *self.mac.lock() = mac;
    }

    /// Id of the associated link, if any (non-owning back-reference).
    pub fn link_id(&self) -> Option<String> {
        self.link_id.lock().clone()
    }

    pub(crate) fn set_link_id(&self, link_id: Option<String>) {
        *self.link_id.lock() = link_id;
    }

    pub fn is_linked(&self) -> bool {
        self.link_id.lock().is_some()
    }
}

impl PartialEq for NetworkInterface {
    fn eq(&self, other: &Self) -> bool {
        self.entity_id == other.entity_id
    }
}

impl std::fmt::Debug for NetworkInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkInterface")
            .field("entity_id", &self.entity_id)
            .field("node_id", &self.node_id)
            .field("name", &self.interface_name)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_names_are_node_scoped() {
        let iface = NetworkInterface::new("0", "h1", InterfaceKind::Virtual);
        assert_eq!(iface.entity_id(), "i0");
        assert_eq!(iface.interface_name(), "h1-i0");
    }

    #[test]
    fn physical_interfaces_keep_host_device_name() {
        let iface = NetworkInterface::new(
            "up",
            "r1",
            InterfaceKind::Physical {
                host_device: "enp3s0".to_string(),
            },
        );
        assert_eq!(iface.interface_name(), "enp3s0");
        assert!(iface.is_physical());
        assert!(!iface.is_virtual());
    }

    #[test]
    fn ip_parsing_and_display() {
        let ip = IpAddress {
            address: "10.0.0.1".parse().unwrap(),
            prefix_length: 24,
        };
        assert_eq!(ip.to_string(), "10.0.0.1/24");
    }
}
