//! Network nodes
//!
//! A node owns its interfaces (exclusively, for their lifetime), an ordered
//! list of roles (the first role is the primary one), and a set of services
//! keyed by a node-local id. The concrete backend is chosen by [`NodeKind`]
//! once, at registration time.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::entity::{prefix_id, EntityKind};
use super::service::NodeService;

/// Volume mount for Docker-backed nodes.
#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
}

/// Backend-specific configuration for Docker-backed nodes.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub image: String,
    pub tag: String,
    /// Command the container boots with; must keep the container alive.
    pub boot_command: Vec<String>,
    pub capabilities: Vec<String>,
    pub volumes: Vec<VolumeMount>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            tag: "latest".to_string(),
            boot_command: vec!["sleep".to_string(), "infinity".to_string()],
            capabilities: vec![
                "NET_BIND_SERVICE".to_string(),
                "NET_RAW".to_string(),
                "SYS_ADMIN".to_string(),
            ],
            volumes: Vec::new(),
        }
    }
}

impl DockerConfig {
    pub fn full_image(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

/// Backend-specific configuration for OVS switches.
#[derive(Debug, Clone)]
pub struct SwitchConfig {
    pub rstp: bool,
    pub stp: bool,
    pub fail_mode: String,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            rstp: false,
            stp: false,
            fail_mode: "standalone".to_string(),
        }
    }
}

/// Shared folder exported into a VM via virtiofs.
#[derive(Debug, Clone)]
pub struct SharedFolder {
    pub host_folder: PathBuf,
    pub target_folder: String,
}

/// Backend-specific configuration for libvirt-backed nodes.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub domain_name: String,
    /// Template domain XML; only used when cloning.
    pub template_xml: PathBuf,
    pub disk_file: PathBuf,
    pub image_dir: PathBuf,
    pub clone_template: bool,
    pub shared_folder: Option<SharedFolder>,
    pub boot_timeout: Duration,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            domain_name: String::new(),
            template_xml: PathBuf::new(),
            disk_file: PathBuf::new(),
            image_dir: PathBuf::from("/tmp"),
            clone_template: true,
            shared_folder: None,
            boot_timeout: Duration::from_secs(30),
        }
    }
}

/// Concrete node backend, fixed at registration time.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Host,
    Router,
    Nat,
    Docker(DockerConfig),
    Switch(SwitchConfig),
    VirtualMachine(VmConfig),
}

impl NodeKind {
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            NodeKind::Host | NodeKind::Docker(_) => EntityKind::Host,
            NodeKind::Router => EntityKind::Router,
            NodeKind::Nat => EntityKind::Nat,
            NodeKind::Switch(_) => EntityKind::Switch,
            NodeKind::VirtualMachine(_) => EntityKind::VirtualMachine,
        }
    }

    fn default_role(&self) -> &'static str {
        match self {
            NodeKind::Host | NodeKind::Docker(_) => "host",
            NodeKind::Router => "router",
            NodeKind::Nat => "nat",
            NodeKind::Switch(_) => "switch",
            NodeKind::VirtualMachine(_) => "vm-host",
        }
    }
}

/// Free-form node settings interpreted by the concrete backend.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub dns_host_name: Option<String>,
    pub default_route: Option<Ipv4Addr>,
    /// Typed passthrough for genuinely backend-specific knobs.
    pub extra: BTreeMap<String, String>,
}

/// A logical network node bound to one backend for its lifetime.
pub struct NetworkNode {
    entity_id: String,
    display_name: String,
    kind: NodeKind,
    config: NodeConfig,
    roles: Mutex<Vec<String>>,
    interface_ids: Mutex<Vec<String>>,
    services: Mutex<BTreeMap<u32, Arc<dyn NodeService>>>,
    next_service_id: Mutex<u32>,
    started: AtomicBool,
}

impl NetworkNode {
    pub fn new(raw_id: &str, kind: NodeKind) -> Self {
        Self::with_config(raw_id, kind, NodeConfig::default())
    }

    pub fn with_config(raw_id: &str, kind: NodeKind, config: NodeConfig) -> Self {
        let entity_id = prefix_id(kind.entity_kind(), raw_id);
        let roles = vec![kind.default_role().to_string()];
        Self {
            display_name: entity_id.clone(),
            entity_id,
            kind,
            config,
            roles: Mutex::new(roles),
            interface_ids: Mutex::new(Vec::new()),
            services: Mutex::new(BTreeMap::new()),
            next_service_id: Mutex::new(0),
            started: AtomicBool::new(false),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Name used for OS-level constructs (bridge names, container suffixes).
    pub fn system_id(&self) -> &str {
        &self.entity_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn set_display_name(&mut self, name: impl Into<String>) {
        self.display_name = name.into();
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn is_switch(&self) -> bool {
        matches!(self.kind, NodeKind::Switch(_))
    }

    // Roles

    pub fn roles(&self) -> Vec<String> {
        self.roles.lock().clone()
    }

    /// The first role, used for default naming and behavior.
    pub fn primary_role(&self) -> Option<String> {
        self.roles.lock().first().cloned()
    }

    pub fn add_role(&self, role: impl Into<String>) {
        self.roles.lock().push(role.into());
    }

    pub fn delete_role(&self, role: &str) {
        self.roles.lock().retain(|r| r != role);
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.lock().iter().any(|r| r == role)
    }

    // Interface ownership bookkeeping (the interfaces themselves live in the
    // emulator registry)

    pub fn interface_ids(&self) -> Vec<String> {
        self.interface_ids.lock().clone()
    }

    pub(crate) fn attach_interface_id(&self, interface_id: &str) {
        let mut ids = self.interface_ids.lock();
        if !ids.iter().any(|id| id == interface_id) {
            ids.push(interface_id.to_string());
        }
    }

    pub(crate) fn detach_interface_id(&self, interface_id: &str) {
        self.interface_ids.lock().retain(|id| id != interface_id);
    }

    /// First unused `<prefix><N>` device name among this node's interfaces.
    pub fn free_interface_name(&self, prefix: &str, used: &[String]) -> String {
        let mut index = 0;
        loop {
            let candidate = format!("{prefix}{index}");
            if !used.contains(&candidate) {
                return candidate;
            }
            index += 1;
        }
    }

    // Services

    pub fn add_service(&self, service: Arc<dyn NodeService>) -> u32 {
        let mut next = self.next_service_id.lock();
        let id = *next;
        *next += 1;
        self.services.lock().insert(id, service);
        id
    }

    pub fn services(&self) -> BTreeMap<u32, Arc<dyn NodeService>> {
        self.services.lock().clone()
    }

    pub fn has_services(&self) -> bool {
        !self.services.lock().is_empty()
    }

    // Lifecycle flag

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }
}

impl PartialEq for NetworkNode {
    fn eq(&self, other: &Self) -> bool {
        self.entity_id == other.entity_id
    }
}

impl std::fmt::Debug for NetworkNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkNode")
            .field("entity_id", &self.entity_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_node_ids_get_prefixed() {
        assert_eq!(NetworkNode::new("1", NodeKind::Host).entity_id(), "h1");
        assert_eq!(
            NetworkNode::new("1", NodeKind::Switch(SwitchConfig::default())).entity_id(),
            "s1"
        );
        assert_eq!(NetworkNode::new("core", NodeKind::Router).entity_id(), "core");
    }

    #[test]
    fn primary_role_comes_first() {
        let node = NetworkNode::new("h1", NodeKind::Host);
        node.add_role("dns");
        assert_eq!(node.primary_role().as_deref(), Some("host"));
        assert!(node.has_role("dns"));
        node.delete_role("dns");
        assert!(!node.has_role("dns"));
    }

    #[test]
    fn free_interface_name_skips_used() {
        let node = NetworkNode::new("h1", NodeKind::Host);
        let used = vec!["eth0".to_string(), "eth1".to_string()];
        assert_eq!(node.free_interface_name("eth", &used), "eth2");
        assert_eq!(node.free_interface_name("tap", &used), "tap0");
    }
}
