//! Emulation engine
//!
//! [`NetworkEmulator`] owns the entity registry and the entity-to-wrapper
//! binding, and sequences every state transition. Startup is strictly
//! sequential because the phase order is load-bearing: nodes first (their
//! namespaces must exist), then interfaces, then links (a veth pair needs
//! both interfaces registered and absent). Teardown is parallel per entity:
//! namespace teardown is I/O-bound and independent, so interface wrappers
//! are cleaned concurrently, then node wrappers, with OVS commands batched
//! per phase. The main namespace is released last.
//!
//! The emulator is used through an `Arc`; link-model subscriptions hold a
//! `Weak` back-reference so a dropped engine silences them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::model::interface::NetworkInterface;
use crate::model::link::NetworkLink;
use crate::model::node::{NetworkNode, NodeKind};
use crate::model::service::NodeService;
use crate::namespace::Namespace;
use crate::notify::{ChangeDebouncer, TopologyChange, DEFAULT_DEBOUNCE_WINDOW};
use crate::tuning;
use crate::wrapper::docker::DockerWrapper;
use crate::wrapper::native::NativeWrapper;
use crate::wrapper::ovs::{OvsBatch, OvsWrapper};
use crate::wrapper::vm::VirtualMachineWrapper;
use crate::wrapper::{EntityWrapper, InterfaceWrapper, LinkWrapper, NodeWrapper};
use crate::EmulatorError;

#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Prefix for all namespace names owned by this engine.
    pub namespace_prefix: String,
    /// Quiet window for topology-change notifications.
    pub debounce_window: Duration,
    /// Whether link models are pushed to devices via tc.
    pub link_properties_enabled: bool,
    /// Shared bound for stopping all services on shutdown.
    pub service_stop_wait: Duration,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            namespace_prefix: "w".to_string(),
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            link_properties_enabled: true,
            service_stop_wait: Duration::from_secs(20),
        }
    }
}

pub struct NetworkEmulator {
    config: EmulatorConfig,
    main_namespace: Namespace,
    nodes: RwLock<Vec<Arc<NetworkNode>>>,
    interfaces: RwLock<Vec<Arc<NetworkInterface>>>,
    links: RwLock<Vec<Arc<NetworkLink>>>,
    wrappers: RwLock<HashMap<String, Arc<EntityWrapper>>>,
    running: AtomicBool,
    /// Handle of the runtime that started the engine; model-change
    /// subscriptions fire on arbitrary caller threads and spawn through it.
    runtime: RwLock<Option<tokio::runtime::Handle>>,
    debouncer: ChangeDebouncer,
}

impl NetworkEmulator {
    /// Engine with default configuration and a log-only notification sink.
    pub fn new() -> Arc<Self> {
        Self::with_config(EmulatorConfig::default(), |change| {
            info!(entity = %change.entity_id, change = %change.change, "topology changed");
        })
    }

    pub fn with_config(
        config: EmulatorConfig,
        sink: impl Fn(TopologyChange) + Send + Sync + 'static,
    ) -> Arc<Self> {
        let main_namespace = Namespace::new(format!("{}_main", config.namespace_prefix));
        let debouncer = ChangeDebouncer::new(config.debounce_window, sink);
        Arc::new(Self {
            config,
            main_namespace,
            nodes: RwLock::new(Vec::new()),
            interfaces: RwLock::new(Vec::new()),
            links: RwLock::new(Vec::new()),
            wrappers: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            runtime: RwLock::new(None),
            debouncer,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn main_namespace(&self) -> &Namespace {
        &self.main_namespace
    }

    // Registration

    fn has_entity(&self, entity_id: &str) -> bool {
        self.wrappers.read().contains_key(entity_id)
    }

    /// Register a node and bind it to the wrapper matching its kind.
    /// When the engine is already running, the node is materialized
    /// immediately (hot-add).
    pub async fn add_node(
        self: &Arc<Self>,
        node: NetworkNode,
    ) -> Result<Arc<NetworkNode>, EmulatorError> {
        if self.has_entity(node.entity_id()) {
            return Err(EmulatorError::Config(format!(
                "duplicate entity id {}",
                node.entity_id()
            )));
        }
        let node = Arc::new(node);
        let prefix = &self.config.namespace_prefix;
        let wrapper = match node.kind() {
            NodeKind::Host | NodeKind::Router | NodeKind::Nat => {
                NodeWrapper::Native(NativeWrapper::new(node.clone(), prefix))
            }
            NodeKind::Docker(config) => {
                NodeWrapper::Docker(DockerWrapper::new(node.clone(), config.clone(), prefix))
            }
            NodeKind::Switch(config) => {
                NodeWrapper::Ovs(OvsWrapper::new(node.clone(), config.clone()))
            }
            NodeKind::VirtualMachine(config) => NodeWrapper::VirtualMachine(
                VirtualMachineWrapper::new(node.clone(), config.clone(), prefix),
            ),
        };
        let wrapper = Arc::new(EntityWrapper::Node(wrapper));
        self.wrappers
            .write()
            .insert(node.entity_id().to_string(), wrapper.clone());
        self.nodes.write().push(node.clone());

        if self.is_running() {
            if !wrapper.create(self).await {
                return Err(EmulatorError::Startup(format!(
                    "could not create node {}",
                    node.entity_id()
                )));
            }
            node.mark_started(true);
            if let Some(node_wrapper) = wrapper.as_node() {
                node_wrapper.start(self).await;
            }
            self.on_topology_change(node.entity_id(), "node_added");
        }
        Ok(node)
    }

    /// Register an interface under an already registered node.
    pub async fn add_interface(
        self: &Arc<Self>,
        node_id: &str,
        interface: NetworkInterface,
    ) -> Result<Arc<NetworkInterface>, EmulatorError> {
        let node = self.node(node_id)?;
        if self.has_entity(interface.entity_id()) {
            return Err(EmulatorError::Config(format!(
                "duplicate entity id {}",
                interface.entity_id()
            )));
        }
        let interface = Arc::new(interface);
        node.attach_interface_id(interface.entity_id());
        let wrapper = Arc::new(EntityWrapper::Interface(InterfaceWrapper::new(
            interface.clone(),
        )));
        self.wrappers
            .write()
            .insert(interface.entity_id().to_string(), wrapper.clone());
        self.interfaces.write().push(interface.clone());

        if self.is_running() {
            if !wrapper.create(self).await {
                return Err(EmulatorError::Startup(format!(
                    "could not create interface {}",
                    interface.entity_id()
                )));
            }
            self.on_topology_change(interface.entity_id(), "interface_added");
        }
        Ok(interface)
    }

    /// Register a link. Both endpoint interfaces must already be registered.
    pub async fn add_link(
        self: &Arc<Self>,
        link: NetworkLink,
    ) -> Result<Arc<NetworkLink>, EmulatorError> {
        if self.has_entity(link.entity_id()) {
            return Err(EmulatorError::Config(format!(
                "duplicate entity id {}",
                link.entity_id()
            )));
        }
        let interface_a = self.interface(link.interface_a())?;
        let interface_b = self.interface(link.interface_b())?;

        let link = Arc::new(link);
        interface_a.set_link_id(Some(link.entity_id().to_string()));
        interface_b.set_link_id(Some(link.entity_id().to_string()));
        let wrapper = Arc::new(EntityWrapper::Link(LinkWrapper::new(
            link.clone(),
            self.config.link_properties_enabled,
        )));
        self.wrappers
            .write()
            .insert(link.entity_id().to_string(), wrapper.clone());
        self.links.write().push(link.clone());

        // Model changes re-shape both endpoints and count as topology
        // changes. The subscription must not keep the engine alive.
        let weak: Weak<Self> = Arc::downgrade(self);
        let link_id = link.entity_id().to_string();
        link.model().on_change(move |property, _value| {
            let Some(emulator) = weak.upgrade() else {
                return;
            };
            if !emulator.is_running() {
                return;
            }
            emulator.on_topology_change(&link_id, &format!("link_property:{property}"));
            // The setter may be called from a thread without a runtime (an
            // external topology loader); spawn through the handle captured
            // at start instead of the caller's context.
            let Some(runtime) = emulator.runtime.read().clone() else {
                warn!(link = %link_id, "engine runtime unavailable, not reapplying link properties");
                return;
            };
            let link_id = link_id.clone();
            runtime.spawn(async move {
                let Some(wrapper) = emulator.find_wrapper(&link_id) else {
                    return;
                };
                if let Some(link_wrapper) = wrapper.as_link() {
                    if !link_wrapper.apply_link_properties(&emulator).await {
                        warn!(link = %link_id, "could not apply updated link properties");
                    }
                }
            });
        });

        if self.is_running() {
            if !wrapper.create(self).await {
                return Err(EmulatorError::Startup(format!(
                    "could not create link {}",
                    link.entity_id()
                )));
            }
            if let Some(link_wrapper) = wrapper.as_link() {
                link_wrapper.apply_link_properties(self).await;
            }
            self.on_topology_change(link.entity_id(), "link_added");
        }
        Ok(link)
    }

    // Removal

    /// Tear down and unregister a link. Endpoint interfaces stay registered.
    pub async fn remove_link(self: &Arc<Self>, link_id: &str) -> Result<(), EmulatorError> {
        let link = self.link(link_id)?;
        let wrapper = self.wrapper(link_id)?;
        if self.is_running() {
            wrapper.clean(self, None).await;
        }
        for interface_id in [link.interface_a(), link.interface_b()] {
            if let Some(interface) = self.find_interface(interface_id) {
                interface.set_link_id(None);
            }
        }
        self.links.write().retain(|l| l.entity_id() != link_id);
        self.wrappers.write().remove(link_id);
        self.on_topology_change(link_id, "link_removed");
        Ok(())
    }

    /// Tear down and unregister an interface. An associated link is removed
    /// first; a veth end cannot outlive its pair.
    pub async fn remove_interface(
        self: &Arc<Self>,
        interface_id: &str,
    ) -> Result<(), EmulatorError> {
        let interface = self.interface(interface_id)?;
        if let Some(link_id) = interface.link_id() {
            self.remove_link(&link_id).await?;
        }
        let wrapper = self.wrapper(interface_id)?;
        if self.is_running() {
            wrapper.clean(self, None).await;
        }
        if let Some(node) = self.find_node(interface.node_id()) {
            node.detach_interface_id(interface_id);
        }
        self.interfaces
            .write()
            .retain(|i| i.entity_id() != interface_id);
        self.wrappers.write().remove(interface_id);
        self.on_topology_change(interface_id, "interface_removed");
        Ok(())
    }

    /// Tear down and unregister a node together with all its interfaces.
    pub async fn remove_node(self: &Arc<Self>, node_id: &str) -> Result<(), EmulatorError> {
        let node = self.node(node_id)?;
        for interface_id in node.interface_ids() {
            self.remove_interface(&interface_id).await?;
        }
        let wrapper = self.wrapper(node_id)?;
        if self.is_running() {
            wrapper.clean(self, None).await;
        }
        node.mark_started(false);
        self.nodes.write().retain(|n| n.entity_id() != node_id);
        self.wrappers.write().remove(node_id);
        self.on_topology_change(node_id, "node_removed");
        Ok(())
    }

    // Lookup

    pub fn find_node(&self, entity_id: &str) -> Option<Arc<NetworkNode>> {
        self.nodes
            .read()
            .iter()
            .find(|n| n.entity_id() == entity_id)
            .cloned()
    }

    pub fn node(&self, entity_id: &str) -> Result<Arc<NetworkNode>, EmulatorError> {
        self.find_node(entity_id)
            .ok_or_else(|| EmulatorError::NotFound(entity_id.to_string()))
    }

    pub fn find_interface(&self, entity_id: &str) -> Option<Arc<NetworkInterface>> {
        self.interfaces
            .read()
            .iter()
            .find(|i| i.entity_id() == entity_id)
            .cloned()
    }

    pub fn interface(&self, entity_id: &str) -> Result<Arc<NetworkInterface>, EmulatorError> {
        self.find_interface(entity_id)
            .ok_or_else(|| EmulatorError::NotFound(entity_id.to_string()))
    }

    pub fn find_link(&self, entity_id: &str) -> Option<Arc<NetworkLink>> {
        self.links
            .read()
            .iter()
            .find(|l| l.entity_id() == entity_id)
            .cloned()
    }

    pub fn link(&self, entity_id: &str) -> Result<Arc<NetworkLink>, EmulatorError> {
        self.find_link(entity_id)
            .ok_or_else(|| EmulatorError::NotFound(entity_id.to_string()))
    }

    pub fn find_wrapper(&self, entity_id: &str) -> Option<Arc<EntityWrapper>> {
        self.wrappers.read().get(entity_id).cloned()
    }

    pub fn wrapper(&self, entity_id: &str) -> Result<Arc<EntityWrapper>, EmulatorError> {
        self.find_wrapper(entity_id)
            .ok_or_else(|| EmulatorError::NotFound(format!("no wrapper for {entity_id}")))
    }

    /// Primary namespace of an entity.
    pub async fn namespace_of(&self, entity_id: &str) -> Result<Namespace, EmulatorError> {
        self.wrapper(entity_id)?.namespace(self).await
    }

    /// Host-side control namespace of an entity.
    pub async fn additional_namespace_of(
        &self,
        entity_id: &str,
    ) -> Result<Namespace, EmulatorError> {
        self.wrapper(entity_id)?.additional_namespace(self).await
    }

    // Lifecycle

    /// Materialize the whole declared topology. Aborts on the first failed
    /// wrapper creation; partial startup is not recovered, the caller
    /// retries after remediation.
    pub async fn start(self: &Arc<Self>) -> Result<(), EmulatorError> {
        if !self.main_namespace.exists().await
            && !self.main_namespace.from_pid(std::process::id()).await
        {
            return Err(EmulatorError::Namespace(
                "could not adopt the main namespace".to_string(),
            ));
        }
        tuning::adjust_host_limits(&self.main_namespace).await;

        info!("creating nodes");
        for node in self.nodes.read().clone() {
            let wrapper = self.wrapper(node.entity_id())?;
            if !wrapper.create(self).await {
                return Err(EmulatorError::Startup(format!(
                    "could not create node {}",
                    node.entity_id()
                )));
            }
            node.mark_started(true);
        }
        info!("creating interfaces");
        for interface in self.interfaces.read().clone() {
            let wrapper = self.wrapper(interface.entity_id())?;
            if !wrapper.create(self).await {
                return Err(EmulatorError::Startup(format!(
                    "could not create interface {}",
                    interface.entity_id()
                )));
            }
        }
        info!("creating links");
        for link in self.links.read().clone() {
            let wrapper = self.wrapper(link.entity_id())?;
            if !wrapper.create(self).await {
                return Err(EmulatorError::Startup(format!(
                    "could not create link {}",
                    link.entity_id()
                )));
            }
        }

        *self.runtime.write() = Some(tokio::runtime::Handle::current());
        self.running.store(true, Ordering::SeqCst);

        info!("starting entities");
        for node in self.nodes.read().clone() {
            let wrapper = self.wrapper(node.entity_id())?;
            if let Some(node_wrapper) = wrapper.as_node() {
                if !node_wrapper.start(self).await {
                    warn!(node = %node.entity_id(), "entity bring-up reported failure");
                }
            }
        }
        for link in self.links.read().clone() {
            let wrapper = self.wrapper(link.entity_id())?;
            if let Some(link_wrapper) = wrapper.as_link() {
                if !link_wrapper.apply_link_properties(self).await {
                    warn!(link = %link.entity_id(), "could not apply link properties");
                }
            }
        }
        info!("emulation running");
        Ok(())
    }

    /// Tear everything down. Per-entity failures are logged and never stop
    /// the teardown of the remaining entities; the main namespace is
    /// released last.
    pub async fn stop(self: &Arc<Self>) {
        self.running.store(false, Ordering::SeqCst);

        let stragglers = self.stop_services().await;
        if !stragglers.is_empty() {
            warn!("{} service(s) could not be stopped: {}", stragglers.len(), stragglers.join(", "));
        }

        info!("cleaning up interfaces");
        let batch = OvsBatch::new();
        let interfaces = self.interfaces.read().clone();
        let cleanups = interfaces
            .iter()
            .filter_map(|interface| self.find_wrapper(interface.entity_id()))
            .collect::<Vec<_>>();
        join_all(
            cleanups
                .iter()
                .map(|wrapper| wrapper.clean(self, Some(&batch))),
        )
        .await;
        batch.flush(&self.main_namespace).await;

        info!("cleaning up nodes");
        let batch = OvsBatch::new();
        let nodes = self.nodes.read().clone();
        let cleanups = nodes
            .iter()
            .filter_map(|node| self.find_wrapper(node.entity_id()))
            .collect::<Vec<_>>();
        join_all(
            cleanups
                .iter()
                .map(|wrapper| wrapper.clean(self, Some(&batch))),
        )
        .await;
        batch.flush(&self.main_namespace).await;

        for node in nodes {
            node.mark_started(false);
        }
        self.main_namespace.clean().await;
        info!("emulation stopped");
    }

    // Services

    fn all_services(&self) -> Vec<(String, Arc<dyn NodeService>)> {
        let mut services = Vec::new();
        for node in self.nodes.read().iter() {
            for (_, service) in node.services() {
                services.push((node.entity_id().to_string(), service));
            }
        }
        services
    }

    /// Start all autostart services, highest priority first.
    pub async fn deploy_services(&self) {
        let mut services: Vec<_> = self
            .all_services()
            .into_iter()
            .filter(|(_, service)| service.autostart())
            .collect();
        services.sort_by_key(|(_, service)| std::cmp::Reverse(service.priority()));
        info!("starting {} service(s)", services.len());
        for (node_id, service) in services {
            let delay = service.autostart_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !service.start() {
                warn!(node = %node_id, service = %service.name(), "service did not start");
            } else {
                debug!(node = %node_id, service = %service.name(), "service started");
            }
        }
    }

    /// Stop every service concurrently under one shared bounded wait.
    /// Returns the names of services still running afterwards; stragglers
    /// are reported, never escalated.
    pub async fn stop_services(&self) -> Vec<String> {
        let services = self.all_services();
        if services.is_empty() {
            return Vec::new();
        }
        info!("stopping {} service(s)", services.len());
        let wait = self.config.service_stop_wait;
        let handles: Vec<_> = services
            .iter()
            .map(|(_, service)| {
                let service = service.clone();
                tokio::task::spawn_blocking(move || service.stop(wait, true))
            })
            .collect();
        join_all(handles).await;

        services
            .into_iter()
            .filter(|(_, service)| service.is_running())
            .map(|(node_id, service)| format!("{} @ {node_id}", service.name()))
            .collect()
    }

    // Notification

    /// Record a topology change for debounced emission. Silently dropped
    /// while the engine is not running.
    pub fn on_topology_change(&self, entity_id: &str, change: &str) {
        if !self.is_running() {
            return;
        }
        self.debouncer.notify(TopologyChange::new(entity_id, change));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::interface::InterfaceKind;
    use crate::model::node::{DockerConfig, SwitchConfig};
    use crate::namespace::ExecOutcome;
    use crate::wrapper::docker::DockerCommand;
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct FakeService {
        name: String,
        priority: i32,
        running: Arc<AtomicBool>,
        refuse_stop: bool,
    }

    impl FakeService {
        fn new(name: &str, priority: i32) -> Self {
            Self {
                name: name.to_string(),
                priority,
                running: Arc::new(AtomicBool::new(false)),
                refuse_stop: false,
            }
        }

        fn stubborn(name: &str) -> Self {
            Self {
                refuse_stop: true,
                ..Self::new(name, 0)
            }
        }
    }

    impl NodeService for FakeService {
        fn name(&self) -> &str {
            &self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn autostart(&self) -> bool {
            true
        }
        fn start(&self) -> bool {
            self.running.store(true, Ordering::SeqCst);
            true
        }
        fn stop(&self, _wait: Duration, _auto_kill: bool) -> bool {
            if self.refuse_stop {
                return false;
            }
            self.running.store(false, Ordering::SeqCst);
            true
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn duplicate_entity_ids_are_rejected() {
        let emulator = NetworkEmulator::new();
        emulator
            .add_node(NetworkNode::new("h1", NodeKind::Host))
            .await
            .unwrap();
        let result = emulator.add_node(NetworkNode::new("h1", NodeKind::Host)).await;
        assert!(matches!(result, Err(EmulatorError::Config(_))));
    }

    #[tokio::test]
    async fn links_require_registered_interfaces() {
        let emulator = NetworkEmulator::new();
        let result = emulator.add_link(NetworkLink::new("1", "i1", "i2")).await;
        assert!(matches!(result, Err(EmulatorError::NotFound(_))));
    }

    #[tokio::test]
    async fn interfaces_require_a_registered_node() {
        let emulator = NetworkEmulator::new();
        let result = emulator
            .add_interface("h1", NetworkInterface::new("1", "h1", InterfaceKind::Virtual))
            .await;
        assert!(matches!(result, Err(EmulatorError::NotFound(_))));
    }

    #[tokio::test]
    async fn registration_wires_link_back_references() {
        let emulator = NetworkEmulator::new();
        let node_a = emulator
            .add_node(NetworkNode::new("h1", NodeKind::Host))
            .await
            .unwrap();
        emulator
            .add_node(NetworkNode::new("s1", NodeKind::Switch(SwitchConfig::default())))
            .await
            .unwrap();
        let iface_a = emulator
            .add_interface("h1", NetworkInterface::new("1", "h1", InterfaceKind::Virtual))
            .await
            .unwrap();
        let iface_b = emulator
            .add_interface("s1", NetworkInterface::new("2", "s1", InterfaceKind::Virtual))
            .await
            .unwrap();
        let link = emulator
            .add_link(NetworkLink::new("1", iface_a.entity_id(), iface_b.entity_id()))
            .await
            .unwrap();
        assert_eq!(iface_a.link_id().as_deref(), Some(link.entity_id()));
        assert_eq!(iface_b.link_id().as_deref(), Some(link.entity_id()));
        assert_eq!(node_a.interface_ids(), vec![iface_a.entity_id().to_string()]);
        assert_eq!(link.other_interface(iface_a.entity_id()), iface_b.entity_id());
    }

    #[tokio::test]
    async fn wrapper_variant_follows_node_kind() {
        let emulator = NetworkEmulator::new();
        emulator
            .add_node(NetworkNode::new("h1", NodeKind::Host))
            .await
            .unwrap();
        emulator
            .add_node(NetworkNode::new("s1", NodeKind::Switch(SwitchConfig::default())))
            .await
            .unwrap();
        let host = emulator.wrapper("h1").unwrap();
        assert!(matches!(
            host.as_node(),
            Some(NodeWrapper::Native(_))
        ));
        let switch = emulator.wrapper("s1").unwrap();
        assert!(matches!(switch.as_node(), Some(NodeWrapper::Ovs(_))));
    }

    #[tokio::test]
    async fn lookups_distinguish_hard_and_speculative_misses() {
        let emulator = NetworkEmulator::new();
        assert!(emulator.find_wrapper("ghost").is_none());
        assert!(matches!(
            emulator.wrapper("ghost"),
            Err(EmulatorError::NotFound(_))
        ));
        assert!(emulator.find_node("ghost").is_none());
        assert!(matches!(
            emulator.namespace_of("ghost").await,
            Err(EmulatorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stop_services_reports_stragglers() {
        let emulator = NetworkEmulator::with_config(
            EmulatorConfig {
                service_stop_wait: Duration::from_millis(10),
                ..Default::default()
            },
            |_| {},
        );
        let node = emulator
            .add_node(NetworkNode::new("h1", NodeKind::Host))
            .await
            .unwrap();
        node.add_service(Arc::new(FakeService::new("well-behaved", 0)));
        node.add_service(Arc::new(FakeService::stubborn("zombie")));

        emulator.deploy_services().await;
        let stragglers = emulator.stop_services().await;
        assert_eq!(stragglers, vec!["zombie @ h1".to_string()]);
    }

    #[tokio::test]
    async fn deploy_services_starts_autostart_services() {
        let emulator = NetworkEmulator::new();
        let node = emulator
            .add_node(NetworkNode::new("h1", NodeKind::Host))
            .await
            .unwrap();
        let service = Arc::new(FakeService::new("telemetry", 5));
        node.add_service(service.clone());
        emulator.deploy_services().await;
        assert!(service.is_running());
    }

    #[tokio::test]
    async fn interface_ownership_survives_teardown() {
        let emulator = NetworkEmulator::new();
        let node = emulator
            .add_node(NetworkNode::new("h1", NodeKind::Host))
            .await
            .unwrap();
        let iface = emulator
            .add_interface("h1", NetworkInterface::new("1", "h1", InterfaceKind::Virtual))
            .await
            .unwrap();

        // Wrapper cleanup removes devices and backend ports, never the
        // node's logical ownership of its interfaces.
        emulator.stop().await;
        assert_eq!(node.interface_ids(), vec![iface.entity_id().to_string()]);

        // The node therefore still unregisters its interfaces when removed.
        emulator.remove_node("h1").await.unwrap();
        assert!(emulator.find_interface(iface.entity_id()).is_none());
        assert!(emulator.find_wrapper(iface.entity_id()).is_none());
    }

    #[tokio::test]
    async fn teardown_cleans_nodes_concurrently() {
        let emulator = NetworkEmulator::new();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for i in 0..4 {
            let config = DockerConfig {
                image: "busybox".to_string(),
                ..DockerConfig::default()
            };
            let node = Arc::new(NetworkNode::new(
                &format!("c{i}"),
                NodeKind::Docker(config.clone()),
            ));
            let current = current.clone();
            let peak = peak.clone();
            let command: DockerCommand = Arc::new(move |_args: Vec<String>| {
                let current = current.clone();
                let peak = peak.clone();
                let fut: BoxFuture<'static, ExecOutcome> = Box::pin(async move {
                    let active = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(active, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    ExecOutcome::failure("No such container")
                });
                fut
            });
            let wrapper = DockerWrapper::with_command(node.clone(), config, "w", command);
            emulator.wrappers.write().insert(
                node.entity_id().to_string(),
                Arc::new(EntityWrapper::Node(NodeWrapper::Docker(wrapper))),
            );
            emulator.nodes.write().push(node);
        }

        emulator.stop().await;
        assert!(
            peak.load(Ordering::SeqCst) >= 2,
            "node cleanups ran strictly one after another"
        );
    }

    #[tokio::test]
    async fn model_changes_from_foreign_threads_do_not_panic() {
        let seen: Arc<Mutex<Vec<TopologyChange>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let emulator = NetworkEmulator::with_config(EmulatorConfig::default(), move |change| {
            sink.lock().push(change);
        });
        emulator
            .add_node(NetworkNode::new("h1", NodeKind::Host))
            .await
            .unwrap();
        emulator
            .add_node(NetworkNode::new("h2", NodeKind::Host))
            .await
            .unwrap();
        let a = emulator
            .add_interface("h1", NetworkInterface::new("1", "h1", InterfaceKind::Virtual))
            .await
            .unwrap();
        let b = emulator
            .add_interface("h2", NetworkInterface::new("2", "h2", InterfaceKind::Virtual))
            .await
            .unwrap();
        let link = emulator
            .add_link(NetworkLink::new("1", a.entity_id(), b.entity_id()))
            .await
            .unwrap();

        // Running state without privileged startup.
        *emulator.runtime.write() = Some(tokio::runtime::Handle::current());
        emulator.running.store(true, Ordering::SeqCst);

        // An external loader mutates the model from a plain OS thread.
        let mutator = {
            let link = link.clone();
            std::thread::spawn(move || link.model().set_delay_ms(Some(5)))
        };
        mutator.join().unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0],
            TopologyChange::new(link.entity_id(), "link_property:delay_ms")
        );
    }

    #[tokio::test]
    async fn removal_unregisters_and_unlinks() {
        let emulator = NetworkEmulator::new();
        emulator
            .add_node(NetworkNode::new("h1", NodeKind::Host))
            .await
            .unwrap();
        emulator
            .add_node(NetworkNode::new("h2", NodeKind::Host))
            .await
            .unwrap();
        let iface_a = emulator
            .add_interface("h1", NetworkInterface::new("1", "h1", InterfaceKind::Virtual))
            .await
            .unwrap();
        let iface_b = emulator
            .add_interface("h2", NetworkInterface::new("2", "h2", InterfaceKind::Virtual))
            .await
            .unwrap();
        let link = emulator
            .add_link(NetworkLink::new("1", iface_a.entity_id(), iface_b.entity_id()))
            .await
            .unwrap();

        emulator.remove_link(link.entity_id()).await.unwrap();
        assert!(iface_a.link_id().is_none());
        assert!(emulator.find_link(link.entity_id()).is_none());

        emulator.remove_node("h1").await.unwrap();
        assert!(emulator.find_node("h1").is_none());
        assert!(emulator.find_interface(iface_a.entity_id()).is_none());
        // The other endpoint's node is untouched
        assert!(emulator.find_interface(iface_b.entity_id()).is_some());
    }
}
