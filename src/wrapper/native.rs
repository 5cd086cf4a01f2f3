//! Native node backend
//!
//! The simplest backend: the node owns one plain network namespace named
//! deterministically from its entity id. Creation fails if the namespace
//! already exists; silent reuse would hide leftovers from a previous run.

use std::sync::Arc;

use tracing::{error, warn};

use crate::emulator::NetworkEmulator;
use crate::model::node::NetworkNode;
use crate::namespace::Namespace;

pub struct NativeWrapper {
    node: Arc<NetworkNode>,
    namespace: Namespace,
}

impl NativeWrapper {
    pub fn new(node: Arc<NetworkNode>, namespace_prefix: &str) -> Self {
        let namespace = Namespace::new(format!("{namespace_prefix}_{}", node.entity_id()));
        Self { node, namespace }
    }

    pub fn node(&self) -> &Arc<NetworkNode> {
        &self.node
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace.clone()
    }

    pub async fn create(&self) -> bool {
        if self.namespace.exists().await {
            error!(node = %self.node.entity_id(), namespace = %self.namespace.name(), "namespace already exists");
            return false;
        }
        if !self.namespace.create().await {
            return false;
        }
        self.namespace.loopback_up().await
    }

    pub async fn clean(&self) {
        if !self.namespace.exists().await {
            warn!(node = %self.node.entity_id(), "namespace not found");
            return;
        }
        self.namespace.clean().await;
    }

    /// Entity-level bring-up once all devices exist.
    pub async fn start(&self, _emulator: &NetworkEmulator) -> bool {
        if let Some(gateway) = self.node.config().default_route {
            let gateway = gateway.to_string();
            let out = self
                .namespace
                .exec(&["ip", "route", "replace", "default", "via", &gateway])
                .await;
            if !out.success {
                warn!(node = %self.node.entity_id(), "could not set default route: {}", out.output());
                return false;
            }
        }
        true
    }
}
