//! Entity wrappers
//!
//! A wrapper binds one logical entity to its backend: it owns the mapping
//! from the entity graph to concrete OS resources and is the only layer that
//! issues networking commands. Node backends are a closed set dispatched by
//! [`NodeWrapper`]; interfaces and links have one wrapper each.
//!
//! Wrappers are registered once per entity and hold no back-reference to the
//! engine; every operation takes the emulator as a parameter instead.
//!
//! `create()` failing must leave nothing behind that a subsequent `clean()`
//! cannot remove, and `clean()` must tolerate resources that are already
//! gone.

pub mod docker;
pub mod interface;
pub mod link;
pub mod native;
pub mod node;
pub mod ovs;
pub mod vm;

pub use interface::InterfaceWrapper;
pub use link::LinkWrapper;
pub use node::NodeWrapper;
pub use ovs::OvsBatch;

use crate::emulator::NetworkEmulator;
use crate::namespace::Namespace;
use crate::EmulatorError;

/// Backend binding for one registered entity.
pub enum EntityWrapper {
    Node(NodeWrapper),
    Interface(InterfaceWrapper),
    Link(LinkWrapper),
}

impl EntityWrapper {
    pub fn as_node(&self) -> Option<&NodeWrapper> {
        match self {
            EntityWrapper::Node(wrapper) => Some(wrapper),
            _ => None,
        }
    }

    pub fn as_interface(&self) -> Option<&InterfaceWrapper> {
        match self {
            EntityWrapper::Interface(wrapper) => Some(wrapper),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&LinkWrapper> {
        match self {
            EntityWrapper::Link(wrapper) => Some(wrapper),
            _ => None,
        }
    }

    /// Primary execution context of the wrapped entity.
    ///
    /// Links have no namespace of their own; Docker-backed nodes refuse
    /// until their container is running.
    pub async fn namespace(&self, emulator: &NetworkEmulator) -> Result<Namespace, EmulatorError> {
        match self {
            EntityWrapper::Node(wrapper) => wrapper.namespace(emulator).await,
            EntityWrapper::Interface(wrapper) => wrapper.namespace(emulator).await,
            EntityWrapper::Link(_) => Err(EmulatorError::Namespace(
                "links do not have a dedicated namespace".to_string(),
            )),
        }
    }

    /// Host-side control namespace; identical to the primary one for all
    /// backends except virtual machines.
    pub async fn additional_namespace(
        &self,
        emulator: &NetworkEmulator,
    ) -> Result<Namespace, EmulatorError> {
        match self {
            EntityWrapper::Node(wrapper) => wrapper.additional_namespace(emulator).await,
            EntityWrapper::Interface(wrapper) => wrapper.additional_namespace(emulator).await,
            EntityWrapper::Link(_) => Err(EmulatorError::Namespace(
                "links do not have a dedicated namespace".to_string(),
            )),
        }
    }

    pub async fn create(&self, emulator: &NetworkEmulator) -> bool {
        match self {
            EntityWrapper::Node(wrapper) => wrapper.create(emulator).await,
            EntityWrapper::Interface(wrapper) => wrapper.create(emulator).await,
            EntityWrapper::Link(wrapper) => wrapper.create(emulator).await,
        }
    }

    pub async fn clean(&self, emulator: &NetworkEmulator, batch: Option<&OvsBatch>) {
        match self {
            EntityWrapper::Node(wrapper) => wrapper.clean(emulator, batch).await,
            EntityWrapper::Interface(wrapper) => wrapper.clean(emulator, batch).await,
            EntityWrapper::Link(wrapper) => wrapper.clean(emulator, batch).await,
        }
    }
}

/// Device names from `ip -o link show` lines (`2: eth0@if3: <...>`).
pub(crate) fn parse_device_names(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ':');
            parts.next()?;
            let name = parts.next()?.trim();
            Some(name.split('@').next().unwrap_or(name).to_string())
        })
        .filter(|name| !name.is_empty())
        .collect()
}
