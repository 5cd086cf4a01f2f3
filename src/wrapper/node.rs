//! Node backend dispatch
//!
//! The set of node backends is closed; [`NodeWrapper`] dispatches the common
//! node contract exhaustively over the four variants. The variant is chosen
//! once from the node's [`crate::model::node::NodeKind`] at registration and
//! never changes.

use std::sync::Arc;

use crate::emulator::NetworkEmulator;
use crate::model::interface::NetworkInterface;
use crate::model::node::NetworkNode;
use crate::namespace::Namespace;
use crate::wrapper::docker::DockerWrapper;
use crate::wrapper::native::NativeWrapper;
use crate::wrapper::ovs::{OvsBatch, OvsWrapper};
use crate::wrapper::vm::VirtualMachineWrapper;
use crate::EmulatorError;

pub enum NodeWrapper {
    Native(NativeWrapper),
    Docker(DockerWrapper),
    Ovs(OvsWrapper),
    VirtualMachine(VirtualMachineWrapper),
}

impl NodeWrapper {
    pub fn node(&self) -> &Arc<NetworkNode> {
        match self {
            NodeWrapper::Native(wrapper) => wrapper.node(),
            NodeWrapper::Docker(wrapper) => wrapper.node(),
            NodeWrapper::Ovs(wrapper) => wrapper.node(),
            NodeWrapper::VirtualMachine(wrapper) => wrapper.node(),
        }
    }

    /// The node's primary execution context.
    pub async fn namespace(&self, emulator: &NetworkEmulator) -> Result<Namespace, EmulatorError> {
        match self {
            NodeWrapper::Native(wrapper) => Ok(wrapper.namespace()),
            NodeWrapper::Docker(wrapper) => wrapper.namespace().await,
            NodeWrapper::Ovs(wrapper) => Ok(wrapper.namespace(emulator)),
            NodeWrapper::VirtualMachine(wrapper) => Ok(wrapper.namespace()),
        }
    }

    /// Host-side control namespace. Only virtual machines have one distinct
    /// from the primary namespace.
    pub async fn additional_namespace(
        &self,
        emulator: &NetworkEmulator,
    ) -> Result<Namespace, EmulatorError> {
        match self {
            NodeWrapper::VirtualMachine(wrapper) => Ok(wrapper.additional_namespace(emulator)),
            _ => self.namespace(emulator).await,
        }
    }

    pub fn has_additional_namespace(&self) -> bool {
        matches!(self, NodeWrapper::VirtualMachine(_))
    }

    pub async fn create(&self, emulator: &NetworkEmulator) -> bool {
        match self {
            NodeWrapper::Native(wrapper) => wrapper.create().await,
            NodeWrapper::Docker(wrapper) => wrapper.create().await,
            NodeWrapper::Ovs(wrapper) => wrapper.create(emulator).await,
            NodeWrapper::VirtualMachine(wrapper) => wrapper.create(emulator).await,
        }
    }

    pub async fn clean(&self, emulator: &NetworkEmulator, batch: Option<&OvsBatch>) {
        match self {
            NodeWrapper::Native(wrapper) => wrapper.clean().await,
            NodeWrapper::Docker(wrapper) => wrapper.clean().await,
            NodeWrapper::Ovs(wrapper) => wrapper.clean(emulator, batch).await,
            NodeWrapper::VirtualMachine(wrapper) => wrapper.clean(emulator).await,
        }
    }

    /// Entity-level bring-up, after all devices of the topology exist.
    pub async fn start(&self, emulator: &NetworkEmulator) -> bool {
        match self {
            NodeWrapper::Native(wrapper) => wrapper.start(emulator).await,
            NodeWrapper::Docker(wrapper) => wrapper.start(emulator).await,
            NodeWrapper::Ovs(wrapper) => wrapper.start(emulator).await,
            NodeWrapper::VirtualMachine(wrapper) => wrapper.start(emulator).await,
        }
    }

    /// Membership hook: a device has arrived in this node's namespace.
    /// Touches backend state only (bridge ports, guest devices); logical
    /// ownership is registry state and never changes over a device's moves.
    pub async fn add_interface(
        &self,
        emulator: &NetworkEmulator,
        interface: &NetworkInterface,
    ) -> bool {
        match self {
            NodeWrapper::Ovs(wrapper) => wrapper.add_interface(emulator, interface).await,
            NodeWrapper::VirtualMachine(wrapper) => {
                wrapper.add_interface(emulator, interface).await
            }
            _ => true,
        }
    }

    /// Membership hook: a device is leaving this node's namespace. Backend
    /// state only, like [`NodeWrapper::add_interface`].
    pub async fn remove_interface(
        &self,
        emulator: &NetworkEmulator,
        interface: &NetworkInterface,
        batch: Option<&OvsBatch>,
    ) -> bool {
        match self {
            NodeWrapper::Ovs(wrapper) => {
                wrapper.remove_interface(emulator, interface, batch).await
            }
            NodeWrapper::VirtualMachine(wrapper) => {
                wrapper.remove_interface(emulator, interface).await
            }
            _ => true,
        }
    }
}
