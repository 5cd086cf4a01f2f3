//! Link wrapper
//!
//! A link materializes as a veth pair created atomically in the main
//! namespace, with each end pushed into its owning node's namespace and
//! configured there. Cleanup goes through both interface wrappers
//! independently, so a link can be torn down even after one endpoint's node
//! is already gone.

use std::sync::Arc;

use tracing::{error, warn};

use crate::emulator::NetworkEmulator;
use crate::model::link::NetworkLink;
use crate::wrapper::interface::InterfaceWrapper;
use crate::wrapper::ovs::OvsBatch;
use crate::EmulatorError;

pub struct LinkWrapper {
    link: Arc<NetworkLink>,
    enable_link_properties: bool,
}

impl LinkWrapper {
    pub fn new(link: Arc<NetworkLink>, enable_link_properties: bool) -> Self {
        Self {
            link,
            enable_link_properties,
        }
    }

    pub fn link(&self) -> &Arc<NetworkLink> {
        &self.link
    }

    fn endpoint(
        &self,
        emulator: &NetworkEmulator,
        interface_id: &str,
    ) -> Result<Arc<crate::wrapper::EntityWrapper>, EmulatorError> {
        emulator.wrapper(interface_id)
    }

    pub async fn create(&self, emulator: &NetworkEmulator) -> bool {
        let (Ok(wrapper_a), Ok(wrapper_b)) = (
            self.endpoint(emulator, self.link.interface_a()),
            self.endpoint(emulator, self.link.interface_b()),
        ) else {
            error!(link = %self.link.entity_id(), "link endpoints are not registered");
            return false;
        };
        let (Some(side_a), Some(side_b)) = (wrapper_a.as_interface(), wrapper_b.as_interface())
        else {
            error!(link = %self.link.entity_id(), "link endpoints are not interfaces");
            return false;
        };

        // Duplicate creation is a checked error, not silently ignored.
        if side_a.exists(emulator).await {
            error!(link = %self.link.entity_id(), device = %side_a.interface().interface_name(), "device already exists");
            return false;
        }
        if side_b.exists(emulator).await {
            error!(link = %self.link.entity_id(), device = %side_b.interface().interface_name(), "device already exists");
            return false;
        }

        let name_a = side_a.interface().interface_name();
        let name_b = side_b.interface().interface_name();
        let out = emulator
            .main_namespace()
            .exec(&[
                "ip", "link", "add", name_a, "type", "veth", "peer", "name", name_b,
            ])
            .await;
        if !out.success {
            error!(link = %self.link.entity_id(), "cannot create veth pair {name_a} <-> {name_b}: {}", out.output());
            return false;
        }

        // A failed push is not rolled back; the caller cleans up via clean().
        let mut success = true;
        for side in [side_a, side_b] {
            if side.push_to_namespace(emulator, None).await {
                if !side.configure(emulator).await {
                    warn!(link = %self.link.entity_id(), device = %side.interface().interface_name(), "endpoint configuration failed");
                    success = false;
                }
            } else {
                success = false;
            }
        }
        self.link.set_up(success);
        success
    }

    /// Clean both endpoints, each independently of the other's (and its
    /// node's) lifecycle state.
    pub async fn clean(&self, emulator: &NetworkEmulator, batch: Option<&OvsBatch>) {
        for interface_id in [self.link.interface_a(), self.link.interface_b()] {
            let Ok(wrapper) = self.endpoint(emulator, interface_id) else {
                continue;
            };
            if let Some(side) = wrapper.as_interface() {
                side.clean(emulator, batch).await;
            }
        }
        self.link.set_up(false);
    }

    /// Push the link's current model onto both endpoint devices. A no-op
    /// reporting success when link property propagation is disabled.
    pub async fn apply_link_properties(&self, emulator: &NetworkEmulator) -> bool {
        if !self.enable_link_properties {
            return true;
        }
        let model = self.link.model().snapshot();
        let mut success = true;
        for interface_id in [self.link.interface_a(), self.link.interface_b()] {
            let Ok(wrapper) = self.endpoint(emulator, interface_id) else {
                success = false;
                continue;
            };
            match wrapper.as_interface() {
                Some(side) => {
                    success &= side.apply_tc_properties(emulator, &model).await;
                }
                None => success = false,
            }
        }
        success
    }
}
