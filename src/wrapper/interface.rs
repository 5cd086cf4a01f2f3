//! Interface wrapper
//!
//! Binds one [`NetworkInterface`] to a real device. Creation strategy is
//! keyed by the interface kind: physical devices are adopted from the host,
//! tap ports are created by their owning switch, standalone virtual
//! interfaces become dummy devices, and linked virtual interfaces are
//! created pairwise by their [`crate::wrapper::LinkWrapper`].
//!
//! Traffic shaping diffs against the snapshot this wrapper last applied, not
//! against live device state; see [`crate::tc`].

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::emulator::NetworkEmulator;
use crate::model::interface::NetworkInterface;
use crate::model::link_model::LinkModel;
use crate::namespace::Namespace;
use crate::tc;
use crate::wrapper::ovs::OvsBatch;
use crate::EmulatorError;

pub struct InterfaceWrapper {
    interface: Arc<NetworkInterface>,
    /// Shaping snapshot last pushed to the device.
    previous_model: Mutex<Option<LinkModel>>,
}

impl InterfaceWrapper {
    pub fn new(interface: Arc<NetworkInterface>) -> Self {
        Self {
            interface,
            previous_model: Mutex::new(None),
        }
    }

    pub fn interface(&self) -> &Arc<NetworkInterface> {
        &self.interface
    }

    fn device(&self) -> &str {
        self.interface.interface_name()
    }

    /// The owning node's namespace.
    pub async fn namespace(&self, emulator: &NetworkEmulator) -> Result<Namespace, EmulatorError> {
        let wrapper = emulator.wrapper(self.interface.node_id())?;
        let node = wrapper.as_node().ok_or_else(|| {
            EmulatorError::Config(format!(
                "interface {} is not owned by a node",
                self.interface.entity_id()
            ))
        })?;
        node.namespace(emulator).await
    }

    /// The owning node's host-side control namespace.
    pub async fn additional_namespace(
        &self,
        emulator: &NetworkEmulator,
    ) -> Result<Namespace, EmulatorError> {
        let wrapper = emulator.wrapper(self.interface.node_id())?;
        let node = wrapper.as_node().ok_or_else(|| {
            EmulatorError::Config(format!(
                "interface {} is not owned by a node",
                self.interface.entity_id()
            ))
        })?;
        node.additional_namespace(emulator).await
    }

    /// Probe the device by name in its namespace.
    pub async fn exists(&self, emulator: &NetworkEmulator) -> bool {
        let Ok(namespace) = self.namespace(emulator).await else {
            return false;
        };
        namespace
            .exec(&["ip", "link", "show", "dev", self.device()])
            .await
            .success
    }

    pub async fn create(&self, emulator: &NetworkEmulator) -> bool {
        if self.interface.is_physical() {
            // Adopt the pre-existing host device into the node's namespace.
            let main = emulator.main_namespace();
            main.exec(&["ip", "address", "flush", "dev", self.device()])
                .await;
            if !self.push_to_namespace(emulator, None).await {
                return false;
            }
            return self.up(emulator).await;
        }
        if self.interface.is_tap() {
            // The owning switch wires tap ports itself.
            debug!(interface = %self.interface.entity_id(), "tap port creation deferred to owning switch");
            return true;
        }
        if self.interface.is_linked() {
            // The link wrapper creates both veth ends atomically.
            return true;
        }
        // Standalone virtual interface (e.g. a mirror port): a dummy device
        // created in the main namespace and pushed to its node.
        debug!(interface = %self.interface.entity_id(), "creating standalone dummy device");
        let out = emulator
            .main_namespace()
            .exec(&["ip", "link", "add", self.device(), "type", "dummy"])
            .await;
        if !out.success {
            error!(interface = %self.interface.entity_id(), "could not create dummy device: {}", out.output());
            return false;
        }
        if !self.push_to_namespace(emulator, None).await {
            return false;
        }
        self.configure(emulator).await
    }

    pub async fn clean(&self, emulator: &NetworkEmulator, batch: Option<&OvsBatch>) {
        let Ok(wrapper) = emulator.wrapper(self.interface.node_id()) else {
            warn!(interface = %self.interface.entity_id(), "owning node already unregistered");
            return;
        };
        let Some(node) = wrapper.as_node() else {
            return;
        };
        if self.interface.is_tap() {
            return;
        }
        node.remove_interface(emulator, &self.interface, batch).await;
        if self.interface.is_physical() {
            // Returns to the default namespace when its namespace dies.
            return;
        }
        if let Ok(namespace) = self.namespace(emulator).await {
            namespace
                .exec(&["ip", "link", "delete", self.device()])
                .await;
        }
    }

    /// Full device configuration: down, MAC, addresses, up. The device is
    /// never observably up while only partially configured.
    pub async fn configure(&self, emulator: &NetworkEmulator) -> bool {
        if !self.exists(emulator).await {
            warn!(interface = %self.interface.entity_id(), device = %self.device(), "cannot configure missing device");
            return false;
        }
        self.down(emulator).await;
        self.update_mac_address(emulator).await;
        self.update_ip_address(emulator).await;
        self.up(emulator).await
    }

    pub async fn down(&self, emulator: &NetworkEmulator) -> bool {
        let Ok(namespace) = self.namespace(emulator).await else {
            return false;
        };
        namespace
            .exec(&["ip", "link", "set", "dev", self.device(), "down"])
            .await
            .success
    }

    pub async fn up(&self, emulator: &NetworkEmulator) -> bool {
        let Ok(namespace) = self.namespace(emulator).await else {
            return false;
        };
        namespace
            .exec(&["ip", "link", "set", "dev", self.device(), "up"])
            .await
            .success
    }

    /// Live MAC reconfiguration without recreating the device.
    pub async fn update_mac_address(&self, emulator: &NetworkEmulator) -> bool {
        let Some(mac) = self.interface.mac_address() else {
            return true;
        };
        let Ok(namespace) = self.namespace(emulator).await else {
            return false;
        };
        let out = namespace
            .exec(&["ip", "link", "set", "dev", self.device(), "address", &mac])
            .await;
        if !out.success {
            warn!(interface = %self.interface.entity_id(), "cannot set MAC: {}", out.output());
        }
        out.success
    }

    /// Live IP reconfiguration; always flushes first so a re-apply is
    /// idempotent.
    pub async fn update_ip_address(&self, emulator: &NetworkEmulator) -> bool {
        let Ok(namespace) = self.namespace(emulator).await else {
            return false;
        };
        let out = namespace
            .exec(&["ip", "address", "flush", "dev", self.device()])
            .await;
        if !out.success {
            warn!(interface = %self.interface.entity_id(), "cannot flush addresses: {}", out.output());
        }
        let Some(ip) = self.interface.ip_address() else {
            return out.success;
        };
        let address = ip.to_string();
        let out = namespace
            .exec(&["ip", "address", "add", &address, "dev", self.device()])
            .await;
        if !out.success {
            warn!(interface = %self.interface.entity_id(), "cannot set address {address}: {}", out.output());
        }
        out.success
    }

    /// Move the device from the main namespace into `namespace` (the owning
    /// node's namespace when `None`) and wire it into the node's backend
    /// (bridge port, guest device).
    pub async fn push_to_namespace(
        &self,
        emulator: &NetworkEmulator,
        namespace: Option<&Namespace>,
    ) -> bool {
        let target = match namespace {
            Some(ns) => ns.clone(),
            None => match self.namespace(emulator).await {
                Ok(ns) => ns,
                Err(e) => {
                    warn!(interface = %self.interface.entity_id(), "no target namespace: {e}");
                    return false;
                }
            },
        };
        if target.is_network_namespace() {
            let out = emulator
                .main_namespace()
                .exec(&["ip", "link", "set", self.device(), "netns", target.name()])
                .await;
            if !out.success {
                warn!(interface = %self.interface.entity_id(), device = %self.device(), "cannot move device: {}", out.output());
                return false;
            }
        }
        let Ok(wrapper) = emulator.wrapper(self.interface.node_id()) else {
            return false;
        };
        match wrapper.as_node() {
            Some(node) => node.add_interface(emulator, &self.interface).await,
            None => false,
        }
    }

    /// Move the device back into the main namespace, unwiring it from the
    /// node's backend first.
    pub async fn pull_to_main_namespace(&self, emulator: &NetworkEmulator) -> bool {
        let Ok(wrapper) = emulator.wrapper(self.interface.node_id()) else {
            return false;
        };
        if let Some(node) = wrapper.as_node() {
            node.remove_interface(emulator, &self.interface, None).await;
        }
        let Ok(namespace) = self.namespace(emulator).await else {
            return false;
        };
        if namespace.is_network_namespace() {
            let main_name = emulator.main_namespace().name().to_string();
            let out = namespace
                .exec(&["ip", "link", "set", self.device(), "netns", &main_name])
                .await;
            if !out.success {
                warn!(interface = %self.interface.entity_id(), "cannot move device to main namespace: {}", out.output());
                return false;
            }
        }
        true
    }

    /// Apply `model` to the device, diffing against the previously applied
    /// snapshot. Sub-command failures are logged and fail the overall call,
    /// but remaining sub-commands still run; the snapshot is recorded either
    /// way so the next diff compares against what was intended.
    pub async fn apply_tc_properties(
        &self,
        emulator: &NetworkEmulator,
        model: &LinkModel,
    ) -> bool {
        if self.interface.is_physical() {
            warn!(interface = %self.interface.entity_id(), "refusing to shape a physical device");
            return false;
        }
        // Shaping always runs host-side; for VM-backed nodes the veth end
        // lives in the control namespace.
        let Ok(namespace) = self.additional_namespace(emulator).await else {
            return false;
        };
        if !namespace.exec(&["which", "tc"]).await.success {
            warn!(interface = %self.interface.entity_id(), "tc not available in namespace {}", namespace.name());
            return false;
        }

        let previous = self.previous_model.lock().clone();
        let tc_active = self.is_tc_enabled(emulator).await;
        let plan = tc::plan(self.device(), previous.as_ref(), model, tc_active);

        let mut success = true;
        for command in &plan {
            let mut args: Vec<&str> = vec!["tc"];
            args.extend(command.iter().map(String::as_str));
            let out = namespace.exec(&args).await;
            if !out.success {
                error!(interface = %self.interface.entity_id(), "tc {} failed: {}", command.join(" "), out.output());
                success = false;
            }
        }
        *self.previous_model.lock() = Some(model.clone());
        success
    }

    /// Whether the device carries a configured discipline, as opposed to the
    /// kernel defaults. Decides `add` vs `change` on first touch.
    pub async fn is_tc_enabled(&self, emulator: &NetworkEmulator) -> bool {
        let Ok(namespace) = self.additional_namespace(emulator).await else {
            return false;
        };
        let out = namespace
            .exec(&["tc", "qdisc", "show", "dev", self.device()])
            .await;
        if !out.success {
            return false;
        }
        tc::qdisc_output_indicates_shaping(&out.output())
    }

    /// Snapshot last applied to the device, if any.
    pub fn applied_model(&self) -> Option<LinkModel> {
        self.previous_model.lock().clone()
    }
}
