//! OVS switch backend
//!
//! Switches are OVS bridges living in the emulator's main namespace; unlike
//! the other node kinds they are not isolated. Port membership follows the
//! interface bookkeeping of the owning node.
//!
//! During mass teardown, per-bridge `ovs-vsctl` round-trips dominate the
//! wall-clock time. [`OvsBatch`] collects the del-port/del-br commands of one
//! teardown phase and flushes them as a single `ovs-vsctl a -- b -- c`
//! invocation.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::emulator::NetworkEmulator;
use crate::model::interface::NetworkInterface;
use crate::model::node::{NetworkNode, SwitchConfig};
use crate::namespace::Namespace;

/// Scoped collection of deferred `ovs-vsctl` commands.
///
/// Commands are stored without the leading `ovs-vsctl`. The session is
/// explicit state owned by the caller; flushing drains the queue.
#[derive(Default)]
pub struct OvsBatch {
    commands: Mutex<Vec<Vec<String>>>,
}

impl OvsBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, command: Vec<String>) {
        self.commands.lock().push(command);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }

    /// Combined single-invocation argument list, or `None` when empty.
    fn drain(&self) -> Option<Vec<String>> {
        let mut queued = self.commands.lock();
        if queued.is_empty() {
            return None;
        }
        let mut combined: Vec<String> = Vec::new();
        for (i, command) in queued.drain(..).enumerate() {
            if i > 0 {
                combined.push("--".to_string());
            }
            combined.extend(command);
        }
        Some(combined)
    }

    /// Execute all queued commands in one `ovs-vsctl` invocation.
    pub async fn flush(&self, namespace: &Namespace) -> bool {
        let Some(combined) = self.drain() else {
            return true;
        };
        let mut args: Vec<&str> = vec!["ovs-vsctl"];
        args.extend(combined.iter().map(String::as_str));
        let out = namespace.exec(&args).await;
        if !out.success {
            error!("ovs batch flush failed: {}", out.output());
        }
        out.success
    }
}

pub struct OvsWrapper {
    node: Arc<NetworkNode>,
    config: SwitchConfig,
}

impl OvsWrapper {
    pub fn new(node: Arc<NetworkNode>, config: SwitchConfig) -> Self {
        Self { node, config }
    }

    pub fn node(&self) -> &Arc<NetworkNode> {
        &self.node
    }

    fn bridge(&self) -> &str {
        self.node.system_id()
    }

    pub fn namespace(&self, emulator: &NetworkEmulator) -> Namespace {
        emulator.main_namespace().clone()
    }

    pub async fn create(&self, emulator: &NetworkEmulator) -> bool {
        let namespace = self.namespace(emulator);
        let out = namespace
            .exec(&["ovs-vsctl", "add-br", self.bridge()])
            .await;
        if !out.success {
            error!(switch = %self.node.entity_id(), "could not create bridge: {}", out.output());
            return false;
        }
        let fail_mode = format!("fail_mode={}", self.config.fail_mode);
        namespace
            .exec(&["ovs-vsctl", "set", "bridge", self.bridge(), &fail_mode])
            .await;
        true
    }

    pub async fn clean(&self, emulator: &NetworkEmulator, batch: Option<&OvsBatch>) {
        let command = vec!["del-br".to_string(), self.bridge().to_string()];
        if let Some(batch) = batch {
            batch.push(command);
            return;
        }
        let out = self
            .namespace(emulator)
            .exec(&["ovs-vsctl", "del-br", self.bridge()])
            .await;
        if !out.success {
            warn!(switch = %self.node.entity_id(), "could not remove bridge: {}", out.output());
        }
    }

    pub async fn add_interface(
        &self,
        emulator: &NetworkEmulator,
        interface: &NetworkInterface,
    ) -> bool {
        let out = self
            .namespace(emulator)
            .exec(&[
                "ovs-vsctl",
                "add-port",
                self.bridge(),
                interface.interface_name(),
            ])
            .await;
        if !out.success {
            error!(switch = %self.node.entity_id(), port = %interface.interface_name(), "could not add port: {}", out.output());
        }
        out.success
    }

    pub async fn remove_interface(
        &self,
        emulator: &NetworkEmulator,
        interface: &NetworkInterface,
        batch: Option<&OvsBatch>,
    ) -> bool {
        if !self.node.is_started() {
            return true;
        }
        let command = vec![
            "del-port".to_string(),
            self.bridge().to_string(),
            interface.interface_name().to_string(),
        ];
        if let Some(batch) = batch {
            batch.push(command);
            return true;
        }
        let out = self
            .namespace(emulator)
            .exec(&[
                "ovs-vsctl",
                "del-port",
                self.bridge(),
                interface.interface_name(),
            ])
            .await;
        out.success
    }

    /// Entity-level bring-up: wire special ports (physical uplinks, mirror
    /// ports) and apply the spanning-tree configuration.
    pub async fn start(&self, emulator: &NetworkEmulator) -> bool {
        let namespace = self.namespace(emulator);
        let mut success = true;

        let rstp = format!("rstp_enable={}", self.config.rstp);
        let out = namespace
            .exec(&["ovs-vsctl", "set", "bridge", self.bridge(), &rstp])
            .await;
        if !out.success {
            warn!(switch = %self.node.entity_id(), "could not configure rstp: {}", out.output());
        }
        if self.config.stp {
            namespace
                .exec(&["ovs-vsctl", "set", "bridge", self.bridge(), "stp_enable=true"])
                .await;
        }

        for interface_id in self.node.interface_ids() {
            let Some(interface) = emulator.find_interface(&interface_id) else {
                continue;
            };
            if interface.is_physical() {
                let out = namespace
                    .exec(&[
                        "ovs-vsctl",
                        "--may-exist",
                        "add-port",
                        self.bridge(),
                        interface.interface_name(),
                    ])
                    .await;
                if out.success {
                    info!(switch = %self.node.entity_id(), device = %interface.interface_name(), "added physical uplink");
                } else {
                    error!(switch = %self.node.entity_id(), device = %interface.interface_name(), "could not add physical uplink: {}", out.output());
                    success = false;
                }
            }
            if interface.is_mirror() && !self.enable_mirror(emulator, &interface).await {
                success = false;
            }
        }
        success
    }

    /// Make `interface` the bridge's mirror port, receiving a copy of all
    /// traffic (select-all).
    pub async fn enable_mirror(
        &self,
        emulator: &NetworkEmulator,
        interface: &NetworkInterface,
    ) -> bool {
        let namespace = self.namespace(emulator);
        let port = interface.interface_name();
        let out = namespace
            .exec(&["ovs-vsctl", "--may-exist", "add-port", self.bridge(), port])
            .await;
        if !out.success {
            error!(switch = %self.node.entity_id(), port = %port, "could not add mirror port: {}", out.output());
            return false;
        }
        let mirror_name = format!("name={}", interface.entity_id());
        let out = namespace
            .exec(&[
                "ovs-vsctl",
                "--",
                "--id=@p",
                "get",
                "port",
                port,
                "--",
                "--id=@m",
                "create",
                "mirror",
                &mirror_name,
                "select-all=true",
                "output-port=@p",
                "--",
                "set",
                "bridge",
                self.bridge(),
                "mirrors=@m",
            ])
            .await;
        if out.success {
            debug!(switch = %self.node.entity_id(), mirror = %interface.entity_id(), "mirror active");
        } else {
            error!(switch = %self.node.entity_id(), mirror = %interface.entity_id(), "could not create mirror: {}", out.output());
        }
        out.success
    }

    pub async fn disable_mirror(
        &self,
        emulator: &NetworkEmulator,
        interface: &NetworkInterface,
    ) -> bool {
        let out = self
            .namespace(emulator)
            .exec(&[
                "ovs-vsctl",
                "--",
                "--id=@p",
                "get",
                "mirror",
                interface.entity_id(),
                "--",
                "remove",
                "bridge",
                self.bridge(),
                "mirrors",
                "@p",
            ])
            .await;
        out.success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_combines_commands_with_separators() {
        let batch = OvsBatch::new();
        batch.push(vec!["del-port".into(), "s1".into(), "h1-i1".into()]);
        batch.push(vec!["del-br".into(), "s1".into()]);
        let combined = batch.drain().unwrap();
        assert_eq!(combined.join(" "), "del-port s1 h1-i1 -- del-br s1");
        // Draining empties the session
        assert!(batch.is_empty());
        assert!(batch.drain().is_none());
    }

    #[test]
    fn empty_batch_drains_to_nothing() {
        assert!(OvsBatch::new().drain().is_none());
    }
}
