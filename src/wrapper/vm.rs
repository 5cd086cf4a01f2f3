//! Libvirt node backend
//!
//! The node is a QEMU/KVM domain. Commands inside the guest travel through
//! the QEMU guest agent (the node's namespace is not a network namespace);
//! libvirt control operations (`virsh`, `virt-clone`, `virt-xml`) run in the
//! host-side main namespace, which this wrapper exposes as its additional
//! namespace.
//!
//! Interfaces are attached as macvtap devices onto the host-side veth ends.
//! The attached MAC has its fifth octet rewritten to `F<x>` so the guest-side
//! device can be told apart from the host-side one carrying the original MAC.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::emulator::NetworkEmulator;
use crate::model::interface::NetworkInterface;
use crate::model::node::{NetworkNode, VmConfig};
use crate::namespace::Namespace;
use crate::wrapper::parse_device_names;

const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct VirtualMachineWrapper {
    node: Arc<NetworkNode>,
    config: VmConfig,
    domain: String,
    namespace: Namespace,
    image_file: PathBuf,
    /// MAC actually attached per interface id, needed for later detach.
    attached_macs: Mutex<HashMap<String, String>>,
}

impl VirtualMachineWrapper {
    pub fn new(node: Arc<NetworkNode>, config: VmConfig, namespace_prefix: &str) -> Self {
        let domain = if config.domain_name.is_empty() {
            node.system_id().to_string()
        } else {
            config.domain_name.clone()
        };
        let namespace = Namespace::for_domain(
            format!("{namespace_prefix}_{}", node.entity_id()),
            domain.clone(),
        );
        let image_file = config.image_dir.join(format!("{domain}.img"));
        Self {
            node,
            config,
            domain,
            namespace,
            image_file,
            attached_macs: Mutex::new(HashMap::new()),
        }
    }

    pub fn node(&self) -> &Arc<NetworkNode> {
        &self.node
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace.clone()
    }

    /// Host-side namespace for libvirt control operations.
    pub fn additional_namespace(&self, emulator: &NetworkEmulator) -> Namespace {
        emulator.main_namespace().clone()
    }

    pub async fn create(&self, emulator: &NetworkEmulator) -> bool {
        let host = self.additional_namespace(emulator);
        if self.config.clone_template {
            let template = self.config.template_xml.display().to_string();
            let image = self.image_file.display().to_string();
            let out = host
                .exec(&[
                    "virt-clone",
                    "--original-xml",
                    &template,
                    "--name",
                    &self.domain,
                    "-f",
                    &image,
                ])
                .await;
            if !out.success {
                error!(vm = %self.node.entity_id(), "could not clone template: {}", out.output());
                return false;
            }
            // The template XML points at the template's disk; retarget the
            // clone to its own image.
            let disk = format!("path={}", self.config.disk_file.display());
            let out = host
                .exec(&["virt-xml", &self.domain, "--edit", "--disk", &disk])
                .await;
            if !out.success {
                warn!(vm = %self.node.entity_id(), "could not rewrite disk path: {}", out.output());
            }
        }
        if let Some(shared) = &self.config.shared_folder {
            host.exec(&[
                "virt-xml",
                &self.domain,
                "--edit",
                "--memorybacking",
                "access.mode=shared",
            ])
            .await;
            let filesystem = format!(
                "driver.type=virtiofs,source.dir={},target.dir={}",
                shared.host_folder.display(),
                shared.target_folder
            );
            let out = host
                .exec(&[
                    "virt-xml",
                    &self.domain,
                    "--add-device",
                    "--filesystem",
                    &filesystem,
                ])
                .await;
            if !out.success {
                warn!(vm = %self.node.entity_id(), "could not add shared folder: {}", out.output());
            }
        }

        if !self.namespace.create().await {
            error!(vm = %self.node.entity_id(), domain = %self.domain, "could not start domain");
            return false;
        }
        info!(vm = %self.node.entity_id(), domain = %self.domain, "waiting for guest agent");
        if !self
            .namespace
            .wait_until_available(self.config.boot_timeout, BOOT_POLL_INTERVAL)
            .await
        {
            error!(vm = %self.node.entity_id(), domain = %self.domain, "guest agent did not come up");
            return false;
        }

        if let Some(shared) = &self.config.shared_folder {
            self.namespace
                .exec(&["mkdir", "-p", &shared.target_folder])
                .await;
            let out = self
                .namespace
                .exec(&[
                    "mount",
                    "-t",
                    "virtiofs",
                    &shared.target_folder,
                    &shared.target_folder,
                ])
                .await;
            if !out.success {
                warn!(vm = %self.node.entity_id(), "could not mount shared folder: {}", out.output());
            }
        }

        if self.namespace.guest_os().await.as_deref() == Some("linux") {
            // The guest's own network management fights the emulated
            // addressing; routes from previous boots are stale.
            self.namespace
                .exec(&["systemctl", "stop", "NetworkManager.service"])
                .await;
            self.namespace
                .exec(&["ip", "route", "flush", "table", "main"])
                .await;
        }
        true
    }

    pub async fn clean(&self, emulator: &NetworkEmulator) {
        self.namespace.clean().await;
        if self.config.clone_template {
            let host = self.additional_namespace(emulator);
            let out = host.exec(&["virsh", "undefine", &self.domain]).await;
            if !out.success {
                warn!(vm = %self.node.entity_id(), "could not undefine domain: {}", out.output());
            }
            if let Err(e) = std::fs::remove_file(&self.image_file) {
                debug!(vm = %self.node.entity_id(), "no clone image to remove: {e}");
            }
        }
    }

    async fn guest_device_names(&self) -> Vec<String> {
        let out = self.namespace.exec(&["ip", "-o", "link", "show"]).await;
        if !out.success {
            return Vec::new();
        }
        parse_device_names(&out.lines)
    }

    /// Attach a host-side device into the guest and rename the guest-side
    /// device to the declared interface name.
    pub async fn add_interface(
        &self,
        emulator: &NetworkEmulator,
        interface: &NetworkInterface,
    ) -> bool {
        let host = self.additional_namespace(emulator);
        let before = self.guest_device_names().await;

        let target_mac = interface.mac_address().map(|mac| rewrite_attach_mac(&mac));
        let mut args: Vec<String> = vec![
            "virsh".into(),
            "attach-interface".into(),
            "--type".into(),
            "direct".into(),
            "--source".into(),
            interface.interface_name().to_string(),
            "--model".into(),
            "virtio".into(),
        ];
        if let Some(mac) = &target_mac {
            args.push("--mac".into());
            args.push(mac.clone());
        }
        args.push(self.domain.clone());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = host.exec(&arg_refs).await;
        if !out.success {
            error!(vm = %self.node.entity_id(), device = %interface.interface_name(), "could not attach interface: {}", out.output());
            return false;
        }

        // The guest needs a moment to enumerate the hot-plugged device.
        tokio::time::sleep(Duration::from_secs(1)).await;
        if !self
            .namespace
            .wait_until_available(self.config.boot_timeout, BOOT_POLL_INTERVAL)
            .await
        {
            error!(vm = %self.node.entity_id(), "lost guest agent while attaching interface");
            return false;
        }

        let after = self.guest_device_names().await;
        let Some(new_device) = after.iter().find(|name| !before.contains(name)) else {
            error!(vm = %self.node.entity_id(), "could not find hot-plugged guest device");
            return false;
        };
        if let Some(mac) = target_mac {
            self.attached_macs
                .lock()
                .insert(interface.entity_id().to_string(), mac);
        }
        if new_device != interface.interface_name() {
            let renamed = self
                .rename_guest_device(new_device, interface.interface_name())
                .await;
            if !renamed {
                return false;
            }
            debug!(vm = %self.node.entity_id(), from = %new_device, to = %interface.interface_name(), "guest device renamed");
        }
        true
    }

    async fn rename_guest_device(&self, from: &str, to: &str) -> bool {
        let down = self
            .namespace
            .exec(&["ip", "link", "set", "dev", from, "down"])
            .await;
        let rename = self
            .namespace
            .exec(&["ip", "link", "set", "dev", from, "name", to])
            .await;
        let up = self
            .namespace
            .exec(&["ip", "link", "set", "dev", to, "up"])
            .await;
        down.success && rename.success && up.success
    }

    pub async fn remove_interface(
        &self,
        emulator: &NetworkEmulator,
        interface: &NetworkInterface,
    ) -> bool {
        let host = self.additional_namespace(emulator);
        let mac = self.attached_macs.lock().remove(interface.entity_id());
        let detached = match mac {
            Some(mac) => {
                host.exec(&["virsh", "detach-interface", "--mac", &mac, &self.domain])
                    .await
                    .success
            }
            None => {
                warn!(vm = %self.node.entity_id(), interface = %interface.entity_id(), "no attached MAC recorded, skipping detach");
                true
            }
        };
        let deleted = host
            .exec(&["ip", "link", "delete", interface.interface_name()])
            .await
            .success;
        detached && deleted
    }

    /// Entity-level bring-up via the guest agent.
    pub async fn start(&self, _emulator: &NetworkEmulator) -> bool {
        if let Some(gateway) = self.node.config().default_route {
            let gateway = gateway.to_string();
            let out = self
                .namespace
                .exec(&["ip", "route", "replace", "default", "via", &gateway])
                .await;
            if !out.success {
                warn!(vm = %self.node.entity_id(), "could not set guest default route: {}", out.output());
                return false;
            }
        }
        true
    }
}

/// Rewrite the fifth MAC octet to `F<low nibble>` for guest-side attachment.
fn rewrite_attach_mac(mac: &str) -> String {
    let mut parts: Vec<String> = mac.split(':').map(str::to_string).collect();
    if parts.len() == 6 && parts[4].len() == 2 {
        parts[4] = format!("F{}", &parts[4][1..]);
    }
    parts.join(":")
}
