//! Docker node backend
//!
//! The node is a container with a deterministic name derived from its system
//! id. The container owns no named namespace at creation time; the namespace
//! is adopted lazily from the container's PID once it is running. Asking for
//! the namespace before that point is a hard error.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use crate::emulator::NetworkEmulator;
use crate::model::node::{DockerConfig, NetworkNode};
use crate::namespace::{run, ExecOutcome, Namespace};
use crate::wrapper::parse_device_names;
use crate::EmulatorError;

/// Boundary for `docker` CLI invocations, injectable in tests.
pub(crate) type DockerCommand =
    Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, ExecOutcome> + Send + Sync>;

fn host_docker() -> DockerCommand {
    Arc::new(|args: Vec<String>| {
        let fut: BoxFuture<'static, ExecOutcome> = Box::pin(async move {
            let refs: Vec<&str> = args.iter().map(String::as_str).collect();
            run("docker", &refs).await
        });
        fut
    })
}

pub struct DockerWrapper {
    node: Arc<NetworkNode>,
    config: DockerConfig,
    container_name: String,
    namespace: Namespace,
    command: DockerCommand,
}

impl DockerWrapper {
    pub fn new(node: Arc<NetworkNode>, config: DockerConfig, namespace_prefix: &str) -> Self {
        Self::with_command(node, config, namespace_prefix, host_docker())
    }

    pub(crate) fn with_command(
        node: Arc<NetworkNode>,
        config: DockerConfig,
        namespace_prefix: &str,
        command: DockerCommand,
    ) -> Self {
        let container_name = format!("emu.{}", node.system_id());
        let namespace = Namespace::new(format!("{namespace_prefix}_{}", node.entity_id()));
        Self {
            node,
            config,
            container_name,
            namespace,
            command,
        }
    }

    async fn docker(&self, args: &[&str]) -> ExecOutcome {
        (self.command)(args.iter().map(|arg| arg.to_string()).collect()).await
    }

    pub fn node(&self) -> &Arc<NetworkNode> {
        &self.node
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub async fn is_container_running(&self) -> bool {
        let out = self
            .docker(&["inspect", "-f", "{{.State.Running}}", &self.container_name])
            .await;
        out.success && out.output().trim() == "true"
    }

    async fn container_exists(&self) -> bool {
        self.docker(&["inspect", &self.container_name]).await.success
    }

    async fn container_pid(&self) -> Option<u32> {
        let out = self
            .docker(&["inspect", "-f", "{{.State.Pid}}", &self.container_name])
            .await;
        if !out.success {
            return None;
        }
        out.output().trim().parse().ok().filter(|pid| *pid != 0)
    }

    async fn image_installed(&self) -> bool {
        self.docker(&["image", "inspect", &self.config.full_image()])
            .await
            .success
    }

    /// The container's namespace, adopted from its PID on first access.
    pub async fn namespace(&self) -> Result<Namespace, EmulatorError> {
        if self.namespace.exists().await {
            return Ok(self.namespace.clone());
        }
        if !self.is_container_running().await {
            return Err(EmulatorError::Namespace(format!(
                "container {} is not running",
                self.container_name
            )));
        }
        let pid = self.container_pid().await.ok_or_else(|| {
            EmulatorError::Namespace(format!("no PID for container {}", self.container_name))
        })?;
        // Concurrent adoption is benign: from_pid refuses when the namespace
        // file already exists, and the existing one is equivalent.
        if !self.namespace.from_pid(pid).await && !self.namespace.exists().await {
            return Err(EmulatorError::Namespace(format!(
                "could not adopt namespace of container {}",
                self.container_name
            )));
        }
        Ok(self.namespace.clone())
    }

    pub async fn create(&self) -> bool {
        if self.config.image.is_empty() {
            error!(node = %self.node.entity_id(), "no docker image specified");
            return false;
        }
        let image = self.config.full_image();
        if !self.image_installed().await {
            let out = self.docker(&["pull", &image]).await;
            if !out.success {
                error!(node = %self.node.entity_id(), "could not pull image {image}: {}", out.output());
                return false;
            }
            // An implicit pull deviates from the declared host state.
            warn!(node = %self.node.entity_id(), "image {image} was not installed, pulled it from the registry");
        }

        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            self.container_name.clone(),
            "--network".into(),
            "none".into(),
        ];
        for capability in &self.config.capabilities {
            args.push("--cap-add".into());
            args.push(capability.clone());
        }
        for volume in &self.config.volumes {
            let mut mapping = format!(
                "{}:{}",
                volume.host_path.display(),
                volume.container_path.display()
            );
            if volume.read_only {
                mapping.push_str(":ro");
            }
            args.push("-v".into());
            args.push(mapping);
        }
        args.push(image.clone());
        args.extend(self.config.boot_command.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.docker(&arg_refs).await;
        if !out.success {
            error!(node = %self.node.entity_id(), "could not create container {}: {}", self.container_name, out.output());
            return false;
        }
        let out = self.docker(&["start", &self.container_name]).await;
        if !out.success {
            error!(node = %self.node.entity_id(), "could not start container {}: {}", self.container_name, out.output());
            return false;
        }
        debug!(node = %self.node.entity_id(), container = %self.container_name, "container running");
        true
    }

    pub async fn clean(&self) {
        if self.container_exists().await {
            let out = self.docker(&["rm", "-f", &self.container_name]).await;
            if !out.success {
                warn!(container = %self.container_name, "could not remove container: {}", out.output());
            }
        }
        if self.namespace.exists().await {
            self.namespace.clean().await;
        }
    }

    /// Entity-level bring-up: adopt the namespace and align its devices with
    /// the declared model. Container runtimes add their own interfaces
    /// (bridge legs, service meshes); anything not declared is removed.
    pub async fn start(&self, emulator: &NetworkEmulator) -> bool {
        let namespace = match self.namespace().await {
            Ok(ns) => ns,
            Err(e) => {
                error!(node = %self.node.entity_id(), "container namespace unavailable: {e}");
                return false;
            }
        };
        let declared: Vec<String> = self
            .node
            .interface_ids()
            .iter()
            .filter_map(|id| emulator.find_interface(id))
            .map(|iface| iface.interface_name().to_string())
            .collect();
        let listing = namespace.exec(&["ip", "-o", "link", "show"]).await;
        if listing.success {
            for device in parse_device_names(&listing.lines) {
                if device == "lo" || declared.iter().any(|name| *name == device) {
                    continue;
                }
                debug!(node = %self.node.entity_id(), device = %device, "removing undeclared container interface");
                namespace
                    .exec(&["ip", "link", "delete", "dev", &device])
                    .await;
            }
        }
        namespace.loopback_up().await;
        if let Some(gateway) = self.node.config().default_route {
            let gateway = gateway.to_string();
            let out = namespace
                .exec(&["ip", "route", "replace", "default", "via", &gateway])
                .await;
            if !out.success {
                warn!(node = %self.node.entity_id(), "could not set default route: {}", out.output());
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::node::NodeKind;
    use parking_lot::Mutex;

    fn scripted_docker(
        log: Arc<Mutex<Vec<Vec<String>>>>,
        respond: impl Fn(&[String]) -> ExecOutcome + Send + Sync + 'static,
    ) -> DockerCommand {
        Arc::new(move |args: Vec<String>| {
            log.lock().push(args.clone());
            let outcome = respond(&args);
            let fut: BoxFuture<'static, ExecOutcome> = Box::pin(async move { outcome });
            fut
        })
    }

    fn wrapper_with(command: DockerCommand) -> DockerWrapper {
        let config = DockerConfig {
            image: "busybox".to_string(),
            ..DockerConfig::default()
        };
        let node = Arc::new(NetworkNode::new("1", NodeKind::Docker(config.clone())));
        DockerWrapper::with_command(node, config, "w", command)
    }

    #[test]
    fn container_names_are_deterministic() {
        let node = Arc::new(NetworkNode::new("1", NodeKind::Docker(DockerConfig::default())));
        let wrapper = DockerWrapper::new(node, DockerConfig::default(), "w");
        assert_eq!(wrapper.container_name(), "emu.h1");
    }

    #[tokio::test]
    async fn unreachable_daemon_fails_create_after_one_pull_attempt() {
        let log: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let command = scripted_docker(log.clone(), |_| {
            ExecOutcome::failure("Cannot connect to the Docker daemon")
        });
        let wrapper = wrapper_with(command);

        assert!(!wrapper.create().await);

        let log = log.lock();
        let pulls: Vec<_> = log.iter().filter(|args| args[0] == "pull").collect();
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0], &vec!["pull".to_string(), "busybox:latest".to_string()]);
        // The failed pull must abort before any container is created
        assert!(!log.iter().any(|args| args[0] == "create"));
    }

    #[tokio::test]
    async fn missing_image_is_pulled_before_container_creation() {
        let log: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let command = scripted_docker(log.clone(), |args| {
            // The image is not installed; everything else succeeds.
            if args[0] == "image" {
                return ExecOutcome::failure("No such image");
            }
            ExecOutcome {
                success: true,
                lines: Vec::new(),
            }
        });
        let wrapper = wrapper_with(command);

        assert!(wrapper.create().await);

        let verbs: Vec<String> = log.lock().iter().map(|args| args[0].clone()).collect();
        assert_eq!(verbs, vec!["image", "pull", "create", "start"]);
    }

    #[tokio::test]
    async fn installed_image_is_never_pulled() {
        let log: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let command = scripted_docker(log.clone(), |_| ExecOutcome {
            success: true,
            lines: Vec::new(),
        });
        let wrapper = wrapper_with(command);

        assert!(wrapper.create().await);
        assert!(!log.lock().iter().any(|args| args[0] == "pull"));
    }
}
