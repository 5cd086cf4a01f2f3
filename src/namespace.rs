//! Network namespace management
//!
//! A [`Namespace`] is a thin handle to one isolated network stack using the
//! `/run/netns/<name>` convention. Besides plain network namespaces, two
//! backends exist for entities that do not own a namespace outright: Docker
//! containers (commands run via `docker exec`, the namespace itself is
//! adopted from the container PID) and libvirt domains (commands run through
//! the QEMU guest agent, no network namespace at all).
//!
//! Command execution never fails with an error for a failing child process:
//! every command returns an [`ExecOutcome`] carrying a success flag and the
//! merged output lines. Spawn failures of the emulator's own machinery are
//! folded into the same shape.

use std::fs::File;
use std::io::{Error, ErrorKind, Result};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use nix::mount::{mount, MsFlags};
use nix::sched::{setns, CloneFlags};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

const NETNS_RUN_DIR: &str = "/run/netns";
const NETNS_ETC_DIR: &str = "/etc/netns";

/// Result of a command executed inside a namespace.
///
/// `lines` holds stdout and stderr merged, split into lines.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub success: bool,
    pub lines: Vec<String>,
}

impl ExecOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            lines: vec![message.into()],
        }
    }

    /// All output joined with newlines, mostly for logging.
    pub fn output(&self) -> String {
        self.lines.join("\n")
    }
}

#[derive(Debug, Clone)]
enum Backend {
    /// A plain network namespace addressable by name.
    Network,
    /// Namespace-like view of a running Docker container.
    Docker { container: String },
    /// A libvirt domain reachable through the QEMU guest agent.
    VirtualMachine { domain: String },
}

/// Handle to one network namespace (or namespace-like backend).
#[derive(Debug, Clone)]
pub struct Namespace {
    name: String,
    backend: Backend,
}

impl Namespace {
    /// Handle for a plain network namespace with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: Backend::Network,
        }
    }

    /// Handle backed by a running Docker container.
    pub fn for_container(name: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: Backend::Docker {
                container: container.into(),
            },
        }
    }

    /// Handle backed by a libvirt domain's guest agent.
    pub fn for_domain(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: Backend::VirtualMachine {
                domain: domain.into(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether low-level `ip`/`tc` commands are valid in this namespace.
    ///
    /// False for VM-backed namespaces, where commands travel through the
    /// guest agent and the host-side control namespace must be used for
    /// device manipulation instead.
    pub fn is_network_namespace(&self) -> bool {
        !matches!(self.backend, Backend::VirtualMachine { .. })
    }

    fn run_path(&self) -> PathBuf {
        PathBuf::from(NETNS_RUN_DIR).join(&self.name)
    }

    fn etc_path(&self) -> PathBuf {
        PathBuf::from(NETNS_ETC_DIR).join(&self.name)
    }

    /// Create the namespace. Idempotent: an already existing namespace is
    /// treated as success.
    pub async fn create(&self) -> bool {
        match &self.backend {
            Backend::Network => {
                let out = run("ip", &["netns", "add", &self.name]).await;
                if !out.success && !out.output().contains("File exists") {
                    warn!(namespace = %self.name, "could not create namespace: {}", out.output());
                    return false;
                }
                // Propagate the host resolver configuration; iproute2 bind
                // mounts /etc/netns/<name>/* over /etc/* inside the namespace.
                if let Err(e) = std::fs::create_dir_all(self.etc_path()) {
                    debug!(namespace = %self.name, "no per-namespace /etc: {e}");
                } else if let Err(e) =
                    std::fs::copy("/etc/resolv.conf", self.etc_path().join("resolv.conf"))
                {
                    debug!(namespace = %self.name, "could not copy resolv.conf: {e}");
                }
                true
            }
            Backend::Docker { .. } => {
                // Containers are created by their node wrapper, never here.
                false
            }
            Backend::VirtualMachine { domain } => {
                run("virsh", &["start", domain]).await.success
            }
        }
    }

    /// Whether the namespace currently exists.
    pub async fn exists(&self) -> bool {
        match &self.backend {
            Backend::Network => self.run_path().exists(),
            Backend::Docker { container } => {
                let out = run(
                    "docker",
                    &["inspect", "-f", "{{.State.Running}}", container],
                )
                .await;
                out.success && out.output().trim() == "true"
            }
            Backend::VirtualMachine { .. } => true,
        }
    }

    /// Remove the namespace. Succeeds if it was already absent.
    pub async fn clean(&self) -> bool {
        match &self.backend {
            Backend::Network => {
                let out = run("ip", &["netns", "delete", &self.name]).await;
                let _ = std::fs::remove_dir_all(self.etc_path());
                if out.success || !self.run_path().exists() {
                    return true;
                }
                // Lazy unmount first, then remove the mount point directly.
                let _ = nix::mount::umount2(&self.run_path(), nix::mount::MntFlags::MNT_DETACH);
                std::fs::remove_file(self.run_path()).is_ok()
            }
            Backend::Docker { container } => {
                if self.exists().await {
                    return run("docker", &["kill", container]).await.success;
                }
                true
            }
            Backend::VirtualMachine { domain } => {
                run("virsh", &["shutdown", domain]).await.success
            }
        }
    }

    /// Execute a command inside the namespace.
    pub async fn exec(&self, command: &[&str]) -> ExecOutcome {
        match &self.backend {
            Backend::Network => {
                let mut args = vec!["netns", "exec", &self.name];
                args.extend_from_slice(command);
                run("ip", &args).await
            }
            Backend::Docker { container } => {
                let mut args = vec!["exec", container.as_str()];
                args.extend_from_slice(command);
                run("docker", &args).await
            }
            Backend::VirtualMachine { domain } => guest_exec(domain, command).await,
        }
    }

    /// Spawn a long-running process inside the namespace. The caller owns
    /// the returned child handle.
    pub fn popen(&self, command: &[&str]) -> Result<Child> {
        match &self.backend {
            Backend::Network => {
                let mut cmd = Command::new("ip");
                cmd.args(["netns", "exec", &self.name]).args(command);
                cmd.spawn()
            }
            Backend::Docker { container } => {
                let mut cmd = Command::new("docker");
                cmd.args(["exec", container]).args(command);
                cmd.spawn()
            }
            Backend::VirtualMachine { domain } => {
                let request = serde_json::json!({
                    "execute": "guest-exec",
                    "arguments": {
                        "path": command.first().copied().unwrap_or(""),
                        "arg": &command[command.len().min(1)..],
                        "capture-output": false,
                    }
                });
                let mut cmd = Command::new("virsh");
                cmd.args([
                    "-c",
                    "qemu:///system",
                    "qemu-agent-command",
                    domain,
                    &request.to_string(),
                ]);
                cmd.spawn()
            }
        }
    }

    /// Bring the loopback interface up.
    pub async fn loopback_up(&self) -> bool {
        self.exec(&["ip", "link", "set", "dev", "lo", "up"])
            .await
            .success
    }

    /// Write resolver configuration for this namespace.
    pub async fn set_name_servers(&self, servers: &[&str], search_domain: Option<&str>) -> bool {
        let mut lines: Vec<String> = servers.iter().map(|s| format!("nameserver {s}")).collect();
        if let Some(domain) = search_domain {
            lines.push(format!("search {domain}"));
        }
        let content = lines.join("\n");
        match &self.backend {
            Backend::Network => {
                if std::fs::create_dir_all(self.etc_path()).is_err() {
                    return false;
                }
                std::fs::write(self.etc_path().join("resolv.conf"), content).is_ok()
            }
            _ => {
                self.exec(&[
                    "sh",
                    "-c",
                    &format!("printf '%s' '{content}' > /etc/resolv.conf"),
                ])
                .await
                .success
            }
        }
    }

    /// Move the calling OS thread into this namespace for all subsequent
    /// network operations. The thread is dedicated to this namespace for its
    /// remaining lifetime; there is no way back short of `enter()`'s guard.
    pub fn thread_attach(&self) -> Result<()> {
        if !self.is_network_namespace() {
            return Err(Error::new(
                ErrorKind::Unsupported,
                "thread_attach is not available for VM-backed namespaces",
            ));
        }
        let file = open_netns_file(&self.name)?;
        setns(&file, CloneFlags::CLONE_NEWNET).map_err(|e| Error::other(e.to_string()))
    }

    /// Enter the namespace on the current thread; the guard restores the
    /// original namespace on drop.
    pub fn enter(&self) -> Result<NamespaceGuard> {
        if !self.is_network_namespace() {
            return Err(Error::new(
                ErrorKind::Unsupported,
                "enter is not available for VM-backed namespaces",
            ));
        }
        let original = File::open("/proc/self/ns/net")?;
        let target = open_netns_file(&self.name)?;
        setns(&target, CloneFlags::CLONE_NEWNET).map_err(|e| Error::other(e.to_string()))?;
        Ok(NamespaceGuard {
            original_ns: original.into(),
        })
    }

    /// Adopt an existing namespace from a running process (e.g. a container
    /// or the emulator's own process) instead of creating a fresh one.
    pub async fn from_pid(&self, pid: u32) -> bool {
        if !matches!(self.backend, Backend::Network) {
            return false;
        }
        if self.exists().await {
            warn!(namespace = %self.name, "namespace already exists");
            return false;
        }
        // iproute2 sets up /run/netns as a shared mount on first use; create
        // and remove a scratch namespace to trigger that if needed.
        if !PathBuf::from(NETNS_RUN_DIR).exists() {
            let scratch = Namespace::new(format!("{}-scratch", self.name));
            scratch.create().await;
            scratch.clean().await;
        }
        if let Err(e) = std::fs::File::create(self.run_path()) {
            warn!(namespace = %self.name, "could not create namespace file: {e}");
            return false;
        }
        let source = PathBuf::from(format!("/proc/{pid}/ns/net"));
        match mount(
            Some(&source),
            &self.run_path(),
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        ) {
            Ok(()) => true,
            Err(e) => {
                warn!(namespace = %self.name, "could not bind mount {}: {e}", source.display());
                let _ = std::fs::remove_file(self.run_path());
                false
            }
        }
    }

    /// Poll until the backend is reachable, bounded by `timeout`.
    ///
    /// For VM-backed namespaces this pings the guest agent; other backends
    /// just check for existence.
    pub async fn wait_until_available(&self, timeout: Duration, poll_interval: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let reachable = match &self.backend {
                Backend::VirtualMachine { domain } => {
                    agent_command(domain, &serde_json::json!({"execute": "guest-ping"}))
                        .await
                        .is_some()
                }
                _ => self.exists().await,
            };
            if reachable {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Probe the guest OS id via the guest agent (VM-backed only).
    pub async fn guest_os(&self) -> Option<String> {
        let Backend::VirtualMachine { domain } = &self.backend else {
            return None;
        };
        let data =
            agent_command(domain, &serde_json::json!({"execute": "guest-get-osinfo"})).await?;
        let os = data.get("return")?.get("id")?.as_str()?.to_string();
        Some(match os.as_str() {
            "mswindows" => "windows".to_string(),
            "ubuntu" | "arch" | "debian" | "fedora" => "linux".to_string(),
            _ => os,
        })
    }
}

impl PartialEq for Namespace {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

fn open_netns_file(name: &str) -> Result<File> {
    let candidates = [
        format!("/run/netns/{name}"),
        format!("/var/run/netns/{name}"),
    ];
    let mut last: Option<Error> = None;
    for path in candidates {
        match File::open(&path) {
            Ok(f) => return Ok(f),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| Error::new(ErrorKind::NotFound, "netns path not found")))
}

/// RAII guard for a thread temporarily inside a namespace.
pub struct NamespaceGuard {
    original_ns: OwnedFd,
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.original_ns, CloneFlags::CLONE_NEWNET) {
            warn!("failed to restore original namespace: {e}");
        }
    }
}

/// Run a host command, merging stdout and stderr into output lines.
pub(crate) async fn run(program: &str, args: &[&str]) -> ExecOutcome {
    debug!("running: {program} {}", args.join(" "));
    match Command::new(program).args(args).output().await {
        Ok(out) => {
            let mut lines: Vec<String> = String::from_utf8_lossy(&out.stdout)
                .lines()
                .map(str::to_string)
                .collect();
            lines.extend(
                String::from_utf8_lossy(&out.stderr)
                    .lines()
                    .map(str::to_string),
            );
            ExecOutcome {
                success: out.status.success(),
                lines,
            }
        }
        Err(e) => ExecOutcome::failure(format!("{program}: {e}")),
    }
}

async fn agent_command(domain: &str, request: &serde_json::Value) -> Option<serde_json::Value> {
    let payload = request.to_string();
    let out = run(
        "virsh",
        &["-c", "qemu:///system", "qemu-agent-command", domain, &payload],
    )
    .await;
    if !out.success {
        return None;
    }
    serde_json::from_str(&out.output()).ok()
}

/// Execute a command inside a VM through `guest-exec` and poll
/// `guest-exec-status` until the process exits.
async fn guest_exec(domain: &str, command: &[&str]) -> ExecOutcome {
    let Some((path, args)) = command.split_first() else {
        return ExecOutcome::failure("empty command");
    };
    let request = serde_json::json!({
        "execute": "guest-exec",
        "arguments": { "path": path, "arg": args, "capture-output": true }
    });
    let Some(response) = agent_command(domain, &request).await else {
        return ExecOutcome::failure(format!("guest agent for {domain} unreachable"));
    };
    let Some(pid) = response
        .get("return")
        .and_then(|r| r.get("pid"))
        .and_then(|p| p.as_i64())
    else {
        return ExecOutcome::failure("guest-exec returned no pid");
    };

    let status_request = serde_json::json!({
        "execute": "guest-exec-status",
        "arguments": { "pid": pid }
    });
    // Bounded poll; commands routed through the agent are expected to be
    // short-lived configuration steps.
    for _ in 0..60 {
        if let Some(status) = agent_command(domain, &status_request).await {
            let result = &status["return"];
            if result["exited"].as_bool() == Some(true) {
                let mut lines = decode_agent_output(result.get("out-data"));
                lines.extend(decode_agent_output(result.get("err-data")));
                return ExecOutcome {
                    success: result["exitcode"].as_i64() == Some(0),
                    lines,
                };
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    ExecOutcome::failure(format!("guest-exec on {domain} did not finish"))
}

fn decode_agent_output(data: Option<&serde_json::Value>) -> Vec<String> {
    let Some(encoded) = data.and_then(|d| d.as_str()) else {
        return Vec::new();
    };
    match base64::engine::general_purpose::STANDARD.decode(encoded) {
        Ok(bytes) => String::from_utf8_lossy(&bytes)
            .lines()
            .map(str::to_string)
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_is_reported() {
        assert!(Namespace::new("w_n1").is_network_namespace());
        assert!(Namespace::for_container("w_h1", "emu.h1").is_network_namespace());
        assert!(!Namespace::for_domain("w_v1", "vm1").is_network_namespace());
    }

    #[test]
    fn namespaces_compare_by_name() {
        assert_eq!(Namespace::new("w_main"), Namespace::new("w_main"));
        assert_ne!(Namespace::new("w_main"), Namespace::new("w_n1"));
    }

    #[test]
    fn exec_outcome_output_joins_lines() {
        let outcome = ExecOutcome {
            success: true,
            lines: vec!["a".into(), "b".into()],
        };
        assert_eq!(outcome.output(), "a\nb");
    }

    #[tokio::test]
    #[cfg(feature = "sudo-tests")]
    async fn create_exec_clean_roundtrip() {
        let ns = Namespace::new("emu-test-ns");
        assert!(ns.create().await);
        assert!(ns.exists().await);
        let out = ns.exec(&["ip", "link", "show", "lo"]).await;
        assert!(out.success);
        assert!(ns.clean().await);
        assert!(!ns.exists().await);
        // clean is idempotent
        assert!(ns.clean().await);
    }
}
