//! Host resource tuning
//!
//! Emulating a few hundred nodes exhausts kernel defaults quickly: ARP
//! caches overflow during scans, conntrack tables fill up, and every
//! namespace holds file descriptors. All tuning is best-effort; each step
//! logs its failure and the next one still runs. Nothing here is fatal.

use nix::sys::resource::{getrlimit, setrlimit, Resource};
use tracing::{info, warn};

use crate::namespace::Namespace;

const SYSCTLS: &[(&str, &str)] = &[
    ("net.ipv4.neigh.default.gc_thresh1", "16384"),
    ("net.ipv4.neigh.default.gc_thresh2", "32768"),
    ("net.ipv4.neigh.default.gc_thresh3", "65536"),
    ("net.ipv4.ip_local_reserved_ports", "2404,51000-51010"),
    ("net.netfilter.nf_conntrack_max", "524288"),
    ("net.ipv4.igmp_max_memberships", "2048"),
    ("fs.inotify.max_user_instances", "1024"),
    ("net.core.wmem_max", "16777216"),
    ("net.core.rmem_max", "16777216"),
    ("net.ipv4.xfrm4_gc_thresh", "262144"),
];

/// Raise the process file-descriptor limit to its hard limit.
fn raise_file_descriptor_limit() {
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, hard)) => match setrlimit(Resource::RLIMIT_NOFILE, hard, hard) {
            Ok(()) => info!("raised open file limit from {soft} to {hard}"),
            Err(e) => warn!("could not raise open file limit: {e}"),
        },
        Err(e) => warn!("could not query open file limit: {e}"),
    }
}

/// Apply all host tuning steps through the main namespace.
pub async fn adjust_host_limits(main_namespace: &Namespace) {
    raise_file_descriptor_limit();
    for (key, value) in SYSCTLS {
        let setting = format!("{key}={value}");
        let out = main_namespace.exec(&["sysctl", "-w", &setting]).await;
        if !out.success {
            warn!("could not apply sysctl {setting}: {}", out.output());
        }
    }
}
