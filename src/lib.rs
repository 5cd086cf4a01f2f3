//! Network emulation engine
//!
//! This crate materializes a declared graph of hosts, switches, routers and
//! links as real OS-level constructs: Linux network namespaces, veth pairs,
//! OVS bridges, Docker containers and libvirt domains. Runtime link
//! properties (bandwidth, delay, jitter, loss) are kept in sync with the
//! logical model through `tc` (htb + netem).
//!
//! The engine is fed a populated entity graph by an external topology
//! loader. Each entity is bound to a backend-specific wrapper at
//! registration time; [`emulator::NetworkEmulator::start`] sequences bulk
//! creation (nodes, then interfaces, then links), and
//! [`emulator::NetworkEmulator::stop`] tears everything down concurrently.

pub mod emulator;
pub mod model;
pub mod namespace;
pub mod notify;
pub mod tc;
pub mod tuning;
pub mod wrapper;

// Re-export commonly used types
pub use emulator::{EmulatorConfig, NetworkEmulator};
pub use model::interface::{InterfaceKind, NetworkInterface};
pub use model::link::NetworkLink;
pub use model::link_model::{LinkModel, LinkModelCell};
pub use model::node::{NetworkNode, NodeKind};
pub use namespace::{ExecOutcome, Namespace};
pub use notify::TopologyChange;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Startup failed: {0}")]
    Startup(String),

    #[error("Namespace unavailable: {0}")]
    Namespace(String),
}
