//! Logical entity data model
//!
//! Nodes, interfaces and links as declared by the topology loader. The model
//! is backend-agnostic; binding to OS resources happens in [`crate::wrapper`].

pub mod entity;
pub mod interface;
pub mod link;
pub mod link_model;
pub mod node;
pub mod service;

pub use entity::{prefix_id, EntityKind};
pub use interface::{InterfaceKind, NetworkInterface};
pub use link::NetworkLink;
pub use link_model::{LinkModel, LinkModelCell};
pub use node::{DockerConfig, NetworkNode, NodeConfig, NodeKind, SwitchConfig, VmConfig};
pub use service::{NodeService, ProcessService};
