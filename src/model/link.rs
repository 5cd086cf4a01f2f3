//! Network links
//!
//! A link associates exactly two interfaces and owns the mutable
//! [`LinkModelCell`] describing its traffic properties. The association is
//! symmetric; the link references its interfaces, never the other way
//! around (interfaces only keep a lookup back-reference).

use std::sync::atomic::{AtomicBool, Ordering};

use super::entity::{prefix_id, EntityKind};
use super::link_model::{LinkModel, LinkModelCell};

pub struct NetworkLink {
    entity_id: String,
    interface_a: String,
    interface_b: String,
    model: LinkModelCell,
    up: AtomicBool,
}

impl NetworkLink {
    pub fn new(raw_id: &str, interface_a: &str, interface_b: &str) -> Self {
        Self::with_model(raw_id, interface_a, interface_b, LinkModel::default())
    }

    pub fn with_model(
        raw_id: &str,
        interface_a: &str,
        interface_b: &str,
        model: LinkModel,
    ) -> Self {
        Self {
            entity_id: prefix_id(EntityKind::Link, raw_id),
            interface_a: interface_a.to_string(),
            interface_b: interface_b.to_string(),
            model: LinkModelCell::new(model),
            up: AtomicBool::new(false),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn interface_a(&self) -> &str {
        &self.interface_a
    }

    pub fn interface_b(&self) -> &str {
        &self.interface_b
    }

    /// The interface opposite to `interface_id`; defaults to `interface_a`
    /// when `interface_id` matches neither side.
    pub fn other_interface(&self, interface_id: &str) -> &str {
        if interface_id == self.interface_a {
            &self.interface_b
        } else {
            &self.interface_a
        }
    }

    pub fn model(&self) -> &LinkModelCell {
        &self.model
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    pub(crate) fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

impl PartialEq for NetworkLink {
    fn eq(&self, other: &Self) -> bool {
        self.entity_id == other.entity_id
    }
}

impl std::fmt::Debug for NetworkLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkLink")
            .field("entity_id", &self.entity_id)
            .field("a", &self.interface_a)
            .field("b", &self.interface_b)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_interface_is_symmetric() {
        let link = NetworkLink::new("1", "i1", "i2");
        assert_eq!(link.entity_id(), "l1");
        assert_eq!(link.other_interface("i1"), "i2");
        assert_eq!(link.other_interface("i2"), "i1");
        // Unknown interfaces default to side A
        assert_eq!(link.other_interface("i99"), "i1");
    }
}
