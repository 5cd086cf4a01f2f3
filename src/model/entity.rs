//! Entity identity
//!
//! Every entity carries a stable `entity_id` derived once at construction
//! from a type-specific single-letter prefix and the raw id from the
//! topology. Network tools reject purely numeric device and namespace names,
//! so a raw id starting with a digit is always prefixed. Ids that already
//! start with a letter are kept as-is, which makes prefixing idempotent.

/// Entity categories, each with its id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Host,
    Router,
    Nat,
    Switch,
    VirtualMachine,
    Interface,
    Link,
}

impl EntityKind {
    pub fn prefix(&self) -> char {
        match self {
            EntityKind::Host => 'h',
            EntityKind::Router => 'r',
            EntityKind::Nat => 'n',
            EntityKind::Switch => 's',
            EntityKind::VirtualMachine => 'v',
            EntityKind::Interface => 'i',
            EntityKind::Link => 'l',
        }
    }
}

/// Derive an entity id from a raw topology id.
pub fn prefix_id(kind: EntityKind, raw: &str) -> String {
    match raw.chars().next() {
        Some(c) if c.is_ascii_digit() => format!("{}{}", kind.prefix(), raw),
        Some(_) => raw.to_string(),
        None => kind.prefix().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_are_prefixed() {
        assert_eq!(prefix_id(EntityKind::Host, "0"), "h0");
        assert_eq!(prefix_id(EntityKind::Switch, "12"), "s12");
        assert_eq!(prefix_id(EntityKind::Link, "3"), "l3");
    }

    #[test]
    fn named_ids_are_untouched() {
        assert_eq!(prefix_id(EntityKind::Host, "gateway"), "gateway");
        assert_eq!(prefix_id(EntityKind::Interface, "eth0"), "eth0");
    }

    #[test]
    fn prefixing_is_idempotent() {
        let once = prefix_id(EntityKind::Host, "0");
        let twice = prefix_id(EntityKind::Host, &once);
        assert_eq!(once, twice);
    }
}
