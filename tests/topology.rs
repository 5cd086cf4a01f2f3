//! End-to-end topology tests
//!
//! Everything here creates real namespaces, veth pairs and OVS bridges and
//! therefore needs CAP_NET_ADMIN (and OVS installed); the privileged tests
//! are gated behind the `sudo-tests` feature:
//!
//!   cargo test --features sudo-tests -- --test-threads=1

use netns_emulator::{
    InterfaceKind, LinkModel, NetworkEmulator, NetworkInterface, NetworkLink, NetworkNode,
    NodeKind,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("netns_emulator=debug")
        .try_init();
}

#[cfg(feature = "sudo-tests")]
mod sudo {
    use super::*;
    use anyhow::Result;
    use netns_emulator::model::node::SwitchConfig;
    use netns_emulator::EmulatorConfig;
    use std::sync::Arc;

    /// h1 and h2, each with one interface, both linked to switch s1.
    async fn build_switched_pair(
        prefix: &str,
    ) -> Result<(Arc<NetworkEmulator>, [String; 2])> {
        let emulator = NetworkEmulator::with_config(
            EmulatorConfig {
                namespace_prefix: prefix.to_string(),
                ..Default::default()
            },
            |_| {},
        );
        emulator.add_node(NetworkNode::new("h1", NodeKind::Host)).await?;
        emulator.add_node(NetworkNode::new("h2", NodeKind::Host)).await?;
        emulator
            .add_node(NetworkNode::new("s1", NodeKind::Switch(SwitchConfig::default())))
            .await?;
        let h1_i1 = emulator
            .add_interface("h1", NetworkInterface::new("1", "h1", InterfaceKind::Virtual))
            .await?;
        let s1_p1 = emulator
            .add_interface("s1", NetworkInterface::new("2", "s1", InterfaceKind::Virtual))
            .await?;
        let h2_i1 = emulator
            .add_interface("h2", NetworkInterface::new("3", "h2", InterfaceKind::Virtual))
            .await?;
        let s1_p2 = emulator
            .add_interface("s1", NetworkInterface::new("4", "s1", InterfaceKind::Virtual))
            .await?;
        let link_a = emulator
            .add_link(NetworkLink::new("1", h1_i1.entity_id(), s1_p1.entity_id()))
            .await?;
        emulator
            .add_link(NetworkLink::new("2", h2_i1.entity_id(), s1_p2.entity_id()))
            .await?;
        Ok((
            emulator,
            [link_a.entity_id().to_string(), h1_i1.entity_id().to_string()],
        ))
    }

    #[tokio::test]
    async fn switched_pair_comes_up_and_tears_down() -> Result<()> {
        init_logging();
        let (emulator, _) = build_switched_pair("itblu").await?;
        emulator.start().await?;

        // Both hosts have their loopback and veth end up
        for host in ["h1", "h2"] {
            let ns = emulator.namespace_of(host).await?;
            let out = ns.exec(&["ip", "link", "show", "dev", "lo"]).await;
            assert!(out.success);
            assert!(out.output().contains("UP"));
        }
        // The bridge lists both ports
        let main = emulator.main_namespace();
        let out = main.exec(&["ovs-vsctl", "list-ports", "s1"]).await;
        assert!(out.success, "{}", out.output());
        assert!(out.output().contains("s1-i2"));
        assert!(out.output().contains("s1-i4"));

        emulator.stop().await;
        assert!(!emulator.namespace_of("h1").await?.exists().await);
        Ok(())
    }

    #[tokio::test]
    async fn link_model_shapes_the_device() -> Result<()> {
        init_logging();
        let (emulator, [link_id, h1_iface]) = build_switched_pair("itsha").await?;
        let link = emulator.link(&link_id)?;
        link.model().set_bandwidth_bits_per_second(Some(10_000_000));
        link.model().set_delay_ms(Some(5));

        emulator.start().await?;

        let iface = emulator.interface(&h1_iface)?;
        let ns = emulator.namespace_of("h1").await?;
        let out = ns
            .exec(&["tc", "qdisc", "show", "dev", iface.interface_name()])
            .await;
        assert!(out.success);
        assert!(out.output().contains("htb"));
        assert!(out.output().contains("netem"));
        let out = ns
            .exec(&["tc", "class", "show", "dev", iface.interface_name()])
            .await;
        assert!(out.output().contains("10Mbit") || out.output().contains("10000Kbit"));

        emulator.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn clearing_a_property_rebuilds_the_discipline() -> Result<()> {
        init_logging();
        let (emulator, [link_id, h1_iface]) = build_switched_pair("itrst").await?;
        let link = emulator.link(&link_id)?;
        link.model().set_bandwidth_bits_per_second(Some(10_000_000));
        link.model().set_delay_ms(Some(5));
        emulator.start().await?;

        // Unset the delay while bandwidth stays: the netem child must be gone
        link.model().set_delay_ms(None);
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        let iface = emulator.interface(&h1_iface)?;
        let ns = emulator.namespace_of("h1").await?;
        let out = ns
            .exec(&["tc", "qdisc", "show", "dev", iface.interface_name()])
            .await;
        assert!(out.output().contains("htb"));
        assert!(!out.output().contains("netem"));

        emulator.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn removing_a_link_deletes_devices_and_ports() -> Result<()> {
        init_logging();
        let (emulator, [link_id, h1_iface]) = build_switched_pair("itrem").await?;
        emulator.start().await?;

        let iface_name = emulator.interface(&h1_iface)?.interface_name().to_string();
        emulator.remove_link(&link_id).await?;

        let ns = emulator.namespace_of("h1").await?;
        let out = ns.exec(&["ip", "link", "show", "dev", &iface_name]).await;
        assert!(!out.success, "device should be gone: {}", out.output());
        let out = emulator
            .main_namespace()
            .exec(&["ovs-vsctl", "list-ports", "s1"])
            .await;
        assert!(!out.output().contains("s1-i2"));

        emulator.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn link_cleanup_survives_a_removed_node() -> Result<()> {
        init_logging();
        let (emulator, [link_id, _]) = build_switched_pair("itorp").await?;
        emulator.start().await?;

        // Tear down one endpoint's node first, then the link
        emulator.remove_node("h1").await?;
        // remove_node already dropped the link with it; removing again is a miss
        assert!(emulator.find_link(&link_id).is_none());

        emulator.stop().await;
        Ok(())
    }
}

#[tokio::test]
async fn registration_works_without_privileges() {
    init_logging();
    let emulator = NetworkEmulator::new();
    emulator
        .add_node(NetworkNode::new("h1", NodeKind::Host))
        .await
        .unwrap();
    let iface = emulator
        .add_interface("h1", NetworkInterface::new("1", "h1", InterfaceKind::Virtual))
        .await
        .unwrap();
    assert_eq!(iface.interface_name(), "h1-i1");
    assert!(!emulator.is_running());
}

#[tokio::test]
async fn link_models_are_mutable_before_start() {
    init_logging();
    let emulator = NetworkEmulator::new();
    emulator
        .add_node(NetworkNode::new("h1", NodeKind::Host))
        .await
        .unwrap();
    emulator
        .add_node(NetworkNode::new("h2", NodeKind::Host))
        .await
        .unwrap();
    let a = emulator
        .add_interface("h1", NetworkInterface::new("1", "h1", InterfaceKind::Virtual))
        .await
        .unwrap();
    let b = emulator
        .add_interface("h2", NetworkInterface::new("2", "h2", InterfaceKind::Virtual))
        .await
        .unwrap();
    let link = emulator
        .add_link(NetworkLink::new("1", a.entity_id(), b.entity_id()))
        .await
        .unwrap();
    link.model().set_bandwidth_from_string("10Mbps");
    link.model().set_delay_from_timespan("5ms");
    assert_eq!(
        link.model().snapshot(),
        LinkModel {
            bandwidth_bits_per_second: Some(10_000_000),
            delay_ms: Some(5),
            ..Default::default()
        }
    );
}
