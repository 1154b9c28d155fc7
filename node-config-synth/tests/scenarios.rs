use std::sync::Arc;

use proptest::prelude::*;

use node_config_synth::{
    ClusterConfig, CycleOutcome, SynthError, Synthesizer, Trigger,
    config::ScaleHints,
    features::{Feature, KernelCapabilities},
    identity::InterfaceObservations,
    maps::{MapFamily, MapKind},
    probe::{self, MemorySource},
    render, synthesize,
};

const NODE: &str = r#"
[kernel]
lru_maps = true
sock_ops = true
possible_cpus = 8

[interfaces.cilium_host]
index = 4
mac = "de:ad:be:ef:c0:de"
mtu = 1500
addresses = ["10.245.255.255/16", "beef::1:0:1:1:0/64"]

[interfaces.cilium_net]
index = 3
mac = "ce:72:a7:03:88:57"
mtu = 1500

[interfaces.eth0]
index = 2
mac = "ce:72:a7:03:88:56"
mtu = 1500
addresses = ["192.168.1.10/24", "beef::1:0:a00:20f:ffff/64"]

[interfaces.cilium_geneve]
index = 5
mac = "ce:72:a7:03:88:59"
mtu = 1500
"#;

fn node() -> (InterfaceObservations, KernelCapabilities) {
    probe::parse_observations(NODE).unwrap()
}

fn scenario_a() -> ClusterConfig {
    ClusterConfig::from_toml(
        r#"
enable_ipv4 = true
enable_ipv6 = false
enable_nodeport = true
nodeport_port_range = [30000, 32767]
"#,
    )
    .unwrap()
}

#[test]
fn scenario_a_ipv4_nodeport() {
    let (observations, caps) = node();
    let candidate = synthesize(&scenario_a(), &observations, &caps, 1).unwrap();
    let descriptor = candidate.validated.descriptor();

    assert!(descriptor.maps.iter().all(|m| m.family != MapFamily::V6));
    for kind in [
        MapKind::ConntrackTcp,
        MapKind::ConntrackAny,
        MapKind::Services,
        MapKind::Backends,
        MapKind::ReverseNat,
    ] {
        assert!(
            descriptor
                .maps
                .iter()
                .any(|m| m.kind == kind && m.family == MapFamily::V4),
            "missing IPv4 {kind}"
        );
    }
    let ports = descriptor.ports.unwrap();
    assert_eq!((ports.nodeport.min, ports.nodeport.max), (30000, 32767));
    assert_eq!((ports.nat.min, ports.nat.max), (32768, 43835));
}

#[test]
fn scenario_b_nodeport_disabled() {
    let (observations, caps) = node();
    let config = ClusterConfig {
        enable_nodeport: false,
        ..scenario_a()
    };
    let candidate = synthesize(&config, &observations, &caps, 1).unwrap();
    let descriptor = candidate.validated.descriptor();

    assert!(descriptor.maps.iter().all(|m| !m.kind.requires_nodeport()));
    assert!(descriptor.ports.is_none());
    assert!(!descriptor.has(Feature::Conntrack));
    let header = render::render_header(descriptor);
    assert!(!header.contains("NODEPORT_PORT"));
    assert!(!header.contains("CT_MAP"));
}

#[test]
fn ipv6_only_nodeport_drops_ipv4_bindings() {
    let (observations, caps) = node();
    let config = ClusterConfig {
        enable_ipv4: false,
        enable_ipv6: true,
        ..scenario_a()
    };
    let candidate = synthesize(&config, &observations, &caps, 1).unwrap();
    let descriptor = candidate.validated.descriptor();

    assert!(!descriptor.has(Feature::Ipv4));
    assert!(descriptor.maps.iter().all(|m| m.family != MapFamily::V4));
    for kind in [
        MapKind::ConntrackTcp,
        MapKind::ConntrackAny,
        MapKind::Services,
        MapKind::Backends,
        MapKind::ReverseNat,
        MapKind::Neighbor,
    ] {
        assert!(
            descriptor
                .maps
                .iter()
                .any(|m| m.kind == kind && m.family == MapFamily::V6),
            "missing IPv6 {kind}"
        );
    }
    let header = render::render_header(descriptor);
    assert!(header.contains("#define ENABLE_IPV6"));
    assert!(!header.contains("IPV4"));
    assert!(!header.contains("SNAT_MAPPING_IPV4"));
}

#[tokio::test]
async fn scenario_c_bad_timeout_keeps_previous_descriptor() {
    let (observations, caps) = node();
    let source = Arc::new(MemorySource::new(observations, caps));
    let synth = Synthesizer::new(scenario_a(), source.clone(), source);
    synth.trigger(Trigger::Bootstrap);
    assert!(matches!(
        synth.run_cycle().await.unwrap(),
        CycleOutcome::Published(_)
    ));
    let before = synth.current().unwrap();

    for bad in [0, -30] {
        let mut config = scenario_a();
        config.timeout_overrides.insert("close_timeout".to_string(), bad);
        synth.reload_config(config);
        match synth.run_cycle().await {
            Err(SynthError::InvalidTimeout { field, .. }) => assert_eq!(field, "close_timeout"),
            other => panic!("expected invalid timeout, got {other:?}"),
        }
        assert!(Arc::ptr_eq(&before, &synth.current().unwrap()));
    }
}

#[test]
fn conflicting_features_are_all_reported() {
    let (observations, caps) = node();
    let config = ClusterConfig {
        enable_ipv6: false,
        enable_nat46: true,
        enable_arp_responder: true,
        enable_nodeport: false,
        ..scenario_a()
    };
    match synthesize(&config, &observations, &caps, 1) {
        Err(SynthError::ConfigConflict(conflicts)) => assert_eq!(conflicts.len(), 2),
        other => panic!("expected conflicts, got {other:?}"),
    }
}

#[test]
fn repeated_synthesis_is_byte_identical() {
    let (observations, caps) = node();
    let a = synthesize(&scenario_a(), &observations, &caps, 3).unwrap();
    let b = synthesize(&scenario_a(), &observations, &caps, 3).unwrap();
    let (a, b) = (a.validated.descriptor(), b.validated.descriptor());
    assert_eq!(render::render_header(a), render::render_header(b));
    assert_eq!(render::render_json(a).unwrap(), render::render_json(b).unwrap());
    assert_eq!(render::runtime_block(a).to_le_bytes(), render::runtime_block(b).to_le_bytes());
}

proptest! {
    #[test]
    fn capacities_stay_within_ceiling(
        endpoints in 0u64..10_000_000,
        connections in 0u64..100_000_000,
        nodes in 0u64..100_000,
        ceiling in 1u32..=(1 << 24),
    ) {
        let (observations, caps) = node();
        let config = ClusterConfig {
            enable_ipv6: true,
            scale_hints: ScaleHints { endpoints, connections, nodes },
            map_size_ceiling: ceiling,
            ..scenario_a()
        };
        let candidate = synthesize(&config, &observations, &caps, 1).unwrap();
        for spec in &candidate.validated.descriptor().maps {
            prop_assert!(spec.capacity >= 1 && spec.capacity <= ceiling, "{} = {}", spec.name, spec.capacity);
        }
        for limit in &candidate.limits {
            prop_assert_eq!(limit.ceiling, ceiling);
            prop_assert!(limit.requested > u64::from(ceiling));
        }
    }

    #[test]
    fn equal_inputs_hash_equal(
        endpoints in 0u64..1_000_000,
        nodes in 0u64..10_000,
        generation_a in 1u64..1_000,
        generation_b in 1u64..1_000,
    ) {
        let (observations, caps) = node();
        let config = ClusterConfig {
            scale_hints: ScaleHints { endpoints, connections: 0, nodes },
            ..scenario_a()
        };
        let a = synthesize(&config, &observations, &caps, generation_a).unwrap();
        let b = synthesize(&config, &observations, &caps, generation_b).unwrap();
        prop_assert_eq!(a.validated.content_hash(), b.validated.content_hash());
    }
}
