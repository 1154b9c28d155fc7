use std::{collections::BTreeSet, net::Ipv4Addr};

use node_config_common::{MacAddr, RuntimeConfig};

use crate::descriptor::Descriptor;
use crate::features::Feature;

const HEADER_BANNER: &str = "/* Generated node datapath configuration. Do not edit. */";

/// Reserved security identities known to the datapath.
const RESERVED_IDENTITIES: [(&str, u32); 6] = [
    ("HOST_ID", 1),
    ("WORLD_ID", 2),
    ("UNMANAGED_ID", 3),
    ("HEALTH_ID", 4),
    ("INIT_ID", 5),
    ("REMOTE_NODE_ID", 6),
];

#[derive(Default)]
struct Header {
    lines: Vec<String>,
}

impl Header {
    fn line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    fn define(&mut self, name: &str, value: impl std::fmt::Display) {
        self.lines.push(format!("#define {name} {value}"));
    }

    fn flag(&mut self, name: &str) {
        self.lines.push(format!("#define {name}"));
    }

    fn finish(self) -> String {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }
}

/// Formats bytes as a C initializer list: `0xde, 0xad, 0x0`.
pub fn byte_array(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:#x}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn mac_initializer(mac: &MacAddr) -> String {
    format!("{{ .addr = {{ {} }} }}", byte_array(&mac.addr))
}

/// IPv4 address as the 32-bit word the datapath loads from the packet.
pub fn ipv4_word(addr: Ipv4Addr) -> String {
    format!("{:#x}", u32::from_le_bytes(addr.octets()))
}

fn feature_define(feature: Feature) -> (&'static str, Option<&'static str>) {
    match feature {
        Feature::Ipv4 => ("ENABLE_IPV4", None),
        Feature::Ipv6 => ("ENABLE_IPV6", None),
        Feature::NodePort => ("ENABLE_NODEPORT", None),
        Feature::Ipsec => ("ENABLE_IPSEC", None),
        Feature::ArpResponder => ("ENABLE_ARP_RESPONDER", None),
        Feature::EncapGeneve => ("ENCAP_GENEVE", Some("1")),
        Feature::EncapVxlan => ("ENCAP_VXLAN", Some("1")),
        Feature::Tunnel => ("TUNNEL_MODE", Some("1")),
        Feature::Conntrack => ("CONNTRACK", None),
        Feature::ConntrackAccounting => ("CONNTRACK_ACCOUNTING", None),
        Feature::Masquerade => ("ENABLE_MASQUERADE", None),
        Feature::SessionAffinity => ("ENABLE_SESSION_AFFINITY", None),
        Feature::SockOps => ("ENABLE_SOCKOPS", None),
        Feature::Nat46 => ("ENABLE_NAT46", None),
    }
}

pub fn render_header(descriptor: &Descriptor) -> String {
    let id = &descriptor.identity;
    let mut h = Header::default();

    h.line(HEADER_BANNER);
    h.line("#include \"lib/utils.h\"");
    h.line("");

    for feature in descriptor.features.iter() {
        match feature_define(feature) {
            (name, Some(value)) => h.define(name, value),
            (name, None) => h.flag(name),
        }
    }
    h.line("");

    h.line(format!("DEFINE_MAC(NODE_MAC, {});", byte_array(&id.node_mac.addr)));
    h.define("NODE_MAC", "fetch_mac(NODE_MAC)");
    if let Some(router) = id.router_ipv6 {
        h.line(format!("DEFINE_IPV6(ROUTER_IP, {});", byte_array(&router.octets())));
    }
    if let Some(encap) = id.encap_ifindex {
        h.define("ENCAP_IFINDEX", encap);
    }
    h.define("HOST_IFINDEX", id.host_ifindex);
    h.define("CILIUM_IFINDEX", id.internal_ifindex);
    h.define("NATIVE_DEV_IFINDEX", id.native_ifindex);
    h.define("NATIVE_DEV_MAC_BY_IFINDEX(_)", mac_initializer(&id.native_mac));
    if let Some(host) = id.host_ipv6 {
        h.line(format!("DEFINE_IPV6(HOST_IP, {});", byte_array(&host.octets())));
    }
    for (name, value) in RESERVED_IDENTITIES {
        h.define(name, value);
    }
    h.define("HOST_IFINDEX_MAC", mac_initializer(&id.native_mac));
    h.define("CILIUM_NET_MAC", mac_initializer(&id.internal_mac));
    if let Some(prefix) = id.nat46_prefix {
        h.define(
            "NAT46_PREFIX",
            format!("{{ .addr = {{ {} }} }}", byte_array(&prefix.octets())),
        );
    }
    if let Some(lb_mac) = &id.lb_redirect_mac {
        h.define("LB_REDIRECT", 1);
        h.define("LB_DST_MAC", mac_initializer(lb_mac));
    }

    if let Some(ports) = &descriptor.ports {
        h.define("NODEPORT_PORT_MIN", ports.nodeport.min);
        h.define("NODEPORT_PORT_MAX", ports.nodeport.max);
        h.define("NODEPORT_PORT_MIN_NAT", "(NODEPORT_PORT_MAX + 1)");
        h.define("NODEPORT_PORT_MAX_NAT", ports.nat.max);
    }
    h.line("");

    let t = &descriptor.timeouts;
    h.define("CT_CONNECTION_LIFETIME_TCP", t.connection_lifetime_tcp);
    h.define("CT_CONNECTION_LIFETIME_NONTCP", t.connection_lifetime_nontcp);
    h.define("CT_SERVICE_LIFETIME_TCP", t.service_lifetime_tcp);
    h.define("CT_SERVICE_LIFETIME_NONTCP", t.service_lifetime_nontcp);
    h.define("CT_SYN_TIMEOUT", t.syn_timeout);
    h.define("CT_CLOSE_TIMEOUT", t.close_timeout);
    h.define("CT_REPORT_INTERVAL", t.report_interval);
    h.define("CT_REPORT_FLAGS", format!("{:#04x}", t.report_flags));
    h.line("");

    if descriptor.has(Feature::Ipv4) {
        if let Some(mask) = id.ipv4_mask {
            h.define("IPV4_MASK", ipv4_word(mask));
        }
        if let Some(gateway) = id.router_ipv4 {
            h.define("IPV4_GATEWAY", ipv4_word(gateway));
        }
        if let Some(loopback) = id.ipv4_loopback {
            h.define("IPV4_LOOPBACK", ipv4_word(loopback));
        }
        if let (Some(host), true) = (id.host_ipv4, descriptor.has(Feature::NodePort)) {
            h.define("IPV4_NODEPORT", ipv4_word(host));
        }
    }

    let mut sizes_emitted = BTreeSet::new();
    for spec in &descriptor.maps {
        h.define(&spec.name_macro(), &spec.name);
        let size_macro = spec.size_macro();
        if sizes_emitted.insert(size_macro.clone()) {
            h.define(&size_macro, spec.capacity);
        }
    }
    h.line("");

    if descriptor.settings.debug {
        h.flag("LB_DEBUG");
    }
    h.define("MONITOR_AGGREGATION", descriptor.settings.monitor_aggregation.level());
    h.define("MTU", descriptor.mtu);
    h.define("EPHEMERAL_MIN", descriptor.settings.ephemeral_port_min);

    h.finish()
}

pub fn render_json(descriptor: &Descriptor) -> serde_json::Result<String> {
    serde_json::to_string_pretty(descriptor)
}

/// Fixed-layout block for the datapath's runtime configuration map.
pub fn runtime_block(descriptor: &Descriptor) -> RuntimeConfig {
    let t = &descriptor.timeouts;
    let (nodeport_min, nodeport_max, nat_min, nat_max) = match &descriptor.ports {
        Some(p) => (p.nodeport.min, p.nodeport.max, p.nat.min, p.nat.max),
        None => (0, 0, 0, 0),
    };
    RuntimeConfig {
        generation: descriptor.generation,
        feature_bits: descriptor.features.bits(),
        mtu: descriptor.mtu,
        nodeport_min,
        nodeport_max,
        nat_min,
        nat_max,
        ct_lifetime_tcp: t.connection_lifetime_tcp,
        ct_lifetime_nontcp: t.connection_lifetime_nontcp,
        svc_lifetime_tcp: t.service_lifetime_tcp,
        svc_lifetime_nontcp: t.service_lifetime_nontcp,
        syn_timeout: t.syn_timeout,
        close_timeout: t.close_timeout,
        report_interval: t.report_interval,
        report_flags: t.report_flags,
        monitor_aggregation: descriptor.settings.monitor_aggregation.level(),
        node_mac: descriptor.identity.node_mac,
        reserved: [0; 4],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, EncapMode, NamingProfile};
    use crate::descriptor::tests::build;

    fn reference_config() -> ClusterConfig {
        ClusterConfig {
            enable_ipv4: true,
            enable_ipv6: true,
            enable_nodeport: true,
            naming_profile: NamingProfile::Test,
            mtu: 1500,
            ..Default::default()
        }
    }

    #[test]
    fn byte_array_matches_c_initializer_style() {
        assert_eq!(byte_array(&[0, 0x01, 0x02, 0x03]), "0x0, 0x1, 0x2, 0x3");
        assert_eq!(byte_array(&[0, 0xff, 0xff, 0xff]), "0x0, 0xff, 0xff, 0xff");
        assert_eq!(byte_array(&[0xa, 0xbc, 0xde, 0xf1]), "0xa, 0xbc, 0xde, 0xf1");
        assert_eq!(byte_array(&[]), "");
    }

    #[test]
    fn ipv4_words_use_load_order() {
        assert_eq!(ipv4_word(Ipv4Addr::new(10, 245, 255, 255)), "0xfffff50a");
        assert_eq!(ipv4_word(Ipv4Addr::new(255, 255, 0, 0)), "0xffff");
    }

    #[test]
    fn header_contains_reference_bindings() {
        let header = render_header(&build(&reference_config(), 1));
        let lines: Vec<&str> = header.lines().collect();
        for expected in [
            "DEFINE_MAC(NODE_MAC, 0xde, 0xad, 0xbe, 0xef, 0xc0, 0xde);",
            "#define NODE_MAC fetch_mac(NODE_MAC)",
            "DEFINE_IPV6(ROUTER_IP, 0xbe, 0xef, 0x0, 0x0, 0x0, 0x0, 0x0, 0x1, 0x0, 0x0, 0x0, 0x1, 0x0, 0x1, 0x0, 0x0);",
            "DEFINE_IPV6(HOST_IP, 0xbe, 0xef, 0x0, 0x0, 0x0, 0x0, 0x0, 0x1, 0x0, 0x0, 0xa, 0x0, 0x2, 0xf, 0xff, 0xff);",
            "#define ENCAP_IFINDEX 5",
            "#define HOST_IFINDEX 4",
            "#define CILIUM_IFINDEX 3",
            "#define NATIVE_DEV_IFINDEX 2",
            "#define NATIVE_DEV_MAC_BY_IFINDEX(_) { .addr = { 0xce, 0x72, 0xa7, 0x3, 0x88, 0x56 } }",
            "#define CILIUM_NET_MAC { .addr = { 0xce, 0x72, 0xa7, 0x3, 0x88, 0x57 } }",
            "#define NODEPORT_PORT_MIN 30000",
            "#define NODEPORT_PORT_MAX 32767",
            "#define NODEPORT_PORT_MIN_NAT (NODEPORT_PORT_MAX + 1)",
            "#define NODEPORT_PORT_MAX_NAT 43835",
            "#define CT_CONNECTION_LIFETIME_TCP 21600",
            "#define CT_CLOSE_TIMEOUT 10",
            "#define CT_REPORT_FLAGS 0xff",
            "#define IPV4_MASK 0xffff",
            "#define IPV4_GATEWAY 0xfffff50a",
            "#define ENCAP_GENEVE 1",
            "#define ENABLE_NODEPORT",
            "#define CT_MAP_TCP4 test_cilium_ct_tcp4_65535",
            "#define CT_MAP_ANY6 test_cilium_ct_any6_65535",
            "#define CT_MAP_SIZE_TCP 524288",
            "#define SNAT_MAPPING_IPV4 cilium_snat_v4_external",
            "#define SNAT_MAPPING_IPV4_SIZE 524288",
            "#define NODEPORT_NEIGH6 test_cilium_neigh6",
            "#define IPCACHE_MAP_SIZE 512000",
            "#define POLICY_PROG_MAP_SIZE 65536",
            "#define MTU 1500",
            "#define EPHEMERAL_MIN 32768",
        ] {
            assert!(lines.contains(&expected), "missing line: {expected}");
        }
        assert_eq!(
            lines.iter().filter(|l| l.starts_with("#define CT_MAP_SIZE_TCP ")).count(),
            1
        );
    }

    #[test]
    fn nodeport_disabled_omits_port_and_nat_groups() {
        let config = ClusterConfig {
            enable_nodeport: false,
            ..reference_config()
        };
        let header = render_header(&build(&config, 1));
        for absent in [
            "NODEPORT_PORT_MIN",
            "NODEPORT_PORT_MAX_NAT",
            "CT_MAP_",
            "SNAT_MAPPING",
            "SERVICES_MAP",
            "BACKEND_MAP",
            "REVERSE_NAT",
            "NODEPORT_NEIGH",
            "ENABLE_NODEPORT",
        ] {
            assert!(!header.contains(absent), "unexpected {absent}");
        }
        assert!(header.contains("#define IPCACHE_MAP test_cilium_ipcache"));
    }

    #[test]
    fn ipv6_disabled_omits_ipv6_bindings() {
        let mut config = ClusterConfig {
            enable_ipv6: false,
            encap_mode: EncapMode::Vxlan,
            ..reference_config()
        };
        // the sample node only has a geneve device
        config.devices.encap = Some("cilium_geneve".to_string());
        let header = render_header(&build(&config, 1));
        assert!(!header.contains("ROUTER_IP"));
        assert!(!header.contains("NAT46_PREFIX"));
        assert!(!header.contains("CT_MAP_TCP6"));
        assert!(header.contains("#define CT_MAP_TCP4 test_cilium_ct_tcp4_65535"));
        assert!(header.contains("#define ENCAP_VXLAN 1"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let config = reference_config();
        let a = build(&config, 3);
        let b = build(&config, 3);
        assert_eq!(render_header(&a), render_header(&b));
        assert_eq!(render_json(&a).unwrap(), render_json(&b).unwrap());
    }

    #[test]
    fn json_round_trips_descriptor() {
        let descriptor = build(&reference_config(), 8);
        let json = render_json(&descriptor).unwrap();
        let back: Descriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, descriptor);
    }

    #[test]
    fn runtime_block_mirrors_descriptor() {
        let descriptor = build(&reference_config(), 11);
        let block = runtime_block(&descriptor);
        assert_eq!(block.generation, 11);
        assert_eq!(block.nat_min, 32768);
        assert_eq!(block.mtu, 1500);
        assert!(block.has_feature(node_config_common::FEATURE_NODEPORT));
        assert!(block.has_feature(node_config_common::FEATURE_CONNTRACK));
        assert_eq!(block.node_mac, descriptor.identity.node_mac);
    }
}
