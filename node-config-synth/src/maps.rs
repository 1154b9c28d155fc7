//! Kernel map sizing.
//!
//! Every table the datapath may use has one row in [`POLICIES`]: which
//! features gate it, its default capacity and how scale hints grow it. The
//! planner walks the rows in order and emits one [`MapSpec`] per enabled
//! (table, family) pair. Gated-off tables are omitted rather than sized zero.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::config::{NamingProfile, ScaleHints};
use crate::features::{Feature, FeatureSet, KernelCapabilities};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapKind {
    ConntrackTcp,
    ConntrackAny,
    Services,
    Backends,
    ReverseNat,
    ReverseNatSk,
    SessionAffinity,
    Neighbor,
    SnatMapping,
    #[serde(rename = "ipcache")]
    IpCache,
    TunnelEndpoint,
    Endpoints,
    EndpointToPolicy,
    PolicyCall,
    Policy,
    Metrics,
    EncryptState,
    Signals,
    Events,
    SockOps,
}

impl MapKind {
    pub fn key(self) -> &'static str {
        match self {
            MapKind::ConntrackTcp => "conntrack_tcp",
            MapKind::ConntrackAny => "conntrack_any",
            MapKind::Services => "services",
            MapKind::Backends => "backends",
            MapKind::ReverseNat => "reverse_nat",
            MapKind::ReverseNatSk => "reverse_nat_sk",
            MapKind::SessionAffinity => "session_affinity",
            MapKind::Neighbor => "neighbor",
            MapKind::SnatMapping => "snat_mapping",
            MapKind::IpCache => "ipcache",
            MapKind::TunnelEndpoint => "tunnel_endpoint",
            MapKind::Endpoints => "endpoints",
            MapKind::EndpointToPolicy => "endpoint_to_policy",
            MapKind::PolicyCall => "policy_call",
            MapKind::Policy => "policy",
            MapKind::Metrics => "metrics",
            MapKind::EncryptState => "encrypt_state",
            MapKind::Signals => "signals",
            MapKind::Events => "events",
            MapKind::SockOps => "sock_ops",
        }
    }

    /// Connection-tracking and NAT tables, which only exist with NodePort.
    pub fn requires_nodeport(self) -> bool {
        matches!(
            self,
            MapKind::ConntrackTcp
                | MapKind::ConntrackAny
                | MapKind::Services
                | MapKind::Backends
                | MapKind::ReverseNat
                | MapKind::ReverseNatSk
                | MapKind::SessionAffinity
                | MapKind::Neighbor
                | MapKind::SnatMapping
        )
    }

    fn policy(self) -> &'static MapPolicy {
        POLICIES
            .iter()
            .find(|p| p.kind == self)
            .unwrap_or_else(|| unreachable!("every map kind has a policy row"))
    }
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapFamily {
    V4,
    V6,
    Unspec,
}

impl MapFamily {
    fn suffix(self) -> &'static str {
        match self {
            MapFamily::V4 => "4",
            MapFamily::V6 => "6",
            MapFamily::Unspec => "",
        }
    }

    pub fn feature(self) -> Option<Feature> {
        match self {
            MapFamily::V4 => Some(Feature::Ipv4),
            MapFamily::V6 => Some(Feature::Ipv6),
            MapFamily::Unspec => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapProtocol {
    Tcp,
    Any,
}

#[derive(Clone, Copy, Debug)]
enum Scaling {
    Fixed,
    /// `max(default, Σ hint × factor)`.
    Linear {
        per_node: u64,
        per_endpoint: u64,
        per_connection: u64,
    },
    /// One slot per possible CPU.
    PerCpu,
    Mirror(MapKind),
}

const fn linear(per_node: u64, per_endpoint: u64, per_connection: u64) -> Scaling {
    Scaling::Linear {
        per_node,
        per_endpoint,
        per_connection,
    }
}

struct MapPolicy {
    kind: MapKind,
    families: &'static [MapFamily],
    protocol: MapProtocol,
    gate: &'static [Feature],
    default_capacity: u32,
    scaling: Scaling,
    /// `{f}` is replaced by the family digit.
    base_name: &'static str,
    /// Whether the naming profile prefix applies.
    profiled: bool,
    name_macro: &'static str,
    size_macro: &'static str,
}

const DUAL: &[MapFamily] = &[MapFamily::V4, MapFamily::V6];
const UNSPEC: &[MapFamily] = &[MapFamily::Unspec];

const POLICIES: &[MapPolicy] = &[
    MapPolicy {
        kind: MapKind::ConntrackTcp,
        families: DUAL,
        protocol: MapProtocol::Tcp,
        gate: &[Feature::NodePort],
        default_capacity: 524288,
        scaling: Scaling::Fixed,
        base_name: "cilium_ct_tcp{f}",
        profiled: true,
        name_macro: "CT_MAP_TCP{f}",
        size_macro: "CT_MAP_SIZE_TCP",
    },
    MapPolicy {
        kind: MapKind::ConntrackAny,
        families: DUAL,
        protocol: MapProtocol::Any,
        gate: &[Feature::NodePort],
        default_capacity: 262144,
        scaling: Scaling::Fixed,
        base_name: "cilium_ct_any{f}",
        profiled: true,
        name_macro: "CT_MAP_ANY{f}",
        size_macro: "CT_MAP_SIZE_ANY",
    },
    MapPolicy {
        kind: MapKind::Services,
        families: DUAL,
        protocol: MapProtocol::Any,
        gate: &[Feature::NodePort],
        default_capacity: 65536,
        scaling: Scaling::Fixed,
        base_name: "cilium_lb{f}_services",
        profiled: true,
        name_macro: "LB{f}_SERVICES_MAP_V2",
        size_macro: "LB{f}_SERVICES_MAP_SIZE",
    },
    MapPolicy {
        kind: MapKind::Backends,
        families: DUAL,
        protocol: MapProtocol::Any,
        gate: &[Feature::NodePort],
        default_capacity: 65536,
        scaling: linear(0, 1, 0),
        base_name: "cilium_lb{f}_backends",
        profiled: true,
        name_macro: "LB{f}_BACKEND_MAP",
        size_macro: "LB{f}_BACKEND_MAP_SIZE",
    },
    MapPolicy {
        kind: MapKind::ReverseNat,
        families: DUAL,
        protocol: MapProtocol::Any,
        gate: &[Feature::NodePort],
        default_capacity: 65536,
        scaling: Scaling::Fixed,
        base_name: "cilium_lb{f}_reverse_nat",
        profiled: true,
        name_macro: "LB{f}_REVERSE_NAT_MAP",
        size_macro: "LB{f}_REVERSE_NAT_MAP_SIZE",
    },
    MapPolicy {
        kind: MapKind::ReverseNatSk,
        families: DUAL,
        protocol: MapProtocol::Any,
        gate: &[Feature::NodePort],
        default_capacity: 262144,
        scaling: linear(0, 0, 1),
        base_name: "cilium_lb{f}_reverse_sk",
        profiled: false,
        name_macro: "LB{f}_REVERSE_NAT_SK_MAP",
        size_macro: "LB{f}_REVERSE_NAT_SK_MAP_SIZE",
    },
    MapPolicy {
        kind: MapKind::SessionAffinity,
        families: UNSPEC,
        protocol: MapProtocol::Any,
        gate: &[Feature::NodePort, Feature::SessionAffinity],
        default_capacity: 65536,
        scaling: Scaling::Fixed,
        base_name: "cilium_lb_affinity_match",
        profiled: true,
        name_macro: "LB_AFFINITY_MATCH_MAP",
        size_macro: "LB_AFFINITY_MATCH_MAP_SIZE",
    },
    MapPolicy {
        kind: MapKind::Neighbor,
        families: DUAL,
        protocol: MapProtocol::Any,
        gate: &[Feature::NodePort],
        default_capacity: 524288,
        scaling: Scaling::Fixed,
        base_name: "cilium_neigh{f}",
        profiled: true,
        name_macro: "NODEPORT_NEIGH{f}",
        size_macro: "NODEPORT_NEIGH{f}_SIZE",
    },
    MapPolicy {
        kind: MapKind::SnatMapping,
        families: DUAL,
        protocol: MapProtocol::Any,
        gate: &[Feature::NodePort],
        default_capacity: 524288,
        // original and reply tuple per connection
        scaling: linear(0, 0, 2),
        base_name: "cilium_snat_v{f}_external",
        profiled: false,
        name_macro: "SNAT_MAPPING_IPV{f}",
        size_macro: "SNAT_MAPPING_IPV{f}_SIZE",
    },
    MapPolicy {
        kind: MapKind::IpCache,
        families: UNSPEC,
        protocol: MapProtocol::Any,
        gate: &[],
        default_capacity: 512000,
        scaling: linear(4, 2, 0),
        base_name: "cilium_ipcache",
        profiled: true,
        name_macro: "IPCACHE_MAP",
        size_macro: "IPCACHE_MAP_SIZE",
    },
    MapPolicy {
        kind: MapKind::TunnelEndpoint,
        families: UNSPEC,
        protocol: MapProtocol::Any,
        gate: &[Feature::Tunnel],
        default_capacity: 65536,
        // one entry per remote node and family
        scaling: linear(2, 0, 0),
        base_name: "cilium_tunnel_map",
        profiled: true,
        name_macro: "TUNNEL_MAP",
        size_macro: "TUNNEL_ENDPOINT_MAP_SIZE",
    },
    MapPolicy {
        kind: MapKind::Endpoints,
        families: UNSPEC,
        protocol: MapProtocol::Any,
        gate: &[],
        default_capacity: 65536,
        scaling: linear(0, 1, 0),
        base_name: "cilium_lxc",
        profiled: true,
        name_macro: "ENDPOINTS_MAP",
        size_macro: "ENDPOINTS_MAP_SIZE",
    },
    MapPolicy {
        kind: MapKind::EndpointToPolicy,
        families: UNSPEC,
        protocol: MapProtocol::Any,
        gate: &[],
        default_capacity: 65536,
        scaling: linear(0, 1, 0),
        base_name: "cilium_ep_to_policy",
        profiled: true,
        name_macro: "EP_POLICY_MAP",
        size_macro: "EP_POLICY_MAP_SIZE",
    },
    MapPolicy {
        kind: MapKind::PolicyCall,
        families: UNSPEC,
        protocol: MapProtocol::Any,
        gate: &[],
        default_capacity: 65536,
        scaling: Scaling::Mirror(MapKind::Endpoints),
        base_name: "cilium_policy",
        profiled: true,
        name_macro: "POLICY_CALL_MAP",
        size_macro: "POLICY_PROG_MAP_SIZE",
    },
    MapPolicy {
        kind: MapKind::Policy,
        families: UNSPEC,
        protocol: MapProtocol::Any,
        gate: &[],
        default_capacity: 16384,
        scaling: Scaling::Fixed,
        base_name: "cilium_policy_ep",
        profiled: true,
        name_macro: "POLICY_MAP",
        size_macro: "POLICY_MAP_SIZE",
    },
    MapPolicy {
        kind: MapKind::Metrics,
        families: UNSPEC,
        protocol: MapProtocol::Any,
        gate: &[],
        default_capacity: 65536,
        scaling: Scaling::Fixed,
        base_name: "cilium_metrics",
        profiled: true,
        name_macro: "METRICS_MAP",
        size_macro: "METRICS_MAP_SIZE",
    },
    MapPolicy {
        kind: MapKind::EncryptState,
        families: UNSPEC,
        protocol: MapProtocol::Any,
        gate: &[Feature::Ipsec],
        default_capacity: 1,
        scaling: Scaling::Fixed,
        base_name: "cilium_encrypt_state",
        profiled: true,
        name_macro: "ENCRYPT_MAP",
        size_macro: "ENCRYPT_MAP_SIZE",
    },
    MapPolicy {
        kind: MapKind::Signals,
        families: UNSPEC,
        protocol: MapProtocol::Any,
        gate: &[],
        default_capacity: 1,
        scaling: Scaling::PerCpu,
        base_name: "cilium_signals",
        profiled: true,
        name_macro: "SIGNAL_MAP",
        size_macro: "SIGNAL_MAP_SIZE",
    },
    MapPolicy {
        kind: MapKind::Events,
        families: UNSPEC,
        protocol: MapProtocol::Any,
        gate: &[],
        default_capacity: 1,
        scaling: Scaling::PerCpu,
        base_name: "cilium_events",
        profiled: true,
        name_macro: "EVENTS_MAP",
        size_macro: "EVENTS_MAP_SIZE",
    },
    MapPolicy {
        kind: MapKind::SockOps,
        families: UNSPEC,
        protocol: MapProtocol::Any,
        gate: &[Feature::SockOps],
        default_capacity: 65535,
        scaling: Scaling::Fixed,
        base_name: "sock_ops_map",
        profiled: true,
        name_macro: "SOCK_OPS_MAP",
        size_macro: "SOCK_OPS_MAP_SIZE",
    },
];

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MapSpec {
    pub kind: MapKind,
    pub family: MapFamily,
    pub protocol: MapProtocol,
    pub name: String,
    pub capacity: u32,
}

impl MapSpec {
    /// Binding under which the map name is emitted.
    pub fn name_macro(&self) -> String {
        self.kind.policy().name_macro.replace("{f}", self.family.suffix())
    }

    /// Binding under which the capacity is emitted. Conntrack tables of both
    /// families share one size binding.
    pub fn size_macro(&self) -> String {
        self.kind.policy().size_macro.replace("{f}", self.family.suffix())
    }
}

/// Non-fatal: a computed capacity was clamped to the kernel ceiling.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("map {name} needs {requested} entries, clamped to ceiling {ceiling}")]
pub struct ResourceLimitExceeded {
    pub kind: MapKind,
    pub name: String,
    pub requested: u64,
    pub ceiling: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct PlanInputs<'a> {
    pub features: &'a FeatureSet,
    pub hints: &'a ScaleHints,
    pub capabilities: &'a KernelCapabilities,
    pub overrides: &'a BTreeMap<MapKind, u32>,
    pub ceiling: u32,
    pub profile: NamingProfile,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MapPlan {
    pub maps: Vec<MapSpec>,
    pub limits: Vec<ResourceLimitExceeded>,
}

fn map_name(policy: &MapPolicy, family: MapFamily, profile: NamingProfile) -> String {
    let mut name = String::new();
    if policy.profiled {
        name.push_str(profile.prefix());
    }
    name.push_str(&policy.base_name.replace("{f}", family.suffix()));
    if matches!(policy.kind, MapKind::ConntrackTcp | MapKind::ConntrackAny) {
        name.push_str(profile.conntrack_suffix());
    }
    name
}

fn requested_capacity(
    policy: &MapPolicy,
    inputs: &PlanInputs<'_>,
    planned: &[MapSpec],
) -> u64 {
    if let Some(size) = inputs.overrides.get(&policy.kind) {
        return u64::from(*size);
    }
    let default = u64::from(policy.default_capacity);
    match policy.scaling {
        Scaling::Fixed => default,
        Scaling::Linear {
            per_node,
            per_endpoint,
            per_connection,
        } => {
            let hints = inputs.hints;
            let scaled = hints
                .nodes
                .saturating_mul(per_node)
                .saturating_add(hints.endpoints.saturating_mul(per_endpoint))
                .saturating_add(hints.connections.saturating_mul(per_connection));
            default.max(scaled)
        }
        Scaling::PerCpu => u64::from(inputs.capabilities.possible_cpus),
        Scaling::Mirror(kind) => planned
            .iter()
            .find(|spec| spec.kind == kind)
            .map(|spec| u64::from(spec.capacity))
            .unwrap_or(default),
    }
}

/// Computes the ordered map set for the enabled features.
pub fn plan(inputs: &PlanInputs<'_>) -> MapPlan {
    let mut out = MapPlan::default();
    for policy in POLICIES {
        if !inputs.features.all_enabled(policy.gate) {
            continue;
        }
        for family in policy.families {
            if let Some(feature) = family.feature() {
                if !inputs.features.is_enabled(feature) {
                    continue;
                }
            }
            let name = map_name(policy, *family, inputs.profile);
            let requested = requested_capacity(policy, inputs, &out.maps).max(1);
            let ceiling = inputs.ceiling.max(1);
            let capacity = if requested > u64::from(ceiling) {
                let limit = ResourceLimitExceeded {
                    kind: policy.kind,
                    name: name.clone(),
                    requested,
                    ceiling,
                };
                warn!(map = %name, requested, ceiling, "map capacity clamped to kernel ceiling");
                out.limits.push(limit);
                ceiling
            } else {
                requested as u32
            };
            out.maps.push(MapSpec {
                kind: policy.kind,
                family: *family,
                protocol: policy.protocol,
                name,
                capacity,
            });
        }
    }
    out
}
