//! Feature toggle resolution.
//!
//! Requested toggles are closed under the implication rules, then every
//! prerequisite, exclusion and kernel capability rule is checked. Violations
//! are reported together and never corrected silently.

use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::SynthError;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Ipv4,
    Ipv6,
    NodePort,
    Ipsec,
    ArpResponder,
    EncapGeneve,
    EncapVxlan,
    Tunnel,
    Conntrack,
    ConntrackAccounting,
    Masquerade,
    SessionAffinity,
    SockOps,
    Nat46,
}

impl Feature {
    pub fn name(self) -> &'static str {
        match self {
            Feature::Ipv4 => "ipv4",
            Feature::Ipv6 => "ipv6",
            Feature::NodePort => "node_port",
            Feature::Ipsec => "ipsec",
            Feature::ArpResponder => "arp_responder",
            Feature::EncapGeneve => "encap_geneve",
            Feature::EncapVxlan => "encap_vxlan",
            Feature::Tunnel => "tunnel",
            Feature::Conntrack => "conntrack",
            Feature::ConntrackAccounting => "conntrack_accounting",
            Feature::Masquerade => "masquerade",
            Feature::SessionAffinity => "session_affinity",
            Feature::SockOps => "sock_ops",
            Feature::Nat46 => "nat46",
        }
    }

    pub fn bit(self) -> u32 {
        use node_config_common as common;
        match self {
            Feature::Ipv4 => common::FEATURE_IPV4,
            Feature::Ipv6 => common::FEATURE_IPV6,
            Feature::NodePort => common::FEATURE_NODEPORT,
            Feature::Ipsec => common::FEATURE_IPSEC,
            Feature::ArpResponder => common::FEATURE_ARP_RESPONDER,
            Feature::EncapGeneve => common::FEATURE_ENCAP_GENEVE,
            Feature::EncapVxlan => common::FEATURE_ENCAP_VXLAN,
            Feature::Tunnel => common::FEATURE_TUNNEL,
            Feature::Conntrack => common::FEATURE_CONNTRACK,
            Feature::ConntrackAccounting => common::FEATURE_CONNTRACK_ACCOUNTING,
            Feature::Masquerade => common::FEATURE_MASQUERADE,
            Feature::SessionAffinity => common::FEATURE_SESSION_AFFINITY,
            Feature::SockOps => common::FEATURE_SOCK_OPS,
            Feature::Nat46 => common::FEATURE_NAT46,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    LruMaps,
    SockOps,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::LruMaps => f.write_str("LRU hash maps"),
            Capability::SockOps => f.write_str("sockops programs"),
        }
    }
}

/// Kernel facts detected on the node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelCapabilities {
    pub lru_maps: bool,
    pub sock_ops: bool,
    pub possible_cpus: u32,
}

impl Default for KernelCapabilities {
    fn default() -> Self {
        Self {
            lru_maps: true,
            sock_ops: true,
            possible_cpus: 1,
        }
    }
}

impl KernelCapabilities {
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::LruMaps => self.lru_maps,
            Capability::SockOps => self.sock_ops,
        }
    }
}

enum Rule {
    /// `then` is enabled whenever `when` is.
    Implies { when: Feature, then: Feature },
    RequiresAll { feature: Feature, needs: &'static [Feature] },
    RequiresAny { feature: Feature, needs: &'static [Feature] },
    Excludes(Feature, Feature),
    RequiresCapability { feature: Feature, needs: Capability },
}

const ANY_FAMILY: &[Feature] = &[Feature::Ipv4, Feature::Ipv6];

const RULES: &[Rule] = &[
    Rule::Implies { when: Feature::NodePort, then: Feature::Conntrack },
    Rule::Implies { when: Feature::Conntrack, then: Feature::ConntrackAccounting },
    Rule::Implies { when: Feature::EncapGeneve, then: Feature::Tunnel },
    Rule::Implies { when: Feature::EncapVxlan, then: Feature::Tunnel },
    Rule::RequiresAny { feature: Feature::NodePort, needs: ANY_FAMILY },
    Rule::RequiresAll { feature: Feature::ArpResponder, needs: &[Feature::NodePort, Feature::Ipv4] },
    Rule::RequiresAll { feature: Feature::Masquerade, needs: &[Feature::NodePort] },
    Rule::RequiresAll { feature: Feature::SessionAffinity, needs: &[Feature::NodePort] },
    Rule::RequiresAll { feature: Feature::Nat46, needs: &[Feature::Ipv4, Feature::Ipv6] },
    Rule::RequiresAny { feature: Feature::Ipsec, needs: ANY_FAMILY },
    Rule::RequiresAny { feature: Feature::SockOps, needs: ANY_FAMILY },
    Rule::Excludes(Feature::EncapGeneve, Feature::EncapVxlan),
    Rule::RequiresCapability { feature: Feature::Conntrack, needs: Capability::LruMaps },
    Rule::RequiresCapability { feature: Feature::SessionAffinity, needs: Capability::LruMaps },
    Rule::RequiresCapability { feature: Feature::SockOps, needs: Capability::SockOps },
];

/// Dependencies come before dependents; implications are applied in this order.
pub const TOPOLOGICAL_ORDER: [Feature; 14] = [
    Feature::Ipv4,
    Feature::Ipv6,
    Feature::EncapGeneve,
    Feature::EncapVxlan,
    Feature::Tunnel,
    Feature::NodePort,
    Feature::Conntrack,
    Feature::ConntrackAccounting,
    Feature::ArpResponder,
    Feature::Masquerade,
    Feature::SessionAffinity,
    Feature::Nat46,
    Feature::Ipsec,
    Feature::SockOps,
];

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum Conflict {
    #[error("{feature} requires {}", list(.needs, " and "))]
    MissingPrerequisite { feature: Feature, needs: Vec<Feature> },
    #[error("{feature} requires one of {}", list(.needs, ", "))]
    MissingAnyPrerequisite { feature: Feature, needs: Vec<Feature> },
    #[error("{0} and {1} are mutually exclusive")]
    MutuallyExclusive(Feature, Feature),
    #[error("{feature} requires kernel support for {capability}")]
    MissingCapability { feature: Feature, capability: Capability },
    #[error("no address family enabled")]
    NoAddressFamily,
}

fn list(features: &[Feature], sep: &str) -> String {
    features
        .iter()
        .map(|f| f.name())
        .collect::<Vec<_>>()
        .join(sep)
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSet {
    enabled: BTreeSet<Feature>,
}

impl FeatureSet {
    pub fn from_enabled(features: impl IntoIterator<Item = Feature>) -> Self {
        Self {
            enabled: features.into_iter().collect(),
        }
    }

    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.enabled.contains(&feature)
    }

    pub fn all_enabled(&self, features: &[Feature]) -> bool {
        features.iter().all(|f| self.is_enabled(*f))
    }

    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        self.enabled.iter().copied()
    }

    pub fn bits(&self) -> u32 {
        self.iter().fold(0, |bits, f| bits | f.bit())
    }

    pub fn len(&self) -> usize {
        self.enabled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enabled.is_empty()
    }
}

/// Resolves the final feature set from requested toggles and kernel facts.
pub fn resolve(
    requested: &BTreeSet<Feature>,
    capabilities: &KernelCapabilities,
) -> Result<FeatureSet, SynthError> {
    let mut enabled = requested.clone();

    // Bounded: each pass either adds a feature or terminates.
    for _ in 0..=TOPOLOGICAL_ORDER.len() {
        let before = enabled.len();
        for feature in TOPOLOGICAL_ORDER {
            if !enabled.contains(&feature) {
                continue;
            }
            for rule in RULES {
                if let Rule::Implies { when, then } = rule {
                    if *when == feature {
                        enabled.insert(*then);
                    }
                }
            }
        }
        if enabled.len() == before {
            break;
        }
    }

    let set = FeatureSet { enabled };
    let mut conflicts = check(&set);
    for rule in RULES {
        if let Rule::RequiresCapability { feature, needs } = rule {
            if set.is_enabled(*feature) && !capabilities.supports(*needs) {
                conflicts.push(Conflict::MissingCapability {
                    feature: *feature,
                    capability: *needs,
                });
            }
        }
    }

    if !conflicts.is_empty() {
        return Err(SynthError::ConfigConflict(conflicts));
    }

    debug!(features = ?set.enabled, "resolved feature set");
    Ok(set)
}

/// Checks the dependency graph of an already resolved set; capability rules
/// are not part of the graph and are only enforced by [`resolve`].
pub fn check(set: &FeatureSet) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    if !set.is_enabled(Feature::Ipv4) && !set.is_enabled(Feature::Ipv6) {
        conflicts.push(Conflict::NoAddressFamily);
    }
    for rule in RULES {
        match rule {
            Rule::Implies { when, then } => {
                if set.is_enabled(*when) && !set.is_enabled(*then) {
                    conflicts.push(Conflict::MissingPrerequisite {
                        feature: *when,
                        needs: vec![*then],
                    });
                }
            }
            Rule::RequiresAll { feature, needs } => {
                if set.is_enabled(*feature) && !set.all_enabled(needs) {
                    conflicts.push(Conflict::MissingPrerequisite {
                        feature: *feature,
                        needs: needs.to_vec(),
                    });
                }
            }
            Rule::RequiresAny { feature, needs } => {
                if set.is_enabled(*feature) && !needs.iter().any(|f| set.is_enabled(*f)) {
                    conflicts.push(Conflict::MissingAnyPrerequisite {
                        feature: *feature,
                        needs: needs.to_vec(),
                    });
                }
            }
            Rule::Excludes(a, b) => {
                if set.is_enabled(*a) && set.is_enabled(*b) {
                    conflicts.push(Conflict::MutuallyExclusive(*a, *b));
                }
            }
            Rule::RequiresCapability { .. } => {}
        }
    }
    conflicts
}
