use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use crate::descriptor::{ContentHash, Descriptor};
use crate::features::{self, Conflict, Feature};
use crate::identity::AddressFamily;
use crate::maps::{MapFamily, MapKind};
use crate::timeouts::TimeoutField;

pub const MIN_MTU_IPV4: u32 = 576;
pub const MIN_MTU_IPV6: u32 = 1280;
pub const MAX_MTU: u32 = 65535;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum Violation {
    #[error("map name {name:?} is used more than once")]
    DuplicateMapName { name: String },

    #[error("map {name} has capacity {capacity}, allowed range is 1..={ceiling}")]
    CapacityOutOfRange {
        name: String,
        capacity: u32,
        ceiling: u32,
    },

    #[error("map {name} is {family:?} but that family is disabled")]
    FamilyDisabled { name: String, family: MapFamily },

    #[error("map {name} ({kind}) exists without node_port")]
    RequiresNodePort { name: String, kind: MapKind },

    #[error("NAT port minimum {nat_min} is not NodePort maximum {nodeport_max} + 1")]
    NatRangeMisaligned { nodeport_max: u16, nat_min: u16 },

    #[error("port range {min}..={max} is empty")]
    EmptyPortRange { min: u16, max: u16 },

    #[error("timeout {field} is not positive")]
    NonPositiveTimeout { field: TimeoutField },

    #[error("feature graph: {0}")]
    FeatureGraph(Conflict),

    #[error("MTU {mtu} outside {min}..={max}")]
    MtuOutOfRange { mtu: u32, min: u32, max: u32 },

    #[error("{family} is enabled but the identity carries no {family} addresses")]
    MissingAddress { family: AddressFamily },

    #[error("encapsulation ifindex presence does not match tunnel={tunnel}")]
    EncapIfindexMismatch { tunnel: bool },

    #[error("port ranges presence does not match node_port={nodeport}")]
    PortRangesMismatch { nodeport: bool },
}

/// Every violation found in one descriptor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationFailure {
    pub generation: u64,
    pub violations: Vec<Violation>,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "descriptor generation {} failed validation with {} violation(s)",
            self.generation,
            self.violations.len()
        )?;
        for violation in &self.violations {
            write!(f, "; {violation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationFailure {}

/// A descriptor that passed [`validate`]. The only way to obtain one, so
/// the publisher never sees an unchecked descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedDescriptor {
    descriptor: Descriptor,
    content_hash: ContentHash,
}

impl ValidatedDescriptor {
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn content_hash(&self) -> &ContentHash {
        &self.content_hash
    }

    pub fn generation(&self) -> u64 {
        self.descriptor.generation
    }

    pub fn into_inner(self) -> Descriptor {
        self.descriptor
    }
}

fn check_maps(descriptor: &Descriptor, out: &mut Vec<Violation>) {
    let ceiling = descriptor.settings.map_size_ceiling;
    let mut seen = BTreeSet::new();
    for spec in &descriptor.maps {
        if !seen.insert(spec.name.as_str()) {
            out.push(Violation::DuplicateMapName {
                name: spec.name.clone(),
            });
        }
        if spec.capacity == 0 || spec.capacity > ceiling {
            out.push(Violation::CapacityOutOfRange {
                name: spec.name.clone(),
                capacity: spec.capacity,
                ceiling,
            });
        }
        if let Some(feature) = spec.family.feature() {
            if !descriptor.has(feature) {
                out.push(Violation::FamilyDisabled {
                    name: spec.name.clone(),
                    family: spec.family,
                });
            }
        }
        if spec.kind.requires_nodeport() && !descriptor.has(Feature::NodePort) {
            out.push(Violation::RequiresNodePort {
                name: spec.name.clone(),
                kind: spec.kind,
            });
        }
    }
}

fn check_ports(descriptor: &Descriptor, out: &mut Vec<Violation>) {
    let nodeport = descriptor.has(Feature::NodePort);
    if descriptor.ports.is_some() != nodeport {
        out.push(Violation::PortRangesMismatch { nodeport });
    }
    let Some(ports) = &descriptor.ports else {
        return;
    };
    for range in [ports.nodeport, ports.nat] {
        if range.min == 0 || range.min > range.max {
            out.push(Violation::EmptyPortRange {
                min: range.min,
                max: range.max,
            });
        }
    }
    if u32::from(ports.nat.min) != u32::from(ports.nodeport.max) + 1 {
        out.push(Violation::NatRangeMisaligned {
            nodeport_max: ports.nodeport.max,
            nat_min: ports.nat.min,
        });
    }
}

fn check_timeouts(descriptor: &Descriptor, out: &mut Vec<Violation>) {
    for (field, value) in descriptor.timeouts.values() {
        if value == 0 {
            out.push(Violation::NonPositiveTimeout { field });
        }
    }
}

fn check_identity(descriptor: &Descriptor, out: &mut Vec<Violation>) {
    let id = &descriptor.identity;
    if descriptor.has(Feature::Ipv4) && (id.router_ipv4.is_none() || id.host_ipv4.is_none()) {
        out.push(Violation::MissingAddress {
            family: AddressFamily::Ipv4,
        });
    }
    if descriptor.has(Feature::Ipv6) && (id.router_ipv6.is_none() || id.host_ipv6.is_none()) {
        out.push(Violation::MissingAddress {
            family: AddressFamily::Ipv6,
        });
    }
    let tunnel = descriptor.has(Feature::Tunnel);
    if id.encap_ifindex.is_some() != tunnel {
        out.push(Violation::EncapIfindexMismatch { tunnel });
    }
}

fn check_mtu(descriptor: &Descriptor, out: &mut Vec<Violation>) {
    let min = if descriptor.has(Feature::Ipv6) {
        MIN_MTU_IPV6
    } else {
        MIN_MTU_IPV4
    };
    if !(min..=MAX_MTU).contains(&descriptor.mtu) {
        out.push(Violation::MtuOutOfRange {
            mtu: descriptor.mtu,
            min,
            max: MAX_MTU,
        });
    }
}

/// Returns every violation in `descriptor`, in check order.
pub fn violations(descriptor: &Descriptor) -> Vec<Violation> {
    let mut out = Vec::new();
    check_maps(descriptor, &mut out);
    check_ports(descriptor, &mut out);
    check_timeouts(descriptor, &mut out);
    out.extend(
        features::check(&descriptor.features)
            .into_iter()
            .map(Violation::FeatureGraph),
    );
    check_identity(descriptor, &mut out);
    check_mtu(descriptor, &mut out);
    out
}

pub fn validate(descriptor: Descriptor) -> Result<ValidatedDescriptor, ValidationFailure> {
    let violations = violations(&descriptor);
    if !violations.is_empty() {
        return Err(ValidationFailure {
            generation: descriptor.generation,
            violations,
        });
    }
    let content_hash = descriptor.content_hash();
    Ok(ValidatedDescriptor {
        descriptor,
        content_hash,
    })
}
