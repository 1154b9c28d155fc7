use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{ClusterConfig, MonitorAggregation, NamingProfile};
use crate::error::{Result, SynthError};
use crate::features::{Feature, FeatureSet};
use crate::identity::NodeIdentity;
use crate::maps::MapSpec;
use crate::timeouts::TimeoutPolicy;

pub const TUNNEL_OVERHEAD: u32 = 50;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

/// NodePort range and the NAT range placed directly above it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PortRanges {
    pub nodeport: PortRange,
    pub nat: PortRange,
}

impl PortRanges {
    pub fn derive(nodeport: (u16, u16), nat_max: u16) -> Result<Self> {
        let (min, max) = nodeport;
        if min == 0 || min > max {
            return Err(SynthError::InvalidConfig(format!(
                "NodePort range ({min}, {max}) is empty"
            )));
        }
        let nat_min = max.checked_add(1).ok_or_else(|| {
            SynthError::InvalidConfig(format!("NodePort maximum {max} leaves no room for NAT ports"))
        })?;
        if nat_max < nat_min {
            return Err(SynthError::InvalidConfig(format!(
                "NAT port maximum {nat_max} is below the derived NAT minimum {nat_min}"
            )));
        }
        Ok(Self {
            nodeport: PortRange { min, max },
            nat: PortRange {
                min: nat_min,
                max: nat_max,
            },
        })
    }
}

/// Settings copied verbatim from configuration into the descriptor.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DatapathSettings {
    pub naming_profile: NamingProfile,
    pub map_size_ceiling: u32,
    pub monitor_aggregation: MonitorAggregation,
    pub ephemeral_port_min: u16,
    pub debug: bool,
}

impl From<&ClusterConfig> for DatapathSettings {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            naming_profile: config.naming_profile,
            map_size_ceiling: config.map_size_ceiling,
            monitor_aggregation: config.monitor_aggregation,
            ephemeral_port_min: config.ephemeral_port_min,
            debug: config.debug,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    pub generation: u64,
    pub identity: NodeIdentity,
    pub features: FeatureSet,
    pub maps: Vec<MapSpec>,
    pub timeouts: TimeoutPolicy,
    pub ports: Option<PortRanges>,
    pub mtu: u32,
    pub settings: DatapathSettings,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Descriptor {
    /// SHA-256 of the canonical JSON encoding of every field except the
    /// generation, so descriptors built from equal inputs hash equal.
    pub fn content_hash(&self) -> ContentHash {
        let content = HashedContent {
            identity: &self.identity,
            features: &self.features,
            maps: &self.maps,
            timeouts: &self.timeouts,
            ports: &self.ports,
            mtu: self.mtu,
            settings: &self.settings,
        };
        // Only plain structs, sequences and string keys: encoding cannot fail.
        let bytes = serde_json::to_vec(&content).expect("descriptor content is serializable");
        let digest = Sha256::digest(&bytes);
        let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
        ContentHash(hex)
    }

    pub fn has(&self, feature: Feature) -> bool {
        self.features.is_enabled(feature)
    }
}

#[derive(Serialize)]
struct HashedContent<'a> {
    identity: &'a NodeIdentity,
    features: &'a FeatureSet,
    maps: &'a [MapSpec],
    timeouts: &'a TimeoutPolicy,
    ports: &'a Option<PortRanges>,
    mtu: u32,
    settings: &'a DatapathSettings,
}

/// Everything the assembler combines. Each part has already been checked by
/// the resolver that produced it.
#[derive(Clone, Debug)]
pub struct AssemblyInputs {
    pub generation: u64,
    pub identity: NodeIdentity,
    pub features: FeatureSet,
    pub maps: Vec<MapSpec>,
    pub timeouts: TimeoutPolicy,
    pub ports: Option<PortRanges>,
    pub mtu: u32,
    pub settings: DatapathSettings,
}

pub fn assemble(inputs: AssemblyInputs) -> Descriptor {
    let AssemblyInputs {
        generation,
        identity,
        features,
        maps,
        timeouts,
        ports,
        mtu,
        settings,
    } = inputs;
    let ports = ports.filter(|_| features.is_enabled(Feature::NodePort));
    Descriptor {
        generation,
        identity,
        features,
        maps,
        timeouts,
        ports,
        mtu,
        settings,
    }
}

/// Configured MTU, or the native device MTU minus tunnel overhead.
pub fn resolve_mtu(config: &ClusterConfig, identity: &NodeIdentity, features: &FeatureSet) -> Result<u32> {
    if config.mtu > 0 {
        return Ok(config.mtu);
    }
    let device = identity.native_mtu.ok_or_else(|| {
        SynthError::InvalidConfig(format!(
            "mtu is not configured and the MTU of {} is unknown",
            config.devices.native
        ))
    })?;
    let overhead = if features.is_enabled(Feature::Tunnel) {
        TUNNEL_OVERHEAD
    } else {
        0
    };
    device.checked_sub(overhead).filter(|mtu| *mtu > 0).ok_or_else(|| {
        SynthError::InvalidConfig(format!("device MTU {device} is smaller than tunnel overhead"))
    })
}
