use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs,
    net::{Ipv4Addr, Ipv6Addr},
    path::Path,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::SynthError;
use crate::features::Feature;
use crate::maps::MapKind;

pub const DEFAULT_NODEPORT_MIN: u16 = 30000;
pub const DEFAULT_NODEPORT_MAX: u16 = 32767;
pub const DEFAULT_NAT_PORT_MAX: u16 = 43835;
pub const DEFAULT_MAP_SIZE_CEILING: u32 = 1 << 24;
pub const DEFAULT_EPHEMERAL_PORT_MIN: u16 = 32768;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncapMode {
    #[default]
    Geneve,
    Vxlan,
    Disabled,
}

impl EncapMode {
    pub fn default_device(self) -> Option<&'static str> {
        match self {
            EncapMode::Geneve => Some("cilium_geneve"),
            EncapMode::Vxlan => Some("cilium_vxlan"),
            EncapMode::Disabled => None,
        }
    }
}

/// Map naming scheme. `Test` mirrors the names used by datapath unit tests.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamingProfile {
    #[default]
    Production,
    Test,
}

impl NamingProfile {
    pub fn prefix(self) -> &'static str {
        match self {
            NamingProfile::Production => "",
            NamingProfile::Test => "test_",
        }
    }

    pub fn conntrack_suffix(self) -> &'static str {
        match self {
            NamingProfile::Production => "_global",
            NamingProfile::Test => "_65535",
        }
    }
}

impl fmt::Display for NamingProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamingProfile::Production => f.write_str("production"),
            NamingProfile::Test => f.write_str("test"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorAggregation {
    None,
    Low,
    #[default]
    Medium,
    Maximum,
}

impl MonitorAggregation {
    pub fn level(self) -> u8 {
        match self {
            MonitorAggregation::None => 0,
            MonitorAggregation::Low => 1,
            MonitorAggregation::Medium => 2,
            MonitorAggregation::Maximum => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleHints {
    pub endpoints: u64,
    pub connections: u64,
    pub nodes: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceNames {
    pub host: String,
    pub internal: String,
    pub native: String,
    /// Overrides the encapsulation device implied by `encap_mode`.
    pub encap: Option<String>,
    pub lb_redirect: Option<String>,
}

impl Default for DeviceNames {
    fn default() -> Self {
        Self {
            host: "cilium_host".to_string(),
            internal: "cilium_net".to_string(),
            native: "eth0".to_string(),
            encap: None,
            lb_redirect: None,
        }
    }
}

impl DeviceNames {
    pub fn encap_device(&self, mode: EncapMode) -> Option<String> {
        mode.default_device()?;
        self.encap
            .clone()
            .or_else(|| mode.default_device().map(str::to_string))
    }
}

/// Cluster-wide timeout defaults; unset fields fall back to the built-in
/// policy. Values are seconds, except `report_flags` which is a bitmask.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutDefaults {
    pub connection_lifetime_tcp: Option<i64>,
    pub connection_lifetime_nontcp: Option<i64>,
    pub service_lifetime_tcp: Option<i64>,
    pub service_lifetime_nontcp: Option<i64>,
    pub syn_timeout: Option<i64>,
    pub close_timeout: Option<i64>,
    pub report_interval: Option<i64>,
    pub report_flags: Option<i64>,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
    pub enable_nodeport: bool,
    pub enable_ipsec: bool,
    pub enable_arp_responder: bool,
    pub enable_masquerade: bool,
    pub enable_session_affinity: bool,
    pub enable_sockops: bool,
    pub enable_nat46: bool,
    pub encap_mode: EncapMode,
    /// Zero derives the MTU from the native device.
    pub mtu: u32,
    pub nodeport_port_range: (u16, u16),
    pub nat_port_max: u16,
    pub naming_profile: NamingProfile,
    pub map_size_ceiling: u32,
    pub monitor_aggregation: MonitorAggregation,
    pub monitor_flags: Vec<String>,
    pub ephemeral_port_min: u16,
    pub debug: bool,
    pub nat46_prefix: Ipv6Addr,
    pub ipv4_loopback: Ipv4Addr,
    pub scale_hints: ScaleHints,
    pub devices: DeviceNames,
    pub timeouts: TimeoutDefaults,
    pub timeout_overrides: BTreeMap<String, i64>,
    pub map_sizes: BTreeMap<MapKind, u32>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enable_ipv4: true,
            enable_ipv6: false,
            enable_nodeport: false,
            enable_ipsec: false,
            enable_arp_responder: false,
            enable_masquerade: false,
            enable_session_affinity: false,
            enable_sockops: false,
            enable_nat46: false,
            encap_mode: EncapMode::default(),
            mtu: 0,
            nodeport_port_range: (DEFAULT_NODEPORT_MIN, DEFAULT_NODEPORT_MAX),
            nat_port_max: DEFAULT_NAT_PORT_MAX,
            naming_profile: NamingProfile::default(),
            map_size_ceiling: DEFAULT_MAP_SIZE_CEILING,
            monitor_aggregation: MonitorAggregation::default(),
            monitor_flags: Vec::new(),
            ephemeral_port_min: DEFAULT_EPHEMERAL_PORT_MIN,
            debug: false,
            nat46_prefix: Ipv6Addr::new(0x64, 0xff9b, 0, 0, 0, 0, 0, 0),
            ipv4_loopback: Ipv4Addr::new(169, 254, 42, 1),
            scale_hints: ScaleHints::default(),
            devices: DeviceNames::default(),
            timeouts: TimeoutDefaults::default(),
            timeout_overrides: BTreeMap::new(),
            map_sizes: BTreeMap::new(),
        }
    }
}

impl ClusterConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("invalid config at {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: ClusterConfig = toml::from_str(raw).context("failed to parse config")?;
        Ok(config)
    }

    /// Features explicitly requested by configuration, before propagation.
    pub fn requested_features(&self) -> BTreeSet<Feature> {
        let mut requested = BTreeSet::new();
        let toggles = [
            (self.enable_ipv4, Feature::Ipv4),
            (self.enable_ipv6, Feature::Ipv6),
            (self.enable_nodeport, Feature::NodePort),
            (self.enable_ipsec, Feature::Ipsec),
            (self.enable_arp_responder, Feature::ArpResponder),
            (self.enable_masquerade, Feature::Masquerade),
            (self.enable_session_affinity, Feature::SessionAffinity),
            (self.enable_sockops, Feature::SockOps),
            (self.enable_nat46, Feature::Nat46),
        ];
        for (enabled, feature) in toggles {
            if enabled {
                requested.insert(feature);
            }
        }
        match self.encap_mode {
            EncapMode::Geneve => {
                requested.insert(Feature::EncapGeneve);
            }
            EncapMode::Vxlan => {
                requested.insert(Feature::EncapVxlan);
            }
            EncapMode::Disabled => {}
        }
        requested
    }

    /// Structural checks that do not depend on node state.
    pub fn check(&self) -> std::result::Result<(), SynthError> {
        let (min, max) = self.nodeport_port_range;
        if min == 0 || min > max {
            return Err(SynthError::InvalidConfig(format!(
                "nodeport_port_range ({min}, {max}) must be a non-empty range of non-zero ports"
            )));
        }
        if self.enable_nodeport && self.nat_port_max <= max {
            return Err(SynthError::InvalidConfig(format!(
                "nat_port_max {} must be above the NodePort maximum {max}",
                self.nat_port_max
            )));
        }
        if self.map_size_ceiling == 0 {
            return Err(SynthError::InvalidConfig(
                "map_size_ceiling must be greater than zero".to_string(),
            ));
        }
        if let Some((kind, _)) = self.map_sizes.iter().find(|(_, size)| **size == 0) {
            return Err(SynthError::InvalidConfig(format!(
                "map_sizes.{kind} must be greater than zero"
            )));
        }
        for (role, name) in [
            ("host", &self.devices.host),
            ("internal", &self.devices.internal),
            ("native", &self.devices.native),
        ] {
            if name.trim().is_empty() {
                return Err(SynthError::InvalidConfig(format!(
                    "devices.{role} must name an interface"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let raw = r#"
            enable_ipv4 = true
            enable_ipv6 = true
            enable_nodeport = true
            encap_mode = "vxlan"
            mtu = 1450
            nodeport_port_range = [30000, 32767]
            nat_port_max = 43835
            naming_profile = "test"
            monitor_aggregation = "maximum"
            monitor_flags = ["syn", "fin"]

            [scale_hints]
            endpoints = 200
            nodes = 50

            [devices]
            native = "ens5"
            lb_redirect = "lb0"

            [timeouts]
            syn_timeout = 30

            [timeout_overrides]
            close_timeout = 5

            [map_sizes]
            conntrack_tcp = 1024
        "#;
        let cfg = ClusterConfig::from_toml(raw).unwrap();
        assert_eq!(cfg.encap_mode, EncapMode::Vxlan);
        assert_eq!(cfg.naming_profile, NamingProfile::Test);
        assert_eq!(cfg.scale_hints.endpoints, 200);
        assert_eq!(cfg.scale_hints.connections, 0);
        assert_eq!(cfg.devices.native, "ens5");
        assert_eq!(cfg.devices.host, "cilium_host");
        assert_eq!(cfg.timeouts.syn_timeout, Some(30));
        assert_eq!(cfg.timeout_overrides.get("close_timeout"), Some(&5));
        assert_eq!(cfg.map_sizes.get(&MapKind::ConntrackTcp), Some(&1024));
        assert_eq!(cfg.monitor_aggregation.level(), 3);
        cfg.check().unwrap();
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(ClusterConfig::from_toml("enable_ipv5 = true").is_err());
    }

    #[test]
    fn requested_features_follow_flags() {
        let cfg = ClusterConfig {
            enable_ipv6: true,
            enable_nodeport: true,
            encap_mode: EncapMode::Disabled,
            ..Default::default()
        };
        let features = cfg.requested_features();
        assert!(features.contains(&Feature::Ipv4));
        assert!(features.contains(&Feature::Ipv6));
        assert!(features.contains(&Feature::NodePort));
        assert!(!features.contains(&Feature::EncapGeneve));
        assert!(!features.contains(&Feature::Conntrack));
    }

    #[test]
    fn check_rejects_inverted_port_range() {
        let cfg = ClusterConfig {
            nodeport_port_range: (32767, 30000),
            ..Default::default()
        };
        assert!(matches!(cfg.check(), Err(SynthError::InvalidConfig(_))));
    }

    #[test]
    fn check_rejects_nat_max_inside_nodeport_range() {
        let cfg = ClusterConfig {
            enable_nodeport: true,
            nat_port_max: DEFAULT_NODEPORT_MAX,
            ..Default::default()
        };
        assert!(matches!(cfg.check(), Err(SynthError::InvalidConfig(_))));
    }

    #[test]
    fn check_rejects_zero_map_size_override() {
        let mut cfg = ClusterConfig::default();
        cfg.map_sizes.insert(MapKind::IpCache, 0);
        assert!(matches!(cfg.check(), Err(SynthError::InvalidConfig(_))));
    }

    #[test]
    fn encap_device_follows_mode() {
        let devices = DeviceNames::default();
        assert_eq!(
            devices.encap_device(EncapMode::Geneve).as_deref(),
            Some("cilium_geneve")
        );
        assert_eq!(devices.encap_device(EncapMode::Disabled), None);
        let custom = DeviceNames {
            encap: Some("tun0".to_string()),
            ..Default::default()
        };
        assert_eq!(custom.encap_device(EncapMode::Vxlan).as_deref(), Some("tun0"));
        assert_eq!(custom.encap_device(EncapMode::Disabled), None);
    }
}
