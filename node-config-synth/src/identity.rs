use std::{
    collections::BTreeMap,
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
};

use anyhow::anyhow;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use node_config_common::MacAddr;
use serde::{Deserialize, Serialize};

use crate::config::ClusterConfig;
use crate::error::{Result, SynthError};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    Host,
    Internal,
    Native,
    Encap,
    LbRedirect,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceRole::Host => "host",
            DeviceRole::Internal => "internal",
            DeviceRole::Native => "native",
            DeviceRole::Encap => "encapsulation",
            DeviceRole::LbRedirect => "lb-redirect",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => f.write_str("IPv4"),
            AddressFamily::Ipv6 => f.write_str("IPv6"),
        }
    }
}

/// One interface as seen by a probe.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct InterfaceObservation {
    pub index: u32,
    pub mac: Option<MacAddr>,
    pub mtu: Option<u32>,
    pub addresses: Vec<IpNet>,
}

impl InterfaceObservation {
    fn first_ipv4(&self) -> Option<Ipv4Net> {
        self.addresses.iter().find_map(|net| match net {
            IpNet::V4(v4) if usable_ipv4(v4.addr()) => Some(*v4),
            _ => None,
        })
    }

    fn first_ipv6(&self) -> Option<Ipv6Net> {
        self.addresses.iter().find_map(|net| match net {
            IpNet::V6(v6) if usable_ipv6(v6.addr()) => Some(*v6),
            _ => None,
        })
    }
}

/// Snapshot of the node's interfaces keyed by name.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct InterfaceObservations {
    pub interfaces: BTreeMap<String, InterfaceObservation>,
}

impl InterfaceObservations {
    pub fn get(&self, name: &str) -> Option<&InterfaceObservation> {
        self.interfaces.get(name)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_mac: MacAddr,
    pub native_mac: MacAddr,
    pub internal_mac: MacAddr,
    pub lb_redirect_mac: Option<MacAddr>,
    pub router_ipv4: Option<Ipv4Addr>,
    pub host_ipv4: Option<Ipv4Addr>,
    pub ipv4_mask: Option<Ipv4Addr>,
    pub ipv4_loopback: Option<Ipv4Addr>,
    pub router_ipv6: Option<Ipv6Addr>,
    pub host_ipv6: Option<Ipv6Addr>,
    pub nat46_prefix: Option<Ipv6Addr>,
    pub encap_ifindex: Option<u32>,
    pub host_ifindex: u32,
    pub internal_ifindex: u32,
    pub native_ifindex: u32,
    pub native_mtu: Option<u32>,
}

/// Parses a textual MAC, rejecting values that cannot identify a node.
pub fn parse_mac(raw: &str) -> anyhow::Result<MacAddr> {
    let mac: MacAddr = raw
        .parse()
        .map_err(|err| anyhow!("invalid MAC address {raw:?}: {err}"))?;
    if mac.is_zero() || mac.is_multicast() {
        return Err(anyhow!("MAC address {raw:?} is not a unicast address"));
    }
    Ok(mac)
}

fn usable_ipv4(addr: Ipv4Addr) -> bool {
    !(addr.is_loopback() || addr.is_unspecified() || addr.is_link_local() || addr.is_multicast())
}

fn usable_ipv6(addr: Ipv6Addr) -> bool {
    let link_local = (addr.segments()[0] & 0xffc0) == 0xfe80;
    !(addr.is_loopback() || addr.is_unspecified() || addr.is_multicast() || link_local)
}

fn lookup<'a>(
    observations: &'a InterfaceObservations,
    role: DeviceRole,
    name: &str,
) -> Result<&'a InterfaceObservation> {
    let iface = observations
        .get(name)
        .ok_or_else(|| SynthError::MissingInterface {
            role,
            name: name.to_string(),
            detail: "interface not present",
        })?;
    if iface.index == 0 {
        return Err(SynthError::MissingInterface {
            role,
            name: name.to_string(),
            detail: "interface has no index",
        });
    }
    Ok(iface)
}

fn unicast_mac(iface: &InterfaceObservation, role: DeviceRole, name: &str) -> Result<MacAddr> {
    match iface.mac {
        Some(mac) if !mac.is_zero() && !mac.is_multicast() => Ok(mac),
        _ => Err(SynthError::MissingInterface {
            role,
            name: name.to_string(),
            detail: "no unicast MAC address",
        }),
    }
}

fn require<T>(value: Option<T>, role: DeviceRole, name: &str, family: AddressFamily) -> Result<T> {
    value.ok_or_else(|| SynthError::UnsupportedFamily {
        role,
        name: name.to_string(),
        family,
    })
}

/// Builds the node identity for the configured devices.
pub fn resolve(config: &ClusterConfig, observations: &InterfaceObservations) -> Result<NodeIdentity> {
    let devices = &config.devices;
    let host = lookup(observations, DeviceRole::Host, &devices.host)?;
    let internal = lookup(observations, DeviceRole::Internal, &devices.internal)?;
    let native = lookup(observations, DeviceRole::Native, &devices.native)?;

    let encap_ifindex = match devices.encap_device(config.encap_mode) {
        Some(name) => Some(lookup(observations, DeviceRole::Encap, &name)?.index),
        None => None,
    };

    let lb_redirect_mac = match devices.lb_redirect.as_deref() {
        Some(name) => {
            let iface = lookup(observations, DeviceRole::LbRedirect, name)?;
            Some(unicast_mac(iface, DeviceRole::LbRedirect, name)?)
        }
        None => None,
    };

    let mut identity = NodeIdentity {
        node_mac: unicast_mac(host, DeviceRole::Host, &devices.host)?,
        native_mac: unicast_mac(native, DeviceRole::Native, &devices.native)?,
        internal_mac: unicast_mac(internal, DeviceRole::Internal, &devices.internal)?,
        lb_redirect_mac,
        router_ipv4: None,
        host_ipv4: None,
        ipv4_mask: None,
        ipv4_loopback: None,
        router_ipv6: None,
        host_ipv6: None,
        nat46_prefix: None,
        encap_ifindex,
        host_ifindex: host.index,
        internal_ifindex: internal.index,
        native_ifindex: native.index,
        native_mtu: native.mtu,
    };

    if config.enable_ipv4 {
        let router = require(host.first_ipv4(), DeviceRole::Host, &devices.host, AddressFamily::Ipv4)?;
        let host_addr = require(
            native.first_ipv4(),
            DeviceRole::Native,
            &devices.native,
            AddressFamily::Ipv4,
        )?;
        identity.router_ipv4 = Some(router.addr());
        identity.ipv4_mask = Some(router.netmask());
        identity.host_ipv4 = Some(host_addr.addr());
        identity.ipv4_loopback = Some(config.ipv4_loopback);
    }

    if config.enable_ipv6 {
        let router = require(host.first_ipv6(), DeviceRole::Host, &devices.host, AddressFamily::Ipv6)?;
        let host_addr = require(
            native.first_ipv6(),
            DeviceRole::Native,
            &devices.native,
            AddressFamily::Ipv6,
        )?;
        identity.router_ipv6 = Some(router.addr());
        identity.host_ipv6 = Some(host_addr.addr());
        identity.nat46_prefix = Some(config.nat46_prefix);
    }

    Ok(identity)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::EncapMode;

    fn iface(index: u32, mac: [u8; 6], addresses: &[&str]) -> InterfaceObservation {
        InterfaceObservation {
            index,
            mac: Some(MacAddr::new(mac)),
            mtu: Some(1500),
            addresses: addresses.iter().map(|a| a.parse().unwrap()).collect(),
        }
    }

    /// Observations matching the reference node used across the test suite.
    pub(crate) fn sample_observations() -> InterfaceObservations {
        let mut interfaces = BTreeMap::new();
        interfaces.insert(
            "cilium_host".to_string(),
            iface(
                4,
                [0xde, 0xad, 0xbe, 0xef, 0xc0, 0xde],
                &["10.245.255.255/16", "fe80::1/64", "beef::1:0:1:1:0/64"],
            ),
        );
        interfaces.insert(
            "cilium_net".to_string(),
            iface(3, [0xce, 0x72, 0xa7, 0x03, 0x88, 0x57], &[]),
        );
        interfaces.insert(
            "eth0".to_string(),
            iface(
                2,
                [0xce, 0x72, 0xa7, 0x03, 0x88, 0x56],
                &["192.168.1.10/24", "beef::1:0:a00:20f:ffff/64"],
            ),
        );
        interfaces.insert(
            "cilium_geneve".to_string(),
            iface(5, [0xce, 0x72, 0xa7, 0x03, 0x88, 0x59], &[]),
        );
        InterfaceObservations { interfaces }
    }

    #[test]
    fn resolves_dual_stack_identity() {
        let config = ClusterConfig {
            enable_ipv6: true,
            ..Default::default()
        };
        let identity = resolve(&config, &sample_observations()).unwrap();
        assert_eq!(identity.node_mac.addr, [0xde, 0xad, 0xbe, 0xef, 0xc0, 0xde]);
        assert_eq!(identity.host_ifindex, 4);
        assert_eq!(identity.native_ifindex, 2);
        assert_eq!(identity.internal_ifindex, 3);
        assert_eq!(identity.encap_ifindex, Some(5));
        assert_eq!(identity.router_ipv4, Some(Ipv4Addr::new(10, 245, 255, 255)));
        assert_eq!(identity.ipv4_mask, Some(Ipv4Addr::new(255, 255, 0, 0)));
        assert_eq!(identity.host_ipv4, Some(Ipv4Addr::new(192, 168, 1, 10)));
        // link-local addresses are skipped
        assert_eq!(identity.router_ipv6, Some("beef::1:0:1:1:0".parse().unwrap()));
        assert_eq!(identity.nat46_prefix, Some(config.nat46_prefix));
        assert_eq!(identity.native_mtu, Some(1500));
    }

    #[test]
    fn ipv4_only_leaves_ipv6_unset() {
        let identity = resolve(&ClusterConfig::default(), &sample_observations()).unwrap();
        assert!(identity.router_ipv6.is_none());
        assert!(identity.nat46_prefix.is_none());
        assert!(identity.router_ipv4.is_some());
    }

    #[test]
    fn missing_native_device_is_reported() {
        let mut observations = sample_observations();
        observations.interfaces.remove("eth0");
        let err = resolve(&ClusterConfig::default(), &observations).unwrap_err();
        match err {
            SynthError::MissingInterface { role, name, .. } => {
                assert_eq!(role, DeviceRole::Native);
                assert_eq!(name, "eth0");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn encap_device_only_required_with_tunnel() {
        let mut observations = sample_observations();
        observations.interfaces.remove("cilium_geneve");
        assert!(matches!(
            resolve(&ClusterConfig::default(), &observations),
            Err(SynthError::MissingInterface {
                role: DeviceRole::Encap,
                ..
            })
        ));
        let direct = ClusterConfig {
            encap_mode: EncapMode::Disabled,
            ..Default::default()
        };
        let identity = resolve(&direct, &observations).unwrap();
        assert_eq!(identity.encap_ifindex, None);
    }

    #[test]
    fn missing_family_address_is_unsupported() {
        let mut observations = sample_observations();
        observations
            .interfaces
            .get_mut("eth0")
            .unwrap()
            .addresses
            .retain(|net| matches!(net, IpNet::V4(_)));
        let config = ClusterConfig {
            enable_ipv6: true,
            ..Default::default()
        };
        match resolve(&config, &observations).unwrap_err() {
            SynthError::UnsupportedFamily { family, role, .. } => {
                assert_eq!(family, AddressFamily::Ipv6);
                assert_eq!(role, DeviceRole::Native);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn zero_mac_is_rejected() {
        let mut observations = sample_observations();
        observations.interfaces.get_mut("cilium_net").unwrap().mac = Some(MacAddr::default());
        assert!(matches!(
            resolve(&ClusterConfig::default(), &observations),
            Err(SynthError::MissingInterface {
                role: DeviceRole::Internal,
                ..
            })
        ));
    }

    #[test]
    fn parse_mac_validates_unicast() {
        assert_eq!(
            parse_mac("ce:72:a7:03:88:58").unwrap().addr,
            [0xce, 0x72, 0xa7, 0x03, 0x88, 0x58]
        );
        assert!(parse_mac("00:00:00:00:00:00").is_err());
        assert!(parse_mac("01:00:5e:00:00:01").is_err());
        assert!(parse_mac("not-a-mac").is_err());
    }
}
