#![no_std]

// Fixed-layout types shared between the configuration synthesizer and the
// datapath programs that consume its output.
// Keep this crate `no_std` friendly so it can be used from eBPF code.

use core::fmt;
use core::str::FromStr;

pub const FEATURE_IPV4: u32 = 1 << 0;
pub const FEATURE_IPV6: u32 = 1 << 1;
pub const FEATURE_NODEPORT: u32 = 1 << 2;
pub const FEATURE_IPSEC: u32 = 1 << 3;
pub const FEATURE_ARP_RESPONDER: u32 = 1 << 4;
pub const FEATURE_TUNNEL: u32 = 1 << 5;
pub const FEATURE_ENCAP_GENEVE: u32 = 1 << 6;
pub const FEATURE_ENCAP_VXLAN: u32 = 1 << 7;
pub const FEATURE_CONNTRACK: u32 = 1 << 8;
pub const FEATURE_CONNTRACK_ACCOUNTING: u32 = 1 << 9;
pub const FEATURE_MASQUERADE: u32 = 1 << 10;
pub const FEATURE_SESSION_AFFINITY: u32 = 1 << 11;
pub const FEATURE_SOCK_OPS: u32 = 1 << 12;
pub const FEATURE_NAT46: u32 = 1 << 13;

/// Size in bytes of the encoded [`RuntimeConfig`] block.
pub const RUNTIME_CONFIG_SIZE: usize = 64;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct MacAddr {
    pub addr: [u8; 6],
}

impl MacAddr {
    pub const fn new(addr: [u8; 6]) -> Self {
        Self { addr }
    }

    pub fn is_zero(&self) -> bool {
        self.addr == [0; 6]
    }

    pub fn is_multicast(&self) -> bool {
        self.addr[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.addr;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ParseMacError;

impl fmt::Display for ParseMacError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("expected six colon-separated hex octets")
    }
}

impl FromStr for MacAddr {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addr = [0u8; 6];
        let mut parts = s.trim().split(':');
        for slot in addr.iter_mut() {
            let part = parts.next().ok_or(ParseMacError)?;
            if part.is_empty() || part.len() > 2 {
                return Err(ParseMacError);
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| ParseMacError)?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError);
        }
        Ok(Self { addr })
    }
}

/// Runtime block written into the datapath's configuration array map.
///
/// Layout is part of the datapath ABI: 64 bytes, 8-byte aligned, encoded
/// little-endian by [`RuntimeConfig::to_le_bytes`].
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RuntimeConfig {
    pub generation: u64,
    pub feature_bits: u32,
    pub mtu: u32,
    pub nodeport_min: u16,
    pub nodeport_max: u16,
    pub nat_min: u16,
    pub nat_max: u16,
    pub ct_lifetime_tcp: u32,
    pub ct_lifetime_nontcp: u32,
    pub svc_lifetime_tcp: u32,
    pub svc_lifetime_nontcp: u32,
    pub syn_timeout: u32,
    pub close_timeout: u32,
    pub report_interval: u32,
    pub report_flags: u8,
    pub monitor_aggregation: u8,
    pub node_mac: MacAddr,
    pub reserved: [u8; 4],
}

impl RuntimeConfig {
    pub fn has_feature(&self, bit: u32) -> bool {
        self.feature_bits & bit != 0
    }

    pub fn to_le_bytes(&self) -> [u8; RUNTIME_CONFIG_SIZE] {
        let mut out = [0u8; RUNTIME_CONFIG_SIZE];
        out[0..8].copy_from_slice(&self.generation.to_le_bytes());
        out[8..12].copy_from_slice(&self.feature_bits.to_le_bytes());
        out[12..16].copy_from_slice(&self.mtu.to_le_bytes());
        out[16..18].copy_from_slice(&self.nodeport_min.to_le_bytes());
        out[18..20].copy_from_slice(&self.nodeport_max.to_le_bytes());
        out[20..22].copy_from_slice(&self.nat_min.to_le_bytes());
        out[22..24].copy_from_slice(&self.nat_max.to_le_bytes());
        let timeouts = [
            self.ct_lifetime_tcp,
            self.ct_lifetime_nontcp,
            self.svc_lifetime_tcp,
            self.svc_lifetime_nontcp,
            self.syn_timeout,
            self.close_timeout,
            self.report_interval,
        ];
        for (idx, value) in timeouts.iter().enumerate() {
            let start = 24 + idx * 4;
            out[start..start + 4].copy_from_slice(&value.to_le_bytes());
        }
        out[52] = self.report_flags;
        out[53] = self.monitor_aggregation;
        out[54..60].copy_from_slice(&self.node_mac.addr);
        out[60..64].copy_from_slice(&self.reserved);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem;

    #[test]
    fn runtime_config_layout() {
        assert_eq!(mem::size_of::<RuntimeConfig>(), RUNTIME_CONFIG_SIZE);
        assert_eq!(mem::align_of::<RuntimeConfig>(), 8);
        assert_eq!(mem::size_of::<MacAddr>(), 6);
    }

    #[test]
    fn runtime_config_encodes_little_endian() {
        let cfg = RuntimeConfig {
            generation: 7,
            feature_bits: FEATURE_IPV4 | FEATURE_NODEPORT,
            mtu: 1500,
            nodeport_min: 30000,
            nodeport_max: 32767,
            nat_min: 32768,
            nat_max: 43835,
            report_flags: 0xff,
            node_mac: MacAddr::new([0xde, 0xad, 0xbe, 0xef, 0xc0, 0xde]),
            ..Default::default()
        };
        let bytes = cfg.to_le_bytes();
        assert_eq!(bytes[0], 7);
        assert_eq!(&bytes[8..12], &(FEATURE_IPV4 | FEATURE_NODEPORT).to_le_bytes());
        assert_eq!(&bytes[12..16], &1500u32.to_le_bytes());
        assert_eq!(&bytes[20..22], &32768u16.to_le_bytes());
        assert_eq!(bytes[52], 0xff);
        assert_eq!(&bytes[54..60], &[0xde, 0xad, 0xbe, 0xef, 0xc0, 0xde]);
        assert!(cfg.has_feature(FEATURE_NODEPORT));
        assert!(!cfg.has_feature(FEATURE_IPV6));
    }

    #[test]
    fn mac_parses_and_formats() {
        let mac: MacAddr = "ce:72:a7:03:88:56".parse().unwrap();
        assert_eq!(mac.addr, [0xce, 0x72, 0xa7, 0x03, 0x88, 0x56]);
        let mut buf = [0u8; 17];
        let mut writer = SliceWriter { buf: &mut buf, len: 0 };
        fmt::write(&mut writer, format_args!("{mac}")).unwrap();
        assert_eq!(&buf[..], b"ce:72:a7:03:88:56");
    }

    #[test]
    fn mac_rejects_malformed_input() {
        assert!("ce:72:a7:03:88".parse::<MacAddr>().is_err());
        assert!("ce:72:a7:03:88:56:01".parse::<MacAddr>().is_err());
        assert!("ce:72:a7:03:88:zz".parse::<MacAddr>().is_err());
        assert!("ce:72:a7:03:88:".parse::<MacAddr>().is_err());
        assert!("".parse::<MacAddr>().is_err());
    }

    #[test]
    fn mac_flags() {
        assert!(MacAddr::default().is_zero());
        assert!(MacAddr::new([0x01, 0, 0x5e, 0, 0, 1]).is_multicast());
        assert!(!MacAddr::new([0xce, 0x72, 0xa7, 0x03, 0x88, 0x56]).is_multicast());
    }

    struct SliceWriter<'a> {
        buf: &'a mut [u8],
        len: usize,
    }

    impl fmt::Write for SliceWriter<'_> {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            let bytes = s.as_bytes();
            let end = self.len + bytes.len();
            if end > self.buf.len() {
                return Err(fmt::Error);
            }
            self.buf[self.len..end].copy_from_slice(bytes);
            self.len = end;
            Ok(())
        }
    }
}
