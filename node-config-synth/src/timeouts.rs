use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TimeoutDefaults;
use crate::error::{Result, SynthError};
use crate::features::{Feature, FeatureSet};

pub const DEFAULT_CONNECTION_LIFETIME_TCP: u32 = 21600;
pub const DEFAULT_CONNECTION_LIFETIME_NONTCP: u32 = 60;
pub const DEFAULT_SERVICE_LIFETIME_TCP: u32 = 21600;
pub const DEFAULT_SERVICE_LIFETIME_NONTCP: u32 = 60;
pub const DEFAULT_SYN_TIMEOUT: u32 = 60;
pub const DEFAULT_CLOSE_TIMEOUT: u32 = 10;
pub const DEFAULT_REPORT_INTERVAL: u32 = 5;
pub const DEFAULT_REPORT_FLAGS: u8 = 0xff;

// TCP header flag bits used for monitor reporting.
const TCP_FIN: u8 = 0x01;
const TCP_SYN: u8 = 0x02;
const TCP_RST: u8 = 0x04;
const TCP_PSH: u8 = 0x08;
const TCP_ACK: u8 = 0x10;
const TCP_URG: u8 = 0x20;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum TimeoutField {
    ConnectionLifetimeTcp,
    ConnectionLifetimeNonTcp,
    ServiceLifetimeTcp,
    ServiceLifetimeNonTcp,
    SynTimeout,
    CloseTimeout,
    ReportInterval,
    ReportFlags,
}

impl TimeoutField {
    pub const ALL: [TimeoutField; 8] = [
        TimeoutField::ConnectionLifetimeTcp,
        TimeoutField::ConnectionLifetimeNonTcp,
        TimeoutField::ServiceLifetimeTcp,
        TimeoutField::ServiceLifetimeNonTcp,
        TimeoutField::SynTimeout,
        TimeoutField::CloseTimeout,
        TimeoutField::ReportInterval,
        TimeoutField::ReportFlags,
    ];

    pub fn key(self) -> &'static str {
        match self {
            TimeoutField::ConnectionLifetimeTcp => "connection_lifetime_tcp",
            TimeoutField::ConnectionLifetimeNonTcp => "connection_lifetime_nontcp",
            TimeoutField::ServiceLifetimeTcp => "service_lifetime_tcp",
            TimeoutField::ServiceLifetimeNonTcp => "service_lifetime_nontcp",
            TimeoutField::SynTimeout => "syn_timeout",
            TimeoutField::CloseTimeout => "close_timeout",
            TimeoutField::ReportInterval => "report_interval",
            TimeoutField::ReportFlags => "report_flags",
        }
    }

    fn default_value(self) -> i64 {
        let value = match self {
            TimeoutField::ConnectionLifetimeTcp => DEFAULT_CONNECTION_LIFETIME_TCP,
            TimeoutField::ConnectionLifetimeNonTcp => DEFAULT_CONNECTION_LIFETIME_NONTCP,
            TimeoutField::ServiceLifetimeTcp => DEFAULT_SERVICE_LIFETIME_TCP,
            TimeoutField::ServiceLifetimeNonTcp => DEFAULT_SERVICE_LIFETIME_NONTCP,
            TimeoutField::SynTimeout => DEFAULT_SYN_TIMEOUT,
            TimeoutField::CloseTimeout => DEFAULT_CLOSE_TIMEOUT,
            TimeoutField::ReportInterval => DEFAULT_REPORT_INTERVAL,
            TimeoutField::ReportFlags => u32::from(DEFAULT_REPORT_FLAGS),
        };
        i64::from(value)
    }

    fn cluster_default(self, defaults: &TimeoutDefaults) -> Option<i64> {
        match self {
            TimeoutField::ConnectionLifetimeTcp => defaults.connection_lifetime_tcp,
            TimeoutField::ConnectionLifetimeNonTcp => defaults.connection_lifetime_nontcp,
            TimeoutField::ServiceLifetimeTcp => defaults.service_lifetime_tcp,
            TimeoutField::ServiceLifetimeNonTcp => defaults.service_lifetime_nontcp,
            TimeoutField::SynTimeout => defaults.syn_timeout,
            TimeoutField::CloseTimeout => defaults.close_timeout,
            TimeoutField::ReportInterval => defaults.report_interval,
            TimeoutField::ReportFlags => defaults.report_flags,
        }
    }
}

impl fmt::Display for TimeoutField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for TimeoutField {
    type Err = SynthError;

    fn from_str(s: &str) -> Result<Self> {
        TimeoutField::ALL
            .into_iter()
            .find(|field| field.key() == s)
            .ok_or_else(|| SynthError::invalid_timeout(s, "unknown timeout field"))
    }
}

/// Connection-tracking timeouts in seconds plus the monitor report mask.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    pub connection_lifetime_tcp: u32,
    pub connection_lifetime_nontcp: u32,
    pub service_lifetime_tcp: u32,
    pub service_lifetime_nontcp: u32,
    pub syn_timeout: u32,
    pub close_timeout: u32,
    pub report_interval: u32,
    pub report_flags: u8,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            connection_lifetime_tcp: DEFAULT_CONNECTION_LIFETIME_TCP,
            connection_lifetime_nontcp: DEFAULT_CONNECTION_LIFETIME_NONTCP,
            service_lifetime_tcp: DEFAULT_SERVICE_LIFETIME_TCP,
            service_lifetime_nontcp: DEFAULT_SERVICE_LIFETIME_NONTCP,
            syn_timeout: DEFAULT_SYN_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            report_interval: DEFAULT_REPORT_INTERVAL,
            report_flags: DEFAULT_REPORT_FLAGS,
        }
    }
}

impl TimeoutPolicy {
    /// Field values in declaration order, widened for uniform checks.
    pub fn values(&self) -> [(TimeoutField, u32); 8] {
        [
            (TimeoutField::ConnectionLifetimeTcp, self.connection_lifetime_tcp),
            (TimeoutField::ConnectionLifetimeNonTcp, self.connection_lifetime_nontcp),
            (TimeoutField::ServiceLifetimeTcp, self.service_lifetime_tcp),
            (TimeoutField::ServiceLifetimeNonTcp, self.service_lifetime_nontcp),
            (TimeoutField::SynTimeout, self.syn_timeout),
            (TimeoutField::CloseTimeout, self.close_timeout),
            (TimeoutField::ReportInterval, self.report_interval),
            (TimeoutField::ReportFlags, u32::from(self.report_flags)),
        ]
    }

    fn set(&mut self, field: TimeoutField, value: u32) {
        match field {
            TimeoutField::ConnectionLifetimeTcp => self.connection_lifetime_tcp = value,
            TimeoutField::ConnectionLifetimeNonTcp => self.connection_lifetime_nontcp = value,
            TimeoutField::ServiceLifetimeTcp => self.service_lifetime_tcp = value,
            TimeoutField::ServiceLifetimeNonTcp => self.service_lifetime_nontcp = value,
            TimeoutField::SynTimeout => self.syn_timeout = value,
            TimeoutField::CloseTimeout => self.close_timeout = value,
            TimeoutField::ReportInterval => self.report_interval = value,
            // range checked by `checked_value`
            TimeoutField::ReportFlags => self.report_flags = value as u8,
        }
    }
}

/// Converts `monitor_flags` names into a report mask.
pub fn report_flags_from_names(names: &[String]) -> Result<Option<u8>> {
    if names.is_empty() {
        return Ok(None);
    }
    let mut mask = 0u8;
    for name in names {
        mask |= match name.trim().to_ascii_lowercase().as_str() {
            "fin" => TCP_FIN,
            "syn" => TCP_SYN,
            "rst" => TCP_RST,
            "psh" => TCP_PSH,
            "ack" => TCP_ACK,
            "urg" => TCP_URG,
            "all" => 0xff,
            _ => {
                return Err(SynthError::invalid_timeout(
                    TimeoutField::ReportFlags.key(),
                    format!("unknown monitor flag {name:?}"),
                ))
            }
        };
    }
    Ok(Some(mask))
}

fn checked_value(field: TimeoutField, value: i64) -> Result<u32> {
    if value <= 0 {
        return Err(SynthError::invalid_timeout(
            field.key(),
            format!("{value} is not strictly positive"),
        ));
    }
    let limit = match field {
        TimeoutField::ReportFlags => i64::from(u8::MAX),
        _ => i64::from(u32::MAX),
    };
    if value > limit {
        return Err(SynthError::invalid_timeout(
            field.key(),
            format!("{value} exceeds the maximum of {limit}"),
        ));
    }
    Ok(value as u32)
}

const CONNTRACK_FIELDS: [TimeoutField; 6] = [
    TimeoutField::ConnectionLifetimeTcp,
    TimeoutField::ConnectionLifetimeNonTcp,
    TimeoutField::ServiceLifetimeTcp,
    TimeoutField::ServiceLifetimeNonTcp,
    TimeoutField::SynTimeout,
    TimeoutField::CloseTimeout,
];

/// Merges built-in defaults, cluster defaults, monitor flag names and
/// per-node overrides, in that order of increasing precedence.
pub fn resolve(
    defaults: &TimeoutDefaults,
    monitor_flags: &[String],
    overrides: &BTreeMap<String, i64>,
    features: &FeatureSet,
) -> Result<TimeoutPolicy> {
    let mut merged: BTreeMap<TimeoutField, i64> = TimeoutField::ALL
        .into_iter()
        .map(|field| {
            let value = field
                .cluster_default(defaults)
                .unwrap_or_else(|| field.default_value());
            (field, value)
        })
        .collect();

    if let Some(mask) = report_flags_from_names(monitor_flags)? {
        merged.insert(TimeoutField::ReportFlags, i64::from(mask));
    }

    for (key, value) in overrides {
        let field: TimeoutField = key.parse()?;
        if !features.is_enabled(Feature::Conntrack) && CONNTRACK_FIELDS.contains(&field) {
            debug!(field = %field, "timeout override has no effect without conntrack");
        }
        merged.insert(field, *value);
    }

    let mut policy = TimeoutPolicy::default();
    for (field, value) in merged {
        policy.set(field, checked_value(field, value)?);
    }
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conntrack() -> FeatureSet {
        FeatureSet::from_enabled([
            Feature::Ipv4,
            Feature::NodePort,
            Feature::Conntrack,
            Feature::ConntrackAccounting,
        ])
    }

    #[test]
    fn defaults_match_reference_values() {
        let policy = resolve(
            &TimeoutDefaults::default(),
            &[],
            &BTreeMap::new(),
            &conntrack(),
        )
        .unwrap();
        assert_eq!(policy, TimeoutPolicy::default());
        assert_eq!(policy.connection_lifetime_tcp, 21600);
        assert_eq!(policy.close_timeout, 10);
        assert_eq!(policy.report_flags, 0xff);
    }

    #[test]
    fn overrides_take_precedence_over_cluster_defaults() {
        let defaults = TimeoutDefaults {
            syn_timeout: Some(30),
            close_timeout: Some(20),
            ..Default::default()
        };
        let overrides = BTreeMap::from([("close_timeout".to_string(), 5)]);
        let policy = resolve(&defaults, &[], &overrides, &conntrack()).unwrap();
        assert_eq!(policy.syn_timeout, 30);
        assert_eq!(policy.close_timeout, 5);
        assert_eq!(policy.report_interval, DEFAULT_REPORT_INTERVAL);
    }

    #[test]
    fn zero_override_is_rejected() {
        let overrides = BTreeMap::from([("syn_timeout".to_string(), 0)]);
        let err = resolve(&TimeoutDefaults::default(), &[], &overrides, &conntrack()).unwrap_err();
        match err {
            SynthError::InvalidTimeout { field, .. } => assert_eq!(field, "syn_timeout"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn negative_cluster_default_is_rejected() {
        let defaults = TimeoutDefaults {
            connection_lifetime_nontcp: Some(-60),
            ..Default::default()
        };
        let err = resolve(&defaults, &[], &BTreeMap::new(), &conntrack()).unwrap_err();
        assert!(matches!(
            err,
            SynthError::InvalidTimeout { ref field, .. } if field == "connection_lifetime_nontcp"
        ));
    }

    #[test]
    fn unknown_override_field_is_rejected() {
        let overrides = BTreeMap::from([("fin_timeout".to_string(), 5)]);
        let err = resolve(&TimeoutDefaults::default(), &[], &overrides, &conntrack()).unwrap_err();
        assert!(matches!(
            err,
            SynthError::InvalidTimeout { ref field, .. } if field == "fin_timeout"
        ));
    }

    #[test]
    fn report_flags_must_fit_a_byte() {
        let overrides = BTreeMap::from([("report_flags".to_string(), 0x100)]);
        assert!(resolve(&TimeoutDefaults::default(), &[], &overrides, &conntrack()).is_err());
    }

    #[test]
    fn monitor_flag_names_build_mask() {
        let names = vec!["syn".to_string(), "FIN".to_string()];
        assert_eq!(report_flags_from_names(&names).unwrap(), Some(0x03));
        let policy =
            resolve(&TimeoutDefaults::default(), &names, &BTreeMap::new(), &conntrack()).unwrap();
        assert_eq!(policy.report_flags, 0x03);

        let overrides = BTreeMap::from([("report_flags".to_string(), 0x08)]);
        let policy = resolve(&TimeoutDefaults::default(), &names, &overrides, &conntrack()).unwrap();
        assert_eq!(policy.report_flags, 0x08);

        assert!(report_flags_from_names(&["ece".to_string()]).is_err());
    }

    #[test]
    fn overrides_accepted_without_conntrack() {
        let overrides = BTreeMap::from([("syn_timeout".to_string(), 15)]);
        let features = FeatureSet::from_enabled([Feature::Ipv4]);
        let policy = resolve(&TimeoutDefaults::default(), &[], &overrides, &features).unwrap();
        assert_eq!(policy.syn_timeout, 15);
    }
}
