use thiserror::Error;

use crate::features::Conflict;
use crate::identity::{AddressFamily, DeviceRole};
use crate::validate::ValidationFailure;

pub type Result<T> = std::result::Result<T, SynthError>;

/// Fatal errors of a synthesis cycle.
///
/// Any of these aborts the generation being built; the previously published
/// descriptor stays active. Capacity clamping is reported separately through
/// [`crate::maps::ResourceLimitExceeded`] because it never aborts a cycle.
#[derive(Debug, Error)]
pub enum SynthError {
    #[error("{role} interface {name:?} could not be resolved: {detail}")]
    MissingInterface {
        role: DeviceRole,
        name: String,
        detail: &'static str,
    },

    #[error("{role} interface {name:?} has no usable {family} address")]
    UnsupportedFamily {
        role: DeviceRole,
        name: String,
        family: AddressFamily,
    },

    #[error("feature configuration conflict: {}", join(.0))]
    ConfigConflict(Vec<Conflict>),

    #[error("invalid timeout {field}: {reason}")]
    InvalidTimeout { field: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Validation(#[from] ValidationFailure),

    #[error("probe failed: {0:#}")]
    Probe(anyhow::Error),
}

impl SynthError {
    pub fn invalid_timeout(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTimeout {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-friendly label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingInterface { .. } => "missing_interface",
            Self::UnsupportedFamily { .. } => "unsupported_family",
            Self::ConfigConflict(_) => "config_conflict",
            Self::InvalidTimeout { .. } => "invalid_timeout",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Validation(_) => "validation_failure",
            Self::Probe(_) => "probe",
        }
    }
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
