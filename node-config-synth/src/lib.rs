//! Per-node datapath configuration synthesis.
//!
//! Resolves node identity, feature toggles, kernel map sizes and
//! connection-tracking timeouts into one [`Descriptor`], validates it and
//! publishes it through a lock-free handle.

pub mod agent;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod features;
pub mod identity;
pub mod maps;
pub mod probe;
pub mod publish;
pub mod render;
pub mod store;
pub mod synth;
pub mod timeouts;
pub mod validate;

pub use config::ClusterConfig;
pub use descriptor::Descriptor;
pub use error::{Result, SynthError};
pub use publish::{PublishOutcome, Publisher, Snapshot};
pub use synth::{CycleOutcome, Synthesizer, Trigger, synthesize};
pub use validate::{ValidatedDescriptor, ValidationFailure, Violation, validate};
