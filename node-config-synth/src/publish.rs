use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::descriptor::{ContentHash, Descriptor};
use crate::validate::ValidatedDescriptor;

/// A published generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub descriptor: Descriptor,
    pub content_hash: ContentHash,
    pub published_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn generation(&self) -> u64 {
        self.descriptor.generation
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Published(Arc<Snapshot>),
    /// Content hash equals the active one; nothing was swapped.
    Unchanged { active_generation: u64 },
    /// Generation is not newer than the active one.
    Stale { offered: u64, active: u64 },
}

#[derive(Default)]
pub struct Publisher {
    active: ArcSwapOption<Snapshot>,
    write: Mutex<()>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.active.load_full()
    }

    pub fn current_generation(&self) -> Option<u64> {
        self.active.load().as_ref().map(|s| s.generation())
    }

    /// Installs a previously persisted snapshot if nothing is active yet.
    pub fn restore(&self, snapshot: Snapshot) -> bool {
        let _guard = self.write.lock().expect("publisher mutex poisoned");
        if self.active.load().is_some() {
            return false;
        }
        debug!(generation = snapshot.generation(), "restored persisted descriptor");
        self.active.store(Some(Arc::new(snapshot)));
        true
    }

    pub fn publish(&self, validated: ValidatedDescriptor) -> PublishOutcome {
        let _guard = self.write.lock().expect("publisher mutex poisoned");
        let offered = validated.generation();
        if let Some(active) = self.active.load_full() {
            if active.content_hash == *validated.content_hash() {
                return PublishOutcome::Unchanged {
                    active_generation: active.generation(),
                };
            }
            if offered <= active.generation() {
                return PublishOutcome::Stale {
                    offered,
                    active: active.generation(),
                };
            }
        }

        let content_hash = validated.content_hash().clone();
        let snapshot = Arc::new(Snapshot {
            descriptor: validated.into_inner(),
            content_hash,
            published_at: Utc::now(),
        });
        self.active.store(Some(Arc::clone(&snapshot)));
        info!(
            generation = offered,
            hash = %snapshot.content_hash,
            "published descriptor"
        );
        PublishOutcome::Published(snapshot)
    }
}
