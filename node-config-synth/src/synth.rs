use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::anyhow;
use arc_swap::ArcSwap;
use tokio::{sync::Notify, task};
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;
use crate::descriptor::{self, AssemblyInputs, DatapathSettings, Descriptor, PortRanges};
use crate::error::{Result, SynthError};
use crate::features::{self, Feature, KernelCapabilities};
use crate::identity::{self, InterfaceObservations};
use crate::maps::{self, PlanInputs, ResourceLimitExceeded};
use crate::probe::{CapabilitySource, ObservationSource};
use crate::publish::{PublishOutcome, Publisher, Snapshot};
use crate::store::{PersistedState, StateStore};
use crate::timeouts;
use crate::validate::{self, ValidatedDescriptor};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Trigger {
    Bootstrap,
    InterfaceChange,
    ConfigReload,
    Reconcile,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Trigger::Bootstrap => "bootstrap",
            Trigger::InterfaceChange => "interface_change",
            Trigger::ConfigReload => "config_reload",
            Trigger::Reconcile => "reconcile",
        })
    }
}

/// A validated descriptor plus the non-fatal findings of its cycle.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub validated: ValidatedDescriptor,
    pub limits: Vec<ResourceLimitExceeded>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Published(Arc<Snapshot>),
    Unchanged { active_generation: u64 },
    Stale { offered: u64, active: u64 },
    /// A newer trigger arrived while the cycle ran. Its result is held back
    /// and only published if the next cycle fails.
    Superseded { generation: u64 },
}

/// Runs every resolver and the assembler. Does not validate.
pub fn assemble_descriptor(
    config: &ClusterConfig,
    observations: &InterfaceObservations,
    capabilities: &KernelCapabilities,
    generation: u64,
) -> Result<(Descriptor, Vec<ResourceLimitExceeded>)> {
    config.check()?;
    let identity = identity::resolve(config, observations)?;
    let features = features::resolve(&config.requested_features(), capabilities)?;
    let timeouts = timeouts::resolve(
        &config.timeouts,
        &config.monitor_flags,
        &config.timeout_overrides,
        &features,
    )?;
    let plan = maps::plan(&PlanInputs {
        features: &features,
        hints: &config.scale_hints,
        capabilities,
        overrides: &config.map_sizes,
        ceiling: config.map_size_ceiling,
        profile: config.naming_profile,
    });
    let ports = if features.is_enabled(Feature::NodePort) {
        Some(PortRanges::derive(config.nodeport_port_range, config.nat_port_max)?)
    } else {
        None
    };
    let mtu = descriptor::resolve_mtu(config, &identity, &features)?;

    let descriptor = descriptor::assemble(AssemblyInputs {
        generation,
        identity,
        features,
        maps: plan.maps,
        timeouts,
        ports,
        mtu,
        settings: DatapathSettings::from(config),
    });
    Ok((descriptor, plan.limits))
}

/// Builds and validates one generation from a snapshot of inputs.
pub fn synthesize(
    config: &ClusterConfig,
    observations: &InterfaceObservations,
    capabilities: &KernelCapabilities,
    generation: u64,
) -> Result<Candidate> {
    let (descriptor, limits) = assemble_descriptor(config, observations, capabilities, generation)?;
    let validated = validate::validate(descriptor)?;
    Ok(Candidate { validated, limits })
}

pub struct Synthesizer {
    config: ArcSwap<ClusterConfig>,
    observations: Arc<dyn ObservationSource>,
    capabilities: Arc<dyn CapabilitySource>,
    publisher: Publisher,
    store: Option<StateStore>,
    trigger_seq: AtomicU64,
    handled_seq: AtomicU64,
    wake: Notify,
    cycle: tokio::sync::Mutex<()>,
    deferred: Mutex<Option<ValidatedDescriptor>>,
}

impl Synthesizer {
    pub fn new(
        config: ClusterConfig,
        observations: Arc<dyn ObservationSource>,
        capabilities: Arc<dyn CapabilitySource>,
    ) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            observations,
            capabilities,
            publisher: Publisher::new(),
            store: None,
            trigger_seq: AtomicU64::new(0),
            handled_seq: AtomicU64::new(0),
            wake: Notify::new(),
            cycle: tokio::sync::Mutex::new(()),
            deferred: Mutex::new(None),
        }
    }

    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.publisher.current()
    }

    pub fn config(&self) -> Arc<ClusterConfig> {
        self.config.load_full()
    }

    /// Loads persisted state into the publisher and continues numbering
    /// after its generation. Returns the restored generation.
    pub fn restore(&self) -> anyhow::Result<Option<u64>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let Some(state) = store.load()? else {
            return Ok(None);
        };
        let snapshot = state.into_snapshot()?;
        let generation = snapshot.generation();
        if self.publisher.restore(snapshot) {
            self.trigger_seq.fetch_max(generation, Ordering::SeqCst);
            self.handled_seq.fetch_max(generation, Ordering::SeqCst);
            info!(generation, path = %store.path().display(), "restored persisted descriptor");
            Ok(Some(generation))
        } else {
            Ok(None)
        }
    }

    /// Records a trigger and wakes the worker. Returns the new sequence.
    pub fn trigger(&self, trigger: Trigger) -> u64 {
        let seq = self.trigger_seq.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(%trigger, seq, "synthesis triggered");
        self.wake.notify_one();
        seq
    }

    /// Swaps the live configuration and triggers a cycle.
    pub fn reload_config(&self, config: ClusterConfig) -> u64 {
        self.config.store(Arc::new(config));
        self.trigger(Trigger::ConfigReload)
    }

    fn is_superseded(&self, start: u64) -> bool {
        self.trigger_seq.load(Ordering::SeqCst) > start
    }

    /// Runs one cycle for the latest trigger.
    ///
    /// A cycle overtaken by a newer trigger does not publish; its result is
    /// kept until the following cycle completes. If that cycle fails, the
    /// kept result is published instead so a valid generation is not lost.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let _cycle = self.cycle.lock().await;
        let start = self.trigger_seq.load(Ordering::SeqCst);
        self.handled_seq.fetch_max(start, Ordering::SeqCst);
        let deferred = self.take_deferred();

        let candidate = match self.build(start).await {
            Ok(candidate) => candidate,
            Err(err) => {
                if let Some(previous) = deferred {
                    if self.is_superseded(start) {
                        self.defer(previous);
                    } else {
                        warn!(
                            generation = previous.generation(),
                            failed = start,
                            "newer cycle failed, publishing overtaken result"
                        );
                        self.publish(previous);
                    }
                }
                return Err(err);
            }
        };
        if self.is_superseded(start) {
            info!(generation = start, "deferring superseded cycle");
            self.defer(candidate.validated);
            return Ok(CycleOutcome::Superseded { generation: start });
        }
        Ok(self.publish(candidate.validated))
    }

    async fn build(&self, start: u64) -> Result<Candidate> {
        let config = self.config.load_full();
        let observations = Arc::clone(&self.observations);
        let capabilities = Arc::clone(&self.capabilities);
        let (observed, caps) = task::spawn_blocking(move || -> anyhow::Result<_> {
            Ok((observations.observe()?, capabilities.capabilities()?))
        })
        .await
        .map_err(|err| SynthError::Probe(anyhow!("probe task failed: {err}")))?
        .map_err(SynthError::Probe)?;

        let candidate = synthesize(&config, &observed, &caps, start)?;
        if !candidate.limits.is_empty() {
            warn!(
                generation = start,
                clamped = candidate.limits.len(),
                "map capacities clamped to kernel ceiling"
            );
        }
        Ok(candidate)
    }

    fn take_deferred(&self) -> Option<ValidatedDescriptor> {
        self.deferred.lock().expect("deferred mutex poisoned").take()
    }

    fn defer(&self, validated: ValidatedDescriptor) {
        *self.deferred.lock().expect("deferred mutex poisoned") = Some(validated);
    }

    /// Validates and publishes an externally built descriptor.
    pub fn offer(&self, descriptor: Descriptor) -> Result<CycleOutcome> {
        let validated = validate::validate(descriptor)?;
        Ok(self.publish(validated))
    }

    fn publish(&self, validated: ValidatedDescriptor) -> CycleOutcome {
        match self.publisher.publish(validated) {
            PublishOutcome::Published(snapshot) => {
                self.persist(&snapshot);
                CycleOutcome::Published(snapshot)
            }
            PublishOutcome::Unchanged { active_generation } => {
                debug!(active_generation, "descriptor unchanged");
                CycleOutcome::Unchanged { active_generation }
            }
            PublishOutcome::Stale { offered, active } => {
                warn!(offered, active, "refusing stale descriptor");
                CycleOutcome::Stale { offered, active }
            }
        }
    }

    fn persist(&self, snapshot: &Snapshot) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.save(&PersistedState::from(snapshot)) {
            warn!(error = %format!("{err:#}"), "failed to persist published descriptor");
        }
    }

    /// Worker loop: runs a cycle whenever the trigger sequence moved past the
    /// last handled one. `on_publish` sees every newly published snapshot.
    pub async fn run_worker<F>(self: Arc<Self>, mut on_publish: F)
    where
        F: FnMut(&Snapshot) + Send,
    {
        let mut seen = self.current();
        loop {
            let latest = self.trigger_seq.load(Ordering::SeqCst);
            if latest <= self.handled_seq.load(Ordering::SeqCst) {
                self.wake.notified().await;
                continue;
            }
            match self.run_cycle().await {
                Ok(outcome) => debug!(?outcome, "cycle finished"),
                Err(err) => report_failure(&err),
            }
            let current = self.current();
            if let Some(snapshot) = &current {
                if !seen.as_ref().is_some_and(|prev| Arc::ptr_eq(prev, snapshot)) {
                    on_publish(snapshot);
                }
            }
            seen = current;
        }
    }
}

/// Logs a failed cycle. The active descriptor is left as it was.
pub fn report_failure(err: &SynthError) {
    if let SynthError::Validation(failure) = err {
        for violation in &failure.violations {
            error!(generation = failure.generation, %violation, "descriptor violation");
        }
    }
    error!(kind = err.kind(), error = %err, "synthesis cycle failed; keeping previous descriptor");
}
