use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use tokio::{
    signal::{
        self,
        unix::{SignalKind, signal as unix_signal},
    },
    task, time,
};
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;
use crate::descriptor::Descriptor;
use crate::identity::InterfaceObservations;
use crate::probe::{CapabilitySource, ObservationSource, StaticSource, SysfsProbe};
use crate::render;
use crate::store::{StateStore, write_atomic};
use crate::synth::{Synthesizer, Trigger};

pub const DEFAULT_RECONCILE_SECS: u64 = 300;
pub const DEFAULT_POLL_SECS: u64 = 5;

/// Where published descriptors are written.
#[derive(Clone, Debug)]
pub struct OutputPaths {
    pub header: PathBuf,
    pub json: Option<PathBuf>,
    pub block: Option<PathBuf>,
}

pub struct AgentOptions {
    pub config_path: PathBuf,
    /// Read observations from this file instead of probing the host.
    pub observations: Option<PathBuf>,
    pub state_path: Option<PathBuf>,
    pub outputs: OutputPaths,
    pub reconcile_interval: Duration,
    pub poll_interval: Duration,
}

pub fn write_outputs(paths: &OutputPaths, descriptor: &Descriptor) -> Result<()> {
    write_atomic(&paths.header, render::render_header(descriptor).as_bytes())?;
    if let Some(json) = &paths.json {
        let rendered = render::render_json(descriptor).context("failed to render descriptor json")?;
        write_atomic(json, rendered.as_bytes())?;
    }
    if let Some(block) = &paths.block {
        write_atomic(block, &render::runtime_block(descriptor).to_le_bytes())?;
    }
    Ok(())
}

fn observation_fingerprint(observations: &InterfaceObservations) -> u64 {
    let mut hasher = DefaultHasher::new();
    observations.hash(&mut hasher);
    hasher.finish()
}

async fn fingerprint(source: Arc<dyn ObservationSource>) -> Result<u64> {
    let observations = task::spawn_blocking(move || source.observe())
        .await
        .map_err(|err| anyhow!("observation task failed: {err}"))??;
    Ok(observation_fingerprint(&observations))
}

pub async fn run_agent(opts: AgentOptions) -> Result<()> {
    if opts.reconcile_interval.is_zero() || opts.poll_interval.is_zero() {
        return Err(anyhow!("intervals must be greater than zero"));
    }
    let config = ClusterConfig::from_path(&opts.config_path)?;

    let (observations, capabilities): (Arc<dyn ObservationSource>, Arc<dyn CapabilitySource>) =
        match &opts.observations {
            Some(path) => {
                let source = Arc::new(StaticSource::new(path));
                (source.clone(), source)
            }
            None => {
                let probe = Arc::new(SysfsProbe::new());
                (probe.clone(), probe)
            }
        };

    let mut synth = Synthesizer::new(config, observations.clone(), capabilities);
    if let Some(path) = &opts.state_path {
        synth = synth.with_store(StateStore::new(path));
    }
    let synth = Arc::new(synth);

    match synth.restore() {
        Ok(Some(generation)) => {
            if let Some(snapshot) = synth.current() {
                write_outputs(&opts.outputs, &snapshot.descriptor)
                    .context("failed to write restored descriptor")?;
            }
            info!(generation, "resuming from persisted descriptor");
        }
        Ok(None) => {}
        Err(err) => warn!(error = %format!("{err:#}"), "ignoring unusable persisted state"),
    }

    let outputs = opts.outputs.clone();
    let worker = tokio::spawn(Arc::clone(&synth).run_worker(move |snapshot| {
        match write_outputs(&outputs, &snapshot.descriptor) {
            Ok(()) => info!(
                generation = snapshot.generation(),
                header = %outputs.header.display(),
                "wrote descriptor"
            ),
            Err(err) => error!(error = %format!("{err:#}"), "failed to write descriptor"),
        }
    }));

    synth.trigger(Trigger::Bootstrap);

    let mut last_fingerprint = fingerprint(observations.clone()).await.ok();
    let mut reconcile = time::interval(opts.reconcile_interval);
    reconcile.tick().await;
    let mut poll = time::interval(opts.poll_interval);
    poll.tick().await;
    let mut hangup = unix_signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("failed to wait for ctrl-c")?;
                info!("received shutdown signal");
                break;
            }
            _ = reconcile.tick() => {
                synth.trigger(Trigger::Reconcile);
            }
            _ = poll.tick() => {
                match fingerprint(observations.clone()).await {
                    Ok(current) if Some(current) != last_fingerprint => {
                        debug!("interface observations changed");
                        last_fingerprint = Some(current);
                        synth.trigger(Trigger::InterfaceChange);
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %format!("{err:#}"), "interface poll failed"),
                }
            }
            _ = hangup.recv() => {
                match ClusterConfig::from_path(&opts.config_path) {
                    Ok(config) => {
                        info!(path = %opts.config_path.display(), "reloading configuration");
                        synth.reload_config(config);
                    }
                    Err(err) => error!(error = %format!("{err:#}"), "configuration reload failed; keeping current configuration"),
                }
            }
        }
    }

    worker.abort();
    let _ = worker.await;
    Ok(())
}
