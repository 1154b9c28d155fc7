use std::{
    io::Write,
    path::{Path, PathBuf},
    process::exit,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use node_config_synth::{
    ClusterConfig, SynthError, agent,
    features::KernelCapabilities,
    identity::InterfaceObservations,
    probe::{self, CapabilitySource, ObservationSource, SysfsProbe},
    render,
    store::write_atomic,
    synth, validate,
};

#[derive(Parser)]
#[command(name = "node-config-synth")]
#[command(about = "Per-node datapath configuration synthesizer", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize one descriptor and print it
    Render(RenderCommand),
    /// Synthesize one descriptor and report every violation
    Check(InputArgs),
    /// Keep the descriptor current until interrupted
    Run(RunCommand),
}

#[derive(Args)]
struct InputArgs {
    /// Cluster configuration (TOML)
    #[arg(long, value_name = "PATH")]
    config: PathBuf,
    /// Interface observations (TOML); probes the host when omitted
    #[arg(long, value_name = "PATH")]
    observations: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Header,
    Json,
}

#[derive(Args)]
struct RenderCommand {
    #[command(flatten)]
    input: InputArgs,
    #[arg(long, value_enum, default_value_t = Format::Header)]
    format: Format,
    /// Generation number stamped into the descriptor
    #[arg(long, default_value_t = 1)]
    generation: u64,
    /// Write to this file instead of stdout
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Also write the 64-byte runtime block
    #[arg(long, value_name = "PATH")]
    block: Option<PathBuf>,
}

#[derive(Args)]
struct RunCommand {
    #[command(flatten)]
    input: InputArgs,
    /// Header written after every publish
    #[arg(long, value_name = "PATH")]
    header: PathBuf,
    /// JSON rendering written after every publish
    #[arg(long, value_name = "PATH")]
    json: Option<PathBuf>,
    /// Runtime block written after every publish
    #[arg(long, value_name = "PATH")]
    block: Option<PathBuf>,
    /// Last published descriptor, restored on start
    #[arg(long, value_name = "PATH")]
    state: Option<PathBuf>,
    /// Seconds between periodic reconciliations
    #[arg(long, default_value_t = agent::DEFAULT_RECONCILE_SECS)]
    reconcile_interval_secs: u64,
    /// Seconds between interface polls
    #[arg(long, default_value_t = agent::DEFAULT_POLL_SECS)]
    poll_interval_secs: u64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(err) = run(cli).await {
        eprintln!("node-config-synth error: {err:?}");
        exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_inputs(
    observations: Option<&Path>,
) -> Result<(InterfaceObservations, KernelCapabilities)> {
    match observations {
        Some(path) => probe::load_static(path),
        None => {
            let probe = SysfsProbe::new();
            Ok((probe.observe()?, probe.capabilities()?))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Some(Commands::Render(cmd)) => {
            let config = ClusterConfig::from_path(&cmd.input.config)?;
            let (observations, caps) = load_inputs(cmd.input.observations.as_deref())?;
            let candidate = synth::synthesize(&config, &observations, &caps, cmd.generation)?;
            for limit in &candidate.limits {
                eprintln!("warning: {limit}");
            }
            let descriptor = candidate.validated.descriptor();
            let rendered = match cmd.format {
                Format::Header => render::render_header(descriptor),
                Format::Json => render::render_json(descriptor).context("failed to render json")?,
            };
            match &cmd.output {
                Some(path) => write_atomic(path, rendered.as_bytes())?,
                None => std::io::stdout()
                    .write_all(rendered.as_bytes())
                    .context("failed to write to stdout")?,
            }
            if let Some(path) = &cmd.block {
                write_atomic(path, &render::runtime_block(descriptor).to_le_bytes())?;
            }
        }
        Some(Commands::Check(input)) => {
            let config = ClusterConfig::from_path(&input.config)?;
            let (observations, caps) = load_inputs(input.observations.as_deref())?;
            let (descriptor, limits) = synth::assemble_descriptor(&config, &observations, &caps, 1)
                .map_err(|err| report(&err))?;
            for limit in &limits {
                println!("warning: {limit}");
            }
            let violations = validate::violations(&descriptor);
            if !violations.is_empty() {
                for violation in &violations {
                    println!("violation: {violation}");
                }
                return Err(anyhow!("descriptor has {} violation(s)", violations.len()));
            }
            println!(
                "ok: {} maps, content hash {}",
                descriptor.maps.len(),
                descriptor.content_hash()
            );
        }
        Some(Commands::Run(cmd)) => {
            let opts = agent::AgentOptions {
                config_path: cmd.input.config,
                observations: cmd.input.observations,
                state_path: cmd.state,
                outputs: agent::OutputPaths {
                    header: cmd.header,
                    json: cmd.json,
                    block: cmd.block,
                },
                reconcile_interval: Duration::from_secs(cmd.reconcile_interval_secs.max(1)),
                poll_interval: Duration::from_secs(cmd.poll_interval_secs.max(1)),
            };
            agent::run_agent(opts).await?;
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

fn report(err: &SynthError) -> anyhow::Error {
    if let SynthError::ConfigConflict(conflicts) = err {
        for conflict in conflicts {
            println!("conflict: {conflict}");
        }
    }
    anyhow!("{err}")
}
