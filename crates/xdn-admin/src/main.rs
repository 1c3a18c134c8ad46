//! `xdn` administration CLI.
//!
//! Inspects the text forms of vector clocks and state transfer units, and
//! runs scripted requests against an in-process cluster.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use xdn_client::{ClusterSpec, Harness};
use xdn_clock::{CausalOrdering, VectorClock};
use xdn_transfer::StateTransferUnit;
use xdn_types::{Epoch, RequestId, RequestIdGenerator, ServiceName};

/// `xdn` administration CLI.
#[derive(Parser)]
#[command(name = "xdn-admin")]
#[command(about = "xdn administration CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Vector clock tools.
    #[command(subcommand)]
    Clock(ClockCommand),

    /// State transfer unit tools.
    #[command(subcommand)]
    Unit(UnitCommand),

    /// Run a cluster spec's script against an in-process cluster.
    Simulate {
        /// Path to a cluster spec JSON file.
        #[arg(short, long)]
        config: PathBuf,

        /// Override the cluster's fault-injection seed.
        #[arg(short, long)]
        seed: Option<u64>,
    },
}

#[derive(Subcommand)]
enum ClockCommand {
    /// Print the counters of an encoded clock.
    Decode {
        /// Clock in `VectorTimestamp/<id>:<n>.../` form.
        clock: String,
    },

    /// Print how two encoded clocks are causally ordered.
    Compare { left: String, right: String },

    /// Increment one node's counter and print the new clock.
    Tick { clock: String, node: String },
}

#[derive(Subcommand)]
enum UnitCommand {
    /// Encode a state transfer unit.
    Encode {
        /// Service name.
        #[arg(short, long)]
        name: String,

        /// Statediff payload.
        #[arg(short, long)]
        statediff: String,

        /// Request id (defaults to a fresh wall-clock id).
        #[arg(short, long)]
        id: Option<u64>,

        /// Epoch the unit is produced under.
        #[arg(short, long, default_value = "0")]
        epoch: u64,
    },

    /// Decode a state transfer unit.
    Decode { unit: String },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("xdn=info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Clock(command) => run_clock(command)?,
        Commands::Unit(command) => run_unit(command)?,
        Commands::Simulate { config, seed } => {
            let mut spec = load_spec(&config)?;
            if let Some(seed) = seed {
                spec.seed = seed;
            }
            let failed = simulate(spec)?;
            if failed > 0 {
                bail!("{failed} request(s) failed");
            }
        }
    }

    Ok(())
}

fn parse_clock(text: &str) -> Result<VectorClock> {
    text.parse()
        .with_context(|| format!("Invalid vector clock {text:?}"))
}

fn run_clock(command: ClockCommand) -> Result<()> {
    match command {
        ClockCommand::Decode { clock } => {
            let clock = parse_clock(&clock)?;
            let mut counters: Vec<_> = clock.iter().collect();
            counters.sort();
            for (node, counter) in counters {
                println!("{node}\t{counter}");
            }
        }

        ClockCommand::Compare { left, right } => {
            let left = parse_clock(&left)?;
            let right = parse_clock(&right)?;
            if !left.is_comparable_with(&right) {
                println!("incomparable (different node sets)");
                return Ok(());
            }
            let ordering = left.compare(&right)?;
            let text = match ordering {
                CausalOrdering::Less => "before",
                CausalOrdering::Equal => "equal",
                CausalOrdering::Greater => "after",
                CausalOrdering::Concurrent => "concurrent",
            };
            println!("{text}");
        }

        ClockCommand::Tick { clock, node } => {
            let mut clock = parse_clock(&clock)?;
            if !clock.contains(&node) {
                bail!("node {node} is not part of the clock");
            }
            clock.tick(&node);
            println!("{clock}");
        }
    }
    Ok(())
}

fn run_unit(command: UnitCommand) -> Result<()> {
    match command {
        UnitCommand::Encode {
            name,
            statediff,
            id,
            epoch,
        } => {
            let id = id.map_or_else(|| RequestIdGenerator::from_wall_clock().next_id(), RequestId::new);
            let unit = StateTransferUnit::new(ServiceName::new(name), statediff, id, Epoch::new(epoch));
            println!("{}", unit.encode());
        }

        UnitCommand::Decode { unit } => {
            match StateTransferUnit::decode(&unit).context("Malformed state transfer unit")? {
                Some(unit) => {
                    println!("service\t{}", unit.service_name());
                    println!("request\t{}", unit.request_id());
                    println!("epoch\t{}", unit.epoch());
                    println!("statediff\t{}", unit.statediff());
                }
                None => println!("not a state transfer unit"),
            }
        }
    }
    Ok(())
}

fn load_spec(path: &Path) -> Result<ClusterSpec> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    ClusterSpec::from_json(&json).with_context(|| format!("Failed to load {}", path.display()))
}

/// Runs the cluster script and prints one line per step. Returns the number
/// of failed steps.
fn simulate(spec: ClusterSpec) -> Result<usize> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("Failed to start runtime")?;

    runtime.block_on(async {
        let harness = Harness::new(spec)?;
        let steps = harness.run_script().await;

        let mut failed = 0;
        for (i, step) in steps.iter().enumerate() {
            let line = match &step.outcome {
                Ok(response) => {
                    if response.is_failed() {
                        failed += 1;
                    }
                    serde_json::to_string(response)?
                }
                Err(e) => {
                    failed += 1;
                    format!("error: {e}")
                }
            };
            println!("[{i}] {} -> {line}", step.request.kind());
        }

        for record in harness.coordinator().records() {
            println!(
                "{}\t{}\tactive={:?}\treconfigurators={:?}",
                record.name, record.epoch, record.active, record.reconfigurators
            );
        }
        tracing::info!(steps = steps.len(), failed, "simulation finished");
        Ok::<_, anyhow::Error>(failed)
    })
}
