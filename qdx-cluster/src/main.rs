//! QDX Cluster - Host runner for the descriptor exchange
//!
//! Runs every core of the exchange as a thread next to a simulated hardware
//! thread:
//! - `run` - Run the exchange, verify it and optionally write a JSON report
//! - `layout` - Print the channel, queue and interrupt mapping of a config
//! - `config` - Print the effective configuration as JSON

mod jitter;
mod report;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use jitter::JitterHal;
use qdx::bridge::AccumulatorMode;
use qdx::exchange::run_cluster;
use qdx::hal::hosted::ThreadHal;
use qdx::{
    channel_core, channel_event, high_priority_queue, infrastructure_queue, ChannelId, ExchangeConfig,
    ACC_CHANNEL_GROUP,
};
use report::{RunError, RunSummary};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "qdx-cluster")]
#[command(about = "Run the QDX descriptor exchange on host threads")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// Disable the accumulator after one page
    OneShot,
    /// Keep the accumulator running
    Continuous,
}

impl From<Mode> for AccumulatorMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::OneShot => AccumulatorMode::OneShot,
            Mode::Continuous => AccumulatorMode::Continuous,
        }
    }
}

/// Overrides applied on top of the defaults or a config file
#[derive(clap::Args)]
struct ConfigArgs {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Participating cores
    #[arg(long)]
    cores: Option<usize>,

    /// Groups of rounds (one round per core each)
    #[arg(short, long)]
    iterations: Option<usize>,

    /// Packets per round
    #[arg(short, long)]
    packets: Option<usize>,

    /// Payload bytes per packet
    #[arg(long)]
    payload: Option<usize>,

    /// Accumulator mode
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Give up a wait after this many polls
    #[arg(long)]
    max_polls: Option<u64>,
}

impl ConfigArgs {
    fn resolve(&self) -> Result<ExchangeConfig, qdx::Error> {
        let mut config = match &self.config {
            Some(path) => ExchangeConfig::from_json_file(path)?,
            None => ExchangeConfig::default(),
        };
        if let Some(cores) = self.cores {
            config.cores = cores;
        }
        if let Some(iterations) = self.iterations {
            config.iterations = iterations;
        }
        if let Some(packets) = self.packets {
            config.packets_per_round = packets;
        }
        if let Some(payload) = self.payload {
            config.payload_len = payload;
        }
        if let Some(mode) = self.mode {
            config.mode = mode.into();
        }
        if self.max_polls.is_some() {
            config.poll.max_polls = self.max_polls;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the exchange
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// Random stall bound in microseconds for every core (0 disables)
        #[arg(long, default_value = "0")]
        jitter_us: u32,

        /// Jitter seed (random when omitted)
        #[arg(long)]
        seed: Option<u64>,

        /// Path to write the JSON report
        #[arg(short, long)]
        report: Option<PathBuf>,
    },

    /// Print the channel mapping
    Layout {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Print the effective configuration
    Config {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();

    match cli.command {
        Commands::Run {
            config,
            jitter_us,
            seed,
            report,
        } => {
            let config = config.resolve()?;
            let summary = run(&config, jitter_us, seed)?;
            summary.print();

            if let Some(path) = report {
                summary.write(&path)?;
                info!("Report written to: {}", path.display());
            }
            if let Err(err) = summary.verify() {
                error!("{}", err);
                return Err(err.into());
            }
            info!("Exchange verified");
        }

        Commands::Layout { config } => {
            let config = config.resolve()?;
            print_layout(&config);
        }

        Commands::Config { config } => {
            let config = config.resolve()?;
            println!("{}", config.to_json()?);
        }
    }

    Ok(())
}

fn run(config: &ExchangeConfig, jitter_us: u32, seed: Option<u64>) -> Result<RunSummary, RunError> {
    let started = Utc::now();
    info!(
        "Running exchange: {} cores, {} rounds, {} packets per round",
        config.cores,
        config.rounds(),
        config.packets_per_round
    );

    if jitter_us == 0 {
        let report = run_cluster(config, ThreadHal::new)?;
        return Ok(RunSummary::new(started, "hosted", None, report));
    }

    let seed = seed.unwrap_or_else(rand::random);
    info!("Jitter up to {} us, seed {}", jitter_us, seed);
    let report = run_cluster(config, |core| JitterHal::new(core, seed, jitter_us))?;
    Ok(RunSummary::new(started, "hosted-jitter", Some(seed), report))
}

fn print_layout(config: &ExchangeConfig) {
    println!("round  channel  core  event  infra  high-priority");
    for group in 0..config.iterations {
        for index in 0..config.cores {
            let round = group * config.cores + index;
            let channel = (group * ACC_CHANNEL_GROUP + index) as ChannelId;
            println!(
                "{:>5}  {:>7}  {:>4}  {:>5}  {:>5}  {:>13}",
                round,
                channel,
                channel_core(channel),
                channel_event(channel),
                infrastructure_queue(channel),
                high_priority_queue(channel)
            );
        }
    }
}
