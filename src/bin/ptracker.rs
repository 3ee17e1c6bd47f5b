//! Replays an observation file through a tracking agent.
//!
//! Usage:
//!   ptracker observations.jsonl --config config/parameters.json --frame-rate 25

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use ptrack::error::Error;
use ptrack::{Config, PTracker};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "ptracker", about = "Multi-target particle filter tracker")]
struct Cli {
    /// JSON-lines file, one array of boxes per frame.
    observation_file: PathBuf,

    #[arg(long, default_value_t = 30.0)]
    frame_rate: f32,

    #[arg(long, default_value = "config/parameters.json")]
    config: PathBuf,

    /// Overrides the agent id of the configuration.
    #[arg(long)]
    agent_id: Option<i32>,

    /// Where the per-frame global estimations are written.
    #[arg(long)]
    results: Option<PathBuf>,
}

fn run(cli: &Cli, running: &AtomicBool) -> Result<(), Error> {
    let cfg = Config::load(&cli.config)?;
    let mut tracker = PTracker::new(&cfg, cli.agent_id)?;

    let frames = BufReader::new(File::open(&cli.observation_file)?);
    let mut results = match &cli.results {
        Some(path) => Some(BufWriter::new(File::create(path)?)),
        None => None,
    };

    let count = tracker.run_offline(
        frames,
        results.as_mut().map(|w| w as &mut dyn Write),
        cli.frame_rate,
        true,
        running,
    )?;

    tracing::info!(frames = count, "replay finished");

    Ok(())
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let running = Arc::new(AtomicBool::new(true));

    let flag = running.clone();
    if let Err(e) = ctrlc::set_handler(move || flag.store(false, Ordering::Relaxed)) {
        tracing::warn!(error = %e, "cannot install interrupt handler");
    }

    if let Err(e) = run(&cli, &running) {
        tracing::error!(error = %e, "ptracker failed");
        process::exit(1);
    }
}
