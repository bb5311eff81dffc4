use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tracing::{info, warn};

use swarm_harness::{Harness, HarnessConfig, PortListenWorkload};

/// Exit status when the run finished but teardown was not clean.
const EXIT_UNCLEAN: i32 = 2;

/// Swarm Runner - forks port-holding workers and tears them down
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (YAML)
    #[arg(short, long, value_name = "FILE")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Number of workers (overrides config)
    #[arg(short, long)]
    workers: Option<usize>,

    /// First port each worker asks for (overrides config)
    #[arg(short = 'p', long)]
    start_port: Option<u16>,

    /// Run duration in seconds (overrides config)
    #[arg(long)]
    run_duration: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = HarnessConfig::load_from_file(&args.config)?;

    if let Some(workers) = args.workers {
        config.harness.workers = workers;
    }
    if let Some(port) = args.start_port {
        let width = i64::from(config.port_range()?.width());
        config.ports.start = i64::from(port);
        config.ports.end = Some(i64::from(port) + width - 1);
    }
    if let Some(secs) = args.run_duration {
        config.harness.run_duration = Duration::from_secs(secs);
    }
    config.validate()?;

    initialize_logging(args.debug, &config.harness.log_level)?;

    info!("Starting Swarm Runner");
    info!("Config file: {}", args.config);

    let harness = Harness::new(config)?;
    let summary = harness.run(&PortListenWorkload::default())?;

    println!("{}", serde_json::to_string_pretty(&summary)?);

    if !summary.is_clean() {
        warn!("Teardown was not clean");
        std::process::exit(EXIT_UNCLEAN);
    }

    info!("Swarm Runner finished");
    Ok(())
}

fn initialize_logging(debug: bool, configured: &str) -> Result<()> {
    let level = if debug { "debug" } else { configured };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    Ok(())
}
