//! snat-orchagent entry point.
//!
//! Runs the SNAT daemon against the in-memory backend seeded from a
//! topology file, reading events as JSON lines from a file or stdin.

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use snat_orchagent::audit::{init_logging, init_logging_pretty};
use snat_orchagent::backend::{MemoryBackend, TopologySeed};
use snat_orchagent::config::{SnatOrchConfig, DEFAULT_CONFIG_PATH};
use snat_orchagent::{NatDaemon, NatEvent};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Centralized SNAT orchestration agent
#[derive(Parser, Debug)]
#[command(name = "snat-orchagent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Event stream, one JSON object per line; stdin when omitted
    #[arg(short = 'e', long)]
    events: Option<PathBuf>,

    /// Topology seed for the in-memory backend (JSON)
    #[arg(short = 't', long)]
    topology: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Human-readable log output instead of JSON
    #[arg(long)]
    pretty_logs: bool,

    /// Override jobs.workers from the config file
    #[arg(short = 'w', long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.pretty_logs {
        init_logging_pretty(&args.log_level);
    } else {
        init_logging(&args.log_level);
    }

    let mut config = SnatOrchConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(workers) = args.workers {
        config.jobs.workers = workers;
    }
    config.validate()?;

    let seed = match &args.topology {
        Some(path) => TopologySeed::load(path)
            .with_context(|| format!("loading topology {}", path.display()))?,
        None => {
            warn!("snat-orchagent: no topology given, starting with an empty fabric");
            TopologySeed::default()
        }
    };
    let backend = MemoryBackend::from_seed(&seed);
    info!(
        "snat-orchagent: {} switches, {} routers in topology",
        seed.switches.len(),
        seed.routers.len()
    );

    let daemon = NatDaemon::new(config, backend.services());
    daemon.start();

    let result = match &args.events {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening events {}", path.display()))?;
            run(&daemon, &backend, file).await
        }
        None => run(&daemon, &backend, tokio::io::stdin()).await,
    };

    daemon.shutdown();
    result
}

async fn run<R>(daemon: &NatDaemon, backend: &MemoryBackend, input: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading events")?,
            _ = tokio::signal::ctrl_c() => {
                info!("snat-orchagent: received shutdown signal");
                return Ok(());
            }
        };
        let Some(line) = line else {
            info!("snat-orchagent: end of event stream");
            return Ok(());
        };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let event: NatEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                error!("snat-orchagent: skipping malformed event: {}", e);
                continue;
            }
        };

        // The simulated fabric follows the liveness events it is told about.
        match &event {
            NatEvent::SwitchDown { switch } => backend.switch_down(*switch),
            NatEvent::SwitchUp { switch } => backend.switch_up(*switch),
            _ => {}
        }

        let name = event.to_string();
        let outcomes = daemon.process(event).await;
        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        info!(
            "snat-orchagent: {} -> {} jobs, {} failed",
            name,
            outcomes.len(),
            failed
        );
    }
}
