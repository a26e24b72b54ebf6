//! `schedulerd`: the NDJSON-over-TCP transport binary around `scheduler_core`.
//!
//! The binary's own job is small by design (spec §6 "the scheduler neither
//! parses nor inspects user payloads"): load configuration, bind a listener,
//! and run one event loop task that owns the `Scheduler` for the lifetime of
//! the process.

mod peer;
mod protocol;
mod transport;

use std::time::Duration;

use clap::Parser;
use scheduler_channels::mspc;
use scheduler_config::SchedulerConfig;
use scheduler_core::{Scheduler, SchedulerOptions};
use scheduler_trace::info;

use peer::PeerRegistry;
use transport::{run_event_loop, TcpTransport, Transport};

#[derive(Debug, Parser)]
#[command(name = "schedulerd", about = "Centralized dynamic task scheduler")]
struct Cli {
    /// Path to a TOML config file; unset fields fall back to documented defaults.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Overrides `bind_address` from the config file, if given.
    #[arg(long)]
    bind_address: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => SchedulerConfig::load(path)?,
        None => SchedulerConfig::default(),
    };
    if let Some(bind_address) = cli.bind_address {
        config.bind_address = bind_address;
    }

    info!("starting schedulerd with config: {:?}", config);

    let scheduler = Scheduler::new(SchedulerOptions {
        suspicion_limit: config.suspicion_limit,
        assumed_bandwidth_bytes_per_sec: config.assumed_bandwidth_bytes_per_sec,
        worker_overbook_limit: config.worker_overbook_limit,
        heartbeat_miss_limit: config.heartbeat_miss_limit,
        heartbeat_interval_ms: config.heartbeat_interval_ms,
    });

    let (inbound_tx, inbound_rx) = mspc::create();
    let workers = PeerRegistry::new();
    let clients = PeerRegistry::new();

    let heartbeat_interval = Duration::from_millis(config.heartbeat_interval_ms);
    let event_loop = tokio::spawn(run_event_loop(
        scheduler,
        inbound_rx,
        workers.clone(),
        clients.clone(),
        heartbeat_interval,
    ));

    let transport: Box<dyn Transport> = Box::new(TcpTransport {
        bind_address: config.bind_address,
        batch_window: Duration::from_millis(config.batch_window_ms),
    });
    transport.serve(inbound_tx, workers, clients).await?;

    event_loop.abort();
    Ok(())
}
