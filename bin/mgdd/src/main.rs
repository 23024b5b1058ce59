//! ---
//! mgd_section: "01-core-dispatch"
//! mgd_subsection: "binary"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Binary entrypoint for the MGD daemon."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mgd_api::{ControllerStatus, ObserverApiBuilder, StatusSource};
use mgd_common::config::AppConfig;
use mgd_common::logging::init_tracing;
use mgd_core::{DispatchController, SnapshotBroadcaster};
use mgd_link::{EndpointLink, LinkCounters};
use mgd_metrics::{new_registry, ControllerMetrics};
use mgd_oracle::{HttpOracleBackend, OracleClient};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "MGD microgrid dispatch daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the dispatch controller")]
    Run,
    #[command(about = "Validate the configuration and exit")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/mgd.toml"));
    candidates.push(PathBuf::from("configs/example.toml"));

    let config = AppConfig::load(&candidates)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            println!(
                "configuration OK: {} sources, endpoint {}, observer {}",
                config.sources.len(),
                config.endpoint.address,
                if config.observer.enabled {
                    config.observer.listen.to_string()
                } else {
                    "disabled".to_owned()
                }
            );
            Ok(())
        }
        Commands::Run => run_daemon(config).await,
    }
}

/// Adapter feeding the observer `/status` endpoint from the shared link and
/// oracle state.
struct DaemonStatus {
    link_counters: Arc<LinkCounters>,
    link_status: watch::Receiver<bool>,
    oracle: Option<Arc<OracleClient>>,
    broadcaster: SnapshotBroadcaster,
}

impl StatusSource for DaemonStatus {
    fn status(&self) -> ControllerStatus {
        ControllerStatus {
            link_up: *self.link_status.borrow(),
            tick: self
                .broadcaster
                .latest()
                .map(|snapshot| snapshot.tick)
                .unwrap_or(0),
            frames_received: self.link_counters.frames_received(),
            bad_frames: self.link_counters.bad_frames(),
            dispatches_sent: self.link_counters.dispatches_sent(),
            oracle_timeouts: self.oracle.as_ref().map(|o| o.timeouts()).unwrap_or(0),
            oracle_coalesced: self.oracle.as_ref().map(|o| o.coalesced()).unwrap_or(0),
        }
    }
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    // Held until the daemon exits so buffered log lines are flushed.
    let _tracing = init_tracing("mgdd", &config.logging)?;
    info!(
        endpoint = %config.endpoint.address,
        sources = config.sources.len(),
        tick_ms = config.controller.tick_interval.as_millis() as u64,
        "mgdd starting"
    );

    let registry = new_registry();
    let metrics = match ControllerMetrics::new(registry.clone()) {
        Ok(metrics) => Some(metrics),
        Err(err) => {
            warn!(error = %err, "metrics registration failed; continuing without metrics");
            None
        }
    };

    let link = EndpointLink::spawn(config.endpoint.address.clone());
    let link_counters = link.counters();
    let link_status = link.status();

    let oracle = config.oracle.as_ref().map(|oracle_config| {
        info!(endpoint = %oracle_config.endpoint, "oracle escalation enabled");
        Arc::new(OracleClient::from_config(
            Arc::new(HttpOracleBackend::new(oracle_config.endpoint.clone())),
            oracle_config,
        ))
    });
    if oracle.is_none() {
        info!("no oracle configured; escalations will be recorded but not sent");
    }

    let broadcaster = SnapshotBroadcaster::new();

    let api = if config.observer.enabled {
        let mut builder = ObserverApiBuilder::new(config.observer.listen, broadcaster.clone())
            .with_status_source(Arc::new(DaemonStatus {
                link_counters,
                link_status,
                oracle: oracle.clone(),
                broadcaster: broadcaster.clone(),
            }));
        if config.observer.expose_metrics {
            builder = builder.with_metrics_registry(registry.clone());
        }
        Some(builder.spawn().await?)
    } else {
        info!("observer api disabled by configuration");
        None
    };

    let controller =
        DispatchController::new(config, link, oracle, broadcaster, metrics);
    let handle = controller.spawn();

    info!("daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    handle.shutdown().await?;
    if let Some(api) = api {
        api.shutdown().await?;
    }
    info!("mgdd shutdown complete");
    Ok(())
}
