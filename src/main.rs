//! gateway-control
//!
//! Runs the reliability and fairness control plane against the downstream
//! servers listed in a TOML config.
//!
//! # Architecture Overview
//!
//! ```text
//!                ┌──────────────────────────────────────────────────────────┐
//!                │                       DISPATCHER                          │
//!   tenant       │  ┌──────────┐   ┌──────────┐   ┌────────┐   ┌─────────┐  │
//!   request ─────┼─▶│ limiter  │──▶│ fairness │──▶│ queue  │──▶│ workers │  │
//!                │  │ (window) │   │ (shares) │   │(prio)  │   └────┬────┘  │
//!                │  └──────────┘   └──────────┘   └────────┘        │       │
//!                │                                                  ▼       │
//!                │                               ┌────────┐   ┌─────────┐  │
//!   Outcome ◀────┼───────────────────────────────│breaker │◀──│  pool   │◀─┼── downstream
//!                │                               └────────┘   └─────────┘  │   server
//!                │                                                          │
//!                │  config watcher · maintenance loops · metrics publisher  │
//!                └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Commands
//! - `validate --config <path>`: parse and validate, report every error
//! - `drive --config <path>`: register the servers, offer synthetic tenant
//!   load, hot-reload the config, print the final snapshot as JSON

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use clap::{Parser, Subcommand};
use serde::Serialize;

use gateway_control::clock;
use gateway_control::config::watcher::ConfigWatcher;
use gateway_control::config::{load_config, ConfigError, GatewayConfig};
use gateway_control::driver::{self, DriveReport, TenantLoad};
use gateway_control::lifecycle::{signals, Shutdown};
use gateway_control::observability::{logging, metrics};
use gateway_control::pool::HttpConnector;
use gateway_control::{Dispatcher, GatewaySnapshot};

#[derive(Parser)]
#[command(name = "gateway-control")]
#[command(about = "Reliability and fairness control plane for shared downstream servers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Drive synthetic tenant load through the configured servers
    Drive {
        #[arg(short, long)]
        config: PathBuf,

        /// Run time in seconds
        #[arg(short, long, default_value_t = 30)]
        duration: u64,

        /// Multiplier on each tenant's configured rate
        #[arg(short, long, default_value_t = 1.0)]
        load_factor: f64,
    },
}

#[derive(Serialize)]
struct RunSummary {
    report: DriveReport,
    snapshot: GatewaySnapshot,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => validate(&config),
        Commands::Drive {
            config,
            duration,
            load_factor,
        } => drive(&config, Duration::from_secs(duration), load_factor).await,
    }
}

fn validate(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    match load_config(path) {
        Ok(config) => {
            println!(
                "{}: ok ({} servers, {} tenants, window {} ms)",
                path.display(),
                config.servers.len(),
                config.tenants.len(),
                config.rate_limit.window_ms
            );
            Ok(())
        }
        Err(ConfigError::Validation(errors)) => {
            eprintln!("{}: {} validation error(s)", path.display(), errors.len());
            for error in &errors {
                eprintln!("  - {}", error);
            }
            Err(ConfigError::Validation(errors).into())
        }
        Err(e) => Err(e.into()),
    }
}

async fn drive(path: &Path, duration: Duration, load_factor: f64) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path)?;
    logging::init(&config.observability);

    tracing::info!(
        path = ?path,
        servers = config.servers.len(),
        tenants = config.tenants.len(),
        "gateway-control v0.1.0 starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let dispatcher: Arc<Dispatcher<HttpConnector>> = Dispatcher::new(config.clone(), clock::system());
    for server in &config.servers {
        dispatcher.register_server(server.clone(), HttpConnector::from_config(server))?;
    }

    let (watcher, mut updates) = ConfigWatcher::new(path);
    let _watch_guard = watcher.run()?;
    let reload_task = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            while let Some(config) = updates.recv().await {
                apply_reload(&dispatcher, config).await;
            }
        })
    };

    let stop = Shutdown::new();
    let mut drive_task = {
        let stop_rx = stop.subscribe();
        let dispatcher = dispatcher.clone();
        let loads = TenantLoad::from_config(&config, load_factor);
        let servers = dispatcher.server_ids();
        tokio::spawn(driver::drive(dispatcher, loads, servers, duration, stop_rx))
    };

    let report = tokio::select! {
        report = &mut drive_task => report?,
        _ = signals::terminate() => {
            stop.trigger();
            tracing::info!("Stopping load, waiting for in-flight requests");
            drive_task.await?
        }
    };

    let snapshot = dispatcher.snapshot();
    dispatcher.shutdown().await;
    reload_task.abort();

    let summary = RunSummary { report, snapshot };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Fan a reloaded config into the running dispatcher, registering new servers
/// and stopping removed ones.
async fn apply_reload(dispatcher: &Dispatcher<HttpConnector>, config: GatewayConfig) {
    let changes = dispatcher.reconfigure(config);
    for server in changes.added {
        let connector = HttpConnector::from_config(&server);
        let id = server.id.clone();
        match dispatcher.register_server(server, connector) {
            Ok(()) => tracing::info!(server = %id, "Server registered from reload"),
            Err(e) => tracing::warn!(server = %id, error = %e, "Failed to register server"),
        }
    }
    for id in changes.removed {
        if let Err(e) = dispatcher.deregister_server(&id).await {
            tracing::warn!(server = %id, error = %e, "Failed to deregister server");
        }
    }
}
