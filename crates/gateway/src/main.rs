// SPDX-License-Identifier: Apache-2.0

//! tbgwd: the gateway daemon.
//!
//! Loads the main configuration, builds the event store it names, and runs
//! the orchestration core. Protocol connector implementations register
//! themselves in the constructor registry at startup; the platform
//! transport is supplied by the embedding integration. Without one, the
//! daemon runs against the built-in loopback client.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tbgw_connector::ConnectorRegistry;
use tbgw_gateway::config_io::load_general_config;
use tbgw_gateway::{GatewayService, LoopbackClient};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tbgwd", about = "IoT gateway daemon", version)]
struct Args {
    /// Path to the main configuration file
    #[arg(short, long, default_value = "config/tb_gateway.json")]
    config: PathBuf,

    /// Directory for the daemon log file (stderr only when omitted)
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn init_tracing(log_dir: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tbgwd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer).init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(args.log_dir.as_ref());

    let config = load_general_config(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let config_dir = args
        .config
        .parent()
        .map(PathBuf::from)
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("."));

    // Protocol connector crates register their constructors here.
    let factories = ConnectorRegistry::new();

    let client = Arc::new(LoopbackClient::new());
    info!("no platform transport wired in, running with the loopback client");

    let service = GatewayService::new(config, config_dir, client, factories)
        .context("building the gateway service")?;
    service.start().await.context("starting the gateway service")?;

    // Scheduled restart requests funnel into the same shutdown path as
    // ctrl-c; the supervisor is expected to bring the process back up.
    let shutdown = Arc::new(tokio::sync::Notify::new());
    {
        let shutdown = shutdown.clone();
        service.rpc().register_scheduled_method("restart", move || shutdown.notify_one());
    }
    service.rpc().register_scheduled_method("reboot", || {
        info!("reboot requested; host reboot is managed externally");
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = shutdown.notified() => info!("restart scheduled, shutting down"),
    }
    service.stop().await;
    Ok(())
}
