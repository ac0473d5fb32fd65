//! vhotplug: hot-plug USB and PCI devices into running virtual machines.

use anyhow::Context;
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use vhotplug_core::adapters::{adapter_for, VmAdapter};
use vhotplug_core::{Config, DeviceSource, Transport, UsbIdDb};

mod api;
mod orchestrator;

use orchestrator::Orchestrator;

/// Buffered notifications per API client before a slow consumer is dropped.
const NOTIFICATION_BUFFER: usize = 256;
/// Queued API requests awaiting the orchestrator.
const API_QUEUE_DEPTH: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "vhotplug", about = "Hot-plugging USB devices to the virtual machines")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Attach connected devices on startup
    #[arg(short, long)]
    attach_connected: bool,

    /// Enable debug messages
    #[arg(short, long)]
    debug: bool,
}

/// Turn SIGTERM/SIGINT into a shutdown broadcast.
///
/// The handler also unlinks the API unix socket so a restart does not find
/// a stale listener path; `api_socket` is `None` when the unix transport is
/// not configured.
fn spawn_signal_handler(api_socket: Option<PathBuf>) -> broadcast::Receiver<()> {
    let (tx, rx) = broadcast::channel(1);

    tokio::spawn(async move {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT, shutting down");
            }
        }

        if let Some(path) = &api_socket {
            match std::fs::remove_file(path) {
                Ok(()) => info!("removed API socket {}", path.display()),
                Err(e) => debug!("could not remove API socket {}: {}", path.display(), e),
            }
        }

        let _ = tx.send(());
    });

    rx
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    info!("loaded configuration with {} VM(s)", config.vms.len());

    let usb_ids = Arc::new(UsbIdDb::load_system());

    let adapters: HashMap<String, Arc<dyn VmAdapter>> = config
        .vms
        .iter()
        .map(|vm| (vm.name.clone(), adapter_for(vm, &config.general)))
        .collect();

    let (notify_tx, _) = broadcast::channel(NOTIFICATION_BUFFER);
    let (api_tx, api_rx) = mpsc::channel(API_QUEUE_DEPTH);

    let api_config = config.general.api.clone().filter(|api| api.enable);
    if let Some(api) = api_config.clone() {
        api::server::serve(api, api_tx.clone(), notify_tx.clone())
            .await
            .context("failed to start API server")?;
    }

    let source = DeviceSource::start(args.attach_connected, usb_ids)
        .context("failed to start device monitor")?;

    let api_socket = api_config
        .filter(|api| api.transports.contains(&Transport::Unix))
        .map(|api| api.unix_socket);
    let shutdown_rx = spawn_signal_handler(api_socket);

    let orchestrator = Orchestrator::new(config, adapters, notify_tx)?;
    match orchestrator.run(source, api_rx, shutdown_rx).await {
        Ok(()) => {
            info!("exiting");
            Ok(())
        }
        Err(e) => {
            error!("fatal: {}", e);
            Err(e.into())
        }
    }
}
