// SPDX-License-Identifier: GPL-3.0-only

//! multipathd - device-mapper multipath daemon
//!
//! Checks the health of every path below the multipath maps, fails and
//! reinstates paths, and switches path groups as paths come and go.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};

use multipathd::config::{DEFAULT_CONFIG_PATH, DaemonConfig, DmEventStrategy};
use multipathd::daemon::{Daemon, DaemonHandle};
use multipathd::logging;
use multipathd::routing::{AdapterRegistry, Concern};

/// Device-mapper multipath daemon
#[derive(Parser)]
#[command(name = "multipathd")]
#[command(about = "Device-mapper multipath daemon", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Do not listen for kernel uevents
    #[arg(long)]
    no_uevents: bool,

    /// Device-mapper event strategy: auto, centralized or per-device
    #[arg(long)]
    dm_events: Option<DmEventStrategy>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = DaemonConfig::load(&args.config)?;
    if args.no_uevents {
        config.uevent_listen = false;
    }
    if let Some(strategy) = args.dm_events {
        config.dm_event_strategy = strategy;
    }

    let _log_guard = logging::init(args.verbose, &config);

    tracing::info!("Starting multipathd v{}", env!("CARGO_PKG_VERSION"));

    // Check if running as root
    if unsafe { libc::geteuid() } != 0 {
        tracing::error!("multipathd must run as root");
        anyhow::bail!("Daemon must run with root privileges");
    }

    let adapters = AdapterRegistry::build_default()?;
    tracing::info!(
        "Adapter routing: Table -> {}, Discovery -> {}",
        adapters.route_for(Concern::Table).unwrap_or("<missing>"),
        adapters.route_for(Concern::Discovery).unwrap_or("<missing>")
    );

    let mut daemon = Daemon::new(
        config,
        Some(args.config),
        adapters.table(),
        adapters.discovery(),
    );
    let handle = daemon.handle();

    // The initial scan talks to the kernel synchronously.
    daemon = tokio::task::spawn_blocking(move || daemon.start().map(|()| daemon)).await??;

    tracing::info!("Daemon ready");
    wait_for_signals(handle).await?;

    tokio::task::spawn_blocking(move || daemon.shutdown()).await?;
    tracing::info!("multipathd stopped");
    Ok(())
}

/// Serve operator signals until asked to stop.
async fn wait_for_signals(handle: DaemonHandle) -> Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut user1 = signal(SignalKind::user_defined1())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                tracing::info!("SIGHUP: reconfiguring");
                let handle = handle.clone();
                match tokio::task::spawn_blocking(move || handle.reconfigure()).await? {
                    Ok(()) => tracing::info!("reconfigure done"),
                    Err(e) => tracing::error!("reconfigure failed: {}", e),
                }
            }
            _ = user1.recv() => {
                let handle = handle.clone();
                match tokio::task::spawn_blocking(move || handle.topology()).await? {
                    Ok(snapshot) => match serde_json::to_string_pretty(&snapshot) {
                        Ok(json) => tracing::info!("topology:\n{}", json),
                        Err(e) => tracing::warn!("cannot serialize topology: {}", e),
                    },
                    Err(e) => tracing::warn!("cannot read topology: {}", e),
                }
            }
            _ = terminate.recv() => {
                tracing::info!("Received SIGTERM");
                return Ok(());
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Received shutdown signal");
                return Ok(());
            }
        }
    }
}
