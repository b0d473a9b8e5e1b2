// SPDX-License-Identifier: GPL-3.0-only

//! Worker supervision: one shared catalog, several long-running workers, one
//! cancellation token.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};

use anyhow::Context;
use multipath_contracts::{DeviceDiscovery, TableEngine};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::{Catalog, MapKey, PathKey, SharedCatalog, TopologySnapshot};
use crate::checker;
use crate::config::{DaemonConfig, DmEventStrategy};
use crate::context::EngineContext;
use crate::dmevents::{self, DmEvent, DmEventWatcher, WatchMode};
use crate::error::{ReconcileError, Result};
use crate::reconcile;
use crate::uevents;

/// Pick the watching mode for `strategy` given what the table engine offers.
pub fn resolve_watch_mode(strategy: DmEventStrategy, table: &dyn TableEngine) -> WatchMode {
    match strategy {
        DmEventStrategy::Centralized => WatchMode::Centralized,
        DmEventStrategy::PerDevice => WatchMode::PerDevice,
        DmEventStrategy::Auto if table.supports_event_poll() => WatchMode::Centralized,
        DmEventStrategy::Auto => WatchMode::PerDevice,
    }
}

pub struct Daemon {
    ctx: Arc<EngineContext>,
    catalog: SharedCatalog,
    token: CancellationToken,
    dm_events: Option<Receiver<DmEvent>>,
    workers: Vec<JoinHandle<()>>,
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        config_path: Option<PathBuf>,
        table: Arc<dyn TableEngine>,
        discovery: Arc<dyn DeviceDiscovery>,
    ) -> Self {
        let token = CancellationToken::new();
        let mode = resolve_watch_mode(config.dm_event_strategy, table.as_ref());
        let (tx, rx) = mpsc::channel();
        let watcher = DmEventWatcher::new(mode, table.clone(), tx, token.child_token());
        let ctx = EngineContext::new(table, discovery, watcher, config, config_path);

        Self {
            ctx: Arc::new(ctx),
            catalog: SharedCatalog::new(),
            token,
            dm_events: Some(rx),
            workers: Vec::new(),
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Scan the initial topology, then start the workers.
    pub fn start(&mut self) -> anyhow::Result<()> {
        let Some(dm_events) = self.dm_events.take() else {
            anyhow::bail!("daemon already started");
        };

        {
            let mut catalog = self.catalog.lock();
            reconcile::initial_scan(&self.ctx, &mut catalog).context("initial scan failed")?;
        }

        let (ctx, catalog, token) = self.worker_parts();
        self.spawn("checker", move || {
            checker::run_checker(ctx, catalog, token)
        })?;

        let (ctx, catalog, token) = self.worker_parts();
        self.spawn("dmevent-consumer", move || {
            dmevents::run_consumer(ctx, catalog, dm_events, token)
        })?;

        if self.ctx.watcher.mode() == WatchMode::Centralized {
            let ctx = self.ctx.clone();
            let token = self.token.clone();
            self.spawn("dmevent-poller", move || dmevents::run_poller(ctx, token))?;
        }

        if self.ctx.config().uevent_listen {
            let (tx, rx) = mpsc::channel();
            let token = self.token.clone();
            self.spawn("uevent-listener", move || uevents::run_listener(tx, token))?;

            let (ctx, catalog, token) = self.worker_parts();
            self.spawn("uevent-dispatcher", move || {
                uevents::run_dispatcher(ctx, catalog, rx, token)
            })?;
        }

        info!(
            "started {} workers, dm events {:?}",
            self.workers.len(),
            self.ctx.watcher.mode()
        );
        Ok(())
    }

    fn worker_parts(&self) -> (Arc<EngineContext>, SharedCatalog, CancellationToken) {
        (self.ctx.clone(), self.catalog.clone(), self.token.clone())
    }

    fn spawn<F>(&mut self, name: &str, f: F) -> anyhow::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(f)
            .with_context(|| format!("failed to spawn {name} worker"))?;
        self.workers.push(handle);
        Ok(())
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            ctx: self.ctx.clone(),
            catalog: self.catalog.clone(),
            token: self.token.clone(),
        }
    }

    /// Cancel every worker and wait for them to exit.
    pub fn shutdown(mut self) {
        info!("shutting down");
        self.token.cancel();
        self.ctx.watcher.unwatch_all();
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                warn!("{} worker panicked", name);
            }
        }
    }
}

/// Serialized entry points for operator commands.
///
/// Each call takes the catalog lock, refusing once shutdown has begun.
#[derive(Clone)]
pub struct DaemonHandle {
    ctx: Arc<EngineContext>,
    catalog: SharedCatalog,
    token: CancellationToken,
}

impl DaemonHandle {
    fn with_catalog<T>(
        &self,
        f: impl FnOnce(&EngineContext, &mut Catalog) -> Result<T>,
    ) -> Result<T> {
        let mut catalog = self
            .catalog
            .lock_unless_cancelled(&self.token)
            .ok_or(ReconcileError::Cancelled)?;
        f(self.ctx.as_ref(), &mut *catalog)
    }

    pub fn add_path(&self, dev: &str) -> Result<PathKey> {
        self.with_catalog(|ctx, catalog| reconcile::add_path(ctx, catalog, dev))
    }

    pub fn remove_path(&self, dev: &str) -> Result<()> {
        self.with_catalog(|ctx, catalog| reconcile::remove_path(ctx, catalog, dev))
    }

    pub fn add_map(&self, name: &str) -> Result<MapKey> {
        self.with_catalog(|ctx, catalog| reconcile::add_map(ctx, catalog, name))
    }

    pub fn remove_map(&self, name: &str) -> Result<()> {
        self.with_catalog(|ctx, catalog| reconcile::remove_map(ctx, catalog, name))
    }

    pub fn flush(&self, name: &str) -> Result<()> {
        self.with_catalog(|ctx, catalog| reconcile::flush(ctx, catalog, name))
    }

    pub fn reconfigure(&self) -> Result<()> {
        self.with_catalog(reconcile::reconfigure)
    }

    pub fn topology(&self) -> Result<TopologySnapshot> {
        self.with_catalog(|_, catalog| Ok(catalog.snapshot()))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }
}
