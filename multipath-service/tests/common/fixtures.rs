// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};

use multipath_testing::{FakeTableEngine, ScriptedDiscovery, TableCall};
use multipath_types::DevT;
use multipathd::catalog::{Multipath, Path};
use multipathd::config::MultipathOverride;
use multipathd::{
    Catalog, DaemonConfig, DmEvent, DmEventStrategy, DmEventWatcher, EngineContext, MapKey,
    PathKey, WatchMode, checker, reconcile,
};
use tokio_util::sync::CancellationToken;

pub const WWID: &str = "3600a098038303053453f463045727a41";
pub const MAP: &str = "mpatha";
pub const SIZE: u64 = 2_097_152;

/// Checks every second, no adaptive backoff ceiling beyond 4s, `WWID` named `MAP`.
pub fn config() -> DaemonConfig {
    DaemonConfig {
        polling_interval: 1,
        uevent_listen: false,
        dm_event_strategy: DmEventStrategy::Centralized,
        multipaths: vec![MultipathOverride {
            wwid: WWID.to_string(),
            alias: Some(MAP.to_string()),
            ..MultipathOverride::default()
        }],
        ..DaemonConfig::default()
    }
}

/// Engine wired to fakes, driven synchronously by the test.
pub struct Harness {
    pub ctx: EngineContext,
    pub table: Arc<FakeTableEngine>,
    pub discovery: ScriptedDiscovery,
    pub catalog: Catalog,
    pub events: Receiver<DmEvent>,
    pub token: CancellationToken,
}

pub fn harness(config: DaemonConfig) -> Harness {
    harness_with(config, FakeTableEngine::new(), WatchMode::Centralized)
}

pub fn harness_with(config: DaemonConfig, table: FakeTableEngine, mode: WatchMode) -> Harness {
    let table = Arc::new(table);
    let discovery = ScriptedDiscovery::new();
    let token = CancellationToken::new();
    let (tx, rx) = mpsc::channel();
    let watcher = DmEventWatcher::new(mode, table.clone(), tx, token.child_token());
    let ctx = EngineContext::new(
        table.clone(),
        Arc::new(discovery.clone()),
        watcher,
        config,
        None,
    );

    Harness {
        ctx,
        table,
        discovery,
        catalog: Catalog::new(),
        events: rx,
        token,
    }
}

impl Harness {
    /// Plug a healthy SCSI disk `8:minor` carrying `wwid`.
    pub fn plug(&self, dev: &str, minor: u32, wwid: &str) -> DevT {
        self.plug_sized(dev, minor, wwid, SIZE)
    }

    pub fn plug_sized(&self, dev: &str, minor: u32, wwid: &str, size: u64) -> DevT {
        let devt = DevT::new(8, minor);
        self.discovery.add_device(dev, devt, wwid, size);
        devt
    }

    pub fn add_path(&mut self, dev: &str) -> PathKey {
        reconcile::add_path(&self.ctx, &mut self.catalog, dev)
            .unwrap_or_else(|e| panic!("add_path {dev}: {e}"))
    }

    /// Plug and add `dev` with WWID `WWID`.
    pub fn add(&mut self, dev: &str, minor: u32) -> PathKey {
        self.plug(dev, minor, WWID);
        self.add_path(dev)
    }

    pub fn pass(&mut self) -> usize {
        checker::checker_pass(&self.ctx, &mut self.catalog)
    }

    pub fn passes(&mut self, count: usize) {
        for _ in 0..count {
            self.pass();
        }
    }

    pub fn map_key(&self, alias: &str) -> MapKey {
        self.catalog
            .find_map_by_alias(alias)
            .unwrap_or_else(|| panic!("no map {alias}"))
    }

    pub fn map(&self, alias: &str) -> &Multipath {
        let key = self.map_key(alias);
        self.catalog.map(key).expect("map entry")
    }

    pub fn path(&self, dev: &str) -> &Path {
        let key = self
            .catalog
            .find_path(dev)
            .unwrap_or_else(|| panic!("no path {dev}"));
        self.catalog.path(key).expect("path entry")
    }

    pub fn members(&self, alias: &str) -> Vec<String> {
        let mut devs: Vec<String> = self
            .catalog
            .members(self.map_key(alias))
            .into_iter()
            .filter_map(|key| self.catalog.path(key).map(|path| path.dev().to_string()))
            .collect();
        devs.sort();
        devs
    }

    pub fn loads(&self) -> Vec<TableCall> {
        self.table
            .calls()
            .into_iter()
            .filter(TableCall::is_load)
            .collect()
    }

    pub fn switches(&self) -> Vec<TableCall> {
        self.table
            .calls()
            .into_iter()
            .filter(|call| matches!(call, TableCall::SwitchGroup(..)))
            .collect()
    }

    pub fn marks(&self) -> Vec<TableCall> {
        self.table
            .calls()
            .into_iter()
            .filter(|call| matches!(call, TableCall::MarkPath(..)))
            .collect()
    }

    pub fn assert_consistent(&self) {
        if let Err(e) = self.catalog.check_integrity() {
            panic!("catalog inconsistent: {e}");
        }
    }
}
