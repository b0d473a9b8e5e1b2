// SPDX-License-Identifier: GPL-3.0-only

//! In-memory topology: every known path and multipath device.
//!
//! Paths and devices live in two arenas. A path refers to its device through
//! a [`MapKey`]; a device lists its members as [`PathKey`]s. The two sides are
//! only changed together through [`Catalog::attach`] and [`Catalog::detach`],
//! so `path.map == Some(m)` holds exactly when `m.paths` contains the path.

use std::fmt;
use std::sync::Arc;

use multipath_contracts::PathProber;
use multipath_types::{DevT, DmPathState, PathIdentity, PathState};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use slotmap::{SlotMap, new_key_type};
use tokio_util::sync::CancellationToken;

use crate::config::MapSettings;

new_key_type! {
    pub struct PathKey;
    pub struct MapKey;
}

/// One path to a logical unit.
pub struct Path {
    pub identity: PathIdentity,
    pub map: Option<MapKey>,
    pub state: PathState,
    pub prev_state: PathState,
    /// Checker passes left before the next probe; due at 0 or 1.
    pub tick: u32,
    /// Current adaptive check interval in checker passes.
    pub check_interval: u32,
    pub priority: i32,
    pub group_index: Option<usize>,
    /// Path state in the live kernel table.
    pub dm_state: DmPathState,
    pub message: Option<String>,
    pub message_logged: bool,
    pub failures: u64,
    pub prober: Box<dyn PathProber>,
}

impl Path {
    pub fn new(identity: PathIdentity, prober: Box<dyn PathProber>, check_interval: u32) -> Self {
        Self {
            identity,
            map: None,
            state: PathState::Unchecked,
            prev_state: PathState::Unchecked,
            tick: 0,
            check_interval,
            priority: 0,
            group_index: None,
            dm_state: DmPathState::Undefined,
            message: None,
            message_logged: false,
            failures: 0,
            prober,
        }
    }

    pub fn dev(&self) -> &str {
        &self.identity.dev
    }

    pub fn devt(&self) -> DevT {
        self.identity.devt
    }

    pub fn wwid(&self) -> &str {
        &self.identity.wwid
    }

    pub fn is_orphan(&self) -> bool {
        self.map.is_none()
    }

    /// Probe health, remembering the checker message.
    pub fn probe(&mut self, timeout: std::time::Duration) -> PathState {
        let state = self.prober.probe(&self.identity, timeout);
        self.message = self.prober.message();
        state
    }

    /// Probe a path about to be attached. Inconclusive results leave it
    /// `Unchecked` and due on the next checker pass.
    pub fn probe_initial(&mut self, timeout: std::time::Duration) {
        let state = self.probe(timeout);
        if state.is_usable() || state.is_failed() {
            self.state = state;
            self.tick = self.check_interval;
        } else {
            self.state = PathState::Unchecked;
            self.tick = 1;
        }
    }

    pub fn refresh_priority(&mut self) {
        self.priority = self.prober.priority(&self.identity);
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Path")
            .field("dev", &self.identity.dev)
            .field("devt", &self.identity.devt)
            .field("wwid", &self.identity.wwid)
            .field("map", &self.map)
            .field("state", &self.state)
            .field("check_interval", &self.check_interval)
            .field("priority", &self.priority)
            .field("dm_state", &self.dm_state)
            .field("prober", &self.prober.name())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PathGroupStatus {
    #[default]
    Enabled,
    /// No usable path in the group.
    Disabled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathGroup {
    pub paths: Vec<PathKey>,
    /// Sum of the priorities of the group's usable paths.
    pub priority: i32,
    pub status: PathGroupStatus,
}

/// Pending table operation for a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableAction {
    Create,
    Reload,
    #[default]
    Nothing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MapStats {
    pub path_failures: u64,
    pub switch_group: u64,
    pub map_loads: u64,
    pub queueing_timeouts: u64,
}

/// One multipath device.
#[derive(Debug)]
pub struct Multipath {
    pub alias: String,
    pub wwid: String,
    pub size: u64,
    /// Device number of the mapped device, once the kernel reported it.
    pub devt: Option<DevT>,
    pub paths: Vec<PathKey>,
    pub groups: Vec<PathGroup>,
    pub active_group: usize,
    pub best_group: usize,
    pub settings: MapSettings,
    /// Checker passes left before a deferred failback.
    pub failback_tick: u32,
    /// Checker passes left before queueing is disabled in recovery mode.
    pub retry_tick: u32,
    /// Set while the device has no usable path.
    pub in_recovery: bool,
    pub queueing: bool,
    pub action: TableAction,
    pub flush_pending: bool,
    pub stats: MapStats,
}

impl Multipath {
    pub fn new(wwid: &str, size: u64, settings: MapSettings) -> Self {
        Self {
            alias: settings.alias.clone(),
            wwid: wwid.to_string(),
            size,
            devt: None,
            paths: Vec::new(),
            groups: Vec::new(),
            active_group: 0,
            best_group: 0,
            queueing: settings.no_path_retry.queues(),
            settings,
            failback_tick: 0,
            retry_tick: 0,
            in_recovery: false,
            action: TableAction::Nothing,
            flush_pending: false,
            stats: MapStats::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    paths: SlotMap<PathKey, Path>,
    maps: SlotMap<MapKey, Multipath>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry, keeping the allocated arenas.
    pub fn reset(&mut self) {
        self.paths.clear();
        self.maps.clear();
    }

    pub fn path(&self, key: PathKey) -> Option<&Path> {
        self.paths.get(key)
    }

    pub fn path_mut(&mut self, key: PathKey) -> Option<&mut Path> {
        self.paths.get_mut(key)
    }

    pub fn map(&self, key: MapKey) -> Option<&Multipath> {
        self.maps.get(key)
    }

    pub fn map_mut(&mut self, key: MapKey) -> Option<&mut Multipath> {
        self.maps.get_mut(key)
    }

    pub fn paths(&self) -> impl Iterator<Item = (PathKey, &Path)> {
        self.paths.iter()
    }

    pub fn maps(&self) -> impl Iterator<Item = (MapKey, &Multipath)> {
        self.maps.iter()
    }

    pub fn path_keys(&self) -> Vec<PathKey> {
        self.paths.keys().collect()
    }

    pub fn map_keys(&self) -> Vec<MapKey> {
        self.maps.keys().collect()
    }

    pub fn path_count(&self) -> usize {
        self.paths.len()
    }

    pub fn map_count(&self) -> usize {
        self.maps.len()
    }

    pub fn find_path(&self, dev: &str) -> Option<PathKey> {
        self.paths
            .iter()
            .find(|(_, path)| path.dev() == dev)
            .map(|(key, _)| key)
    }

    pub fn find_path_by_devt(&self, devt: DevT) -> Option<PathKey> {
        self.paths
            .iter()
            .find(|(_, path)| path.devt() == devt)
            .map(|(key, _)| key)
    }

    pub fn find_map_by_wwid(&self, wwid: &str) -> Option<MapKey> {
        self.maps
            .iter()
            .find(|(_, map)| map.wwid == wwid)
            .map(|(key, _)| key)
    }

    pub fn find_map_by_alias(&self, alias: &str) -> Option<MapKey> {
        self.maps
            .iter()
            .find(|(_, map)| map.alias == alias)
            .map(|(key, _)| key)
    }

    pub fn find_map_by_devt(&self, devt: DevT) -> Option<MapKey> {
        self.maps
            .iter()
            .find(|(_, map)| map.devt == Some(devt))
            .map(|(key, _)| key)
    }

    /// Paths of `map` in member order.
    pub fn members(&self, map: MapKey) -> Vec<PathKey> {
        self.maps
            .get(map)
            .map(|map| map.paths.clone())
            .unwrap_or_default()
    }

    pub fn usable_paths(&self, map: MapKey) -> usize {
        self.members(map)
            .into_iter()
            .filter_map(|key| self.paths.get(key))
            .filter(|path| path.state.is_usable())
            .count()
    }

    pub fn insert_path(&mut self, mut path: Path) -> PathKey {
        path.map = None;
        path.group_index = None;
        self.paths.insert(path)
    }

    pub fn insert_map(&mut self, mut map: Multipath) -> MapKey {
        map.paths.clear();
        map.groups.clear();
        self.maps.insert(map)
    }

    /// Make `path` a member of `map`. Returns false if it already was one.
    pub fn attach(&mut self, path: PathKey, map: MapKey) -> bool {
        if !self.maps.contains_key(map) {
            return false;
        }
        let current = match self.paths.get(path) {
            Some(p) => p.map,
            None => return false,
        };
        if current == Some(map) {
            return false;
        }
        if current.is_some() {
            self.detach(path);
        }

        if let Some(m) = self.maps.get_mut(map) {
            m.paths.push(path);
        }
        if let Some(p) = self.paths.get_mut(path) {
            p.map = Some(map);
        }
        true
    }

    /// Turn `path` into an orphan, returning its former device.
    pub fn detach(&mut self, path: PathKey) -> Option<MapKey> {
        let p = self.paths.get_mut(path)?;
        let map = p.map.take()?;
        p.group_index = None;

        if let Some(m) = self.maps.get_mut(map) {
            m.paths.retain(|key| *key != path);
            for group in &mut m.groups {
                group.paths.retain(|key| *key != path);
            }
        }
        Some(map)
    }

    /// Detach and free `path`.
    pub fn remove_path(&mut self, path: PathKey) -> Option<Path> {
        self.detach(path);
        self.paths.remove(path)
    }

    /// Free `map`, orphaning its members.
    pub fn remove_map(&mut self, map: MapKey) -> Option<Multipath> {
        for path in self.members(map) {
            self.detach(path);
        }
        self.maps.remove(map)
    }

    /// Free `map` together with its members.
    pub fn remove_map_with_paths(&mut self, map: MapKey) -> Option<Multipath> {
        for path in self.members(map) {
            self.remove_path(path);
        }
        self.maps.remove(map)
    }

    /// Verify the membership invariants between paths and devices.
    pub fn check_integrity(&self) -> Result<(), String> {
        for (key, path) in self.paths.iter() {
            let Some(map) = path.map else {
                if path.group_index.is_some() {
                    return Err(format!("orphan {} has a group index", path.dev()));
                }
                continue;
            };
            let Some(m) = self.maps.get(map) else {
                return Err(format!("{} points to a freed device", path.dev()));
            };
            let count = m.paths.iter().filter(|member| **member == key).count();
            if count != 1 {
                return Err(format!(
                    "{} is listed {} times by {}",
                    path.dev(),
                    count,
                    m.alias
                ));
            }
        }

        for (key, map) in self.maps.iter() {
            for member in &map.paths {
                match self.paths.get(*member) {
                    Some(path) if path.map == Some(key) => {}
                    Some(path) => {
                        return Err(format!(
                            "{} lists {} which belongs elsewhere",
                            map.alias,
                            path.dev()
                        ));
                    }
                    None => return Err(format!("{} lists a freed path", map.alias)),
                }
            }
            for group in &map.groups {
                if let Some(stray) = group.paths.iter().find(|p| !map.paths.contains(*p)) {
                    return Err(format!(
                        "{} groups a path that is not a member: {:?}",
                        map.alias, stray
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        let describe = |key: PathKey| self.paths.get(key).map(PathSnapshot::from);

        let maps = self
            .maps
            .values()
            .map(|map| MapSnapshot {
                alias: map.alias.clone(),
                wwid: map.wwid.clone(),
                size: map.size,
                failback: map.settings.failback.to_string(),
                active_group: map.active_group,
                best_group: map.best_group,
                queueing: map.queueing,
                in_recovery: map.in_recovery,
                flush_pending: map.flush_pending,
                action: map.action,
                stats: map.stats,
                groups: map
                    .groups
                    .iter()
                    .map(|group| GroupSnapshot {
                        priority: group.priority,
                        status: group.status,
                        paths: group.paths.iter().filter_map(|key| describe(*key)).collect(),
                    })
                    .collect(),
            })
            .collect();

        let orphans = self
            .paths
            .values()
            .filter(|path| path.is_orphan())
            .map(PathSnapshot::from)
            .collect();

        TopologySnapshot { maps, orphans }
    }
}

/// Serializable view of the catalog for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct TopologySnapshot {
    pub maps: Vec<MapSnapshot>,
    pub orphans: Vec<PathSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapSnapshot {
    pub alias: String,
    pub wwid: String,
    pub size: u64,
    pub failback: String,
    pub active_group: usize,
    pub best_group: usize,
    pub queueing: bool,
    pub in_recovery: bool,
    pub flush_pending: bool,
    pub action: TableAction,
    pub stats: MapStats,
    pub groups: Vec<GroupSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub priority: i32,
    pub status: PathGroupStatus,
    pub paths: Vec<PathSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathSnapshot {
    pub dev: String,
    pub devt: String,
    pub state: PathState,
    pub dm_state: DmPathState,
    pub priority: i32,
    pub check_interval: u32,
    pub failures: u64,
}

impl From<&Path> for PathSnapshot {
    fn from(path: &Path) -> Self {
        Self {
            dev: path.dev().to_string(),
            devt: path.devt().to_string(),
            state: path.state,
            dm_state: path.dm_state,
            priority: path.priority,
            check_interval: path.check_interval,
            failures: path.failures,
        }
    }
}

/// Handle to the process-wide catalog lock.
///
/// Engine functions take `&mut Catalog`; only worker entry points lock, and
/// they never call back into a locking entry point while holding the guard.
#[derive(Clone, Default)]
pub struct SharedCatalog {
    inner: Arc<Mutex<Catalog>>,
}

impl SharedCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, Catalog> {
        self.inner.lock()
    }

    /// Lock unless `token` is cancelled before or while waiting.
    pub fn lock_unless_cancelled(
        &self,
        token: &CancellationToken,
    ) -> Option<MutexGuard<'_, Catalog>> {
        if token.is_cancelled() {
            return None;
        }
        let guard = self.inner.lock();
        if token.is_cancelled() {
            return None;
        }
        Some(guard)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use multipath_types::{FailbackPolicy, GroupingPolicy, NoPathRetry};

    use super::*;

    struct IdleProber;

    impl PathProber for IdleProber {
        fn name(&self) -> &str {
            "idle"
        }

        fn offline_test(&mut self, _path: &PathIdentity) -> bool {
            false
        }

        fn probe(&mut self, _path: &PathIdentity, _timeout: Duration) -> PathState {
            PathState::Up
        }

        fn priority(&mut self, _path: &PathIdentity) -> i32 {
            1
        }

        fn message(&self) -> Option<String> {
            None
        }
    }

    fn path(dev: &str, minor: u32) -> Path {
        let identity = PathIdentity {
            dev: dev.to_string(),
            devt: DevT::new(8, minor),
            wwid: "3600a".to_string(),
            size: 2048,
        };
        Path::new(identity, Box::new(IdleProber), 5)
    }

    fn map(alias: &str) -> Multipath {
        Multipath::new(
            "3600a",
            2048,
            MapSettings {
                alias: alias.to_string(),
                failback: FailbackPolicy::Manual,
                no_path_retry: NoPathRetry::Fail,
                grouping: GroupingPolicy::Failover,
                selector: "service-time".to_string(),
            },
        )
    }

    #[test]
    fn attach_and_detach_keep_both_sides_in_sync() {
        let mut catalog = Catalog::new();
        let sdb = catalog.insert_path(path("sdb", 16));
        let sdc = catalog.insert_path(path("sdc", 32));
        let m = catalog.insert_map(map("mpatha"));

        assert!(catalog.attach(sdb, m));
        assert!(catalog.attach(sdc, m));
        assert!(!catalog.attach(sdb, m));
        catalog.check_integrity().expect("integrity after attach");
        assert_eq!(catalog.members(m), vec![sdb, sdc]);

        assert_eq!(catalog.detach(sdb), Some(m));
        assert_eq!(catalog.detach(sdb), None);
        catalog.check_integrity().expect("integrity after detach");
        assert_eq!(catalog.members(m), vec![sdc]);
        assert!(catalog.path(sdb).is_some_and(Path::is_orphan));
    }

    #[test]
    fn moving_a_path_leaves_the_old_device() {
        let mut catalog = Catalog::new();
        let sdb = catalog.insert_path(path("sdb", 16));
        let a = catalog.insert_map(map("mpatha"));
        let b = catalog.insert_map(map("mpathb"));

        catalog.attach(sdb, a);
        catalog.attach(sdb, b);
        catalog.check_integrity().expect("integrity after move");
        assert!(catalog.members(a).is_empty());
        assert_eq!(catalog.members(b), vec![sdb]);
    }

    #[test]
    fn removing_a_map_orphans_or_frees_members() {
        let mut catalog = Catalog::new();
        let sdb = catalog.insert_path(path("sdb", 16));
        let sdc = catalog.insert_path(path("sdc", 32));
        let a = catalog.insert_map(map("mpatha"));
        catalog.attach(sdb, a);
        catalog.remove_map(a);
        assert!(catalog.path(sdb).is_some_and(Path::is_orphan));
        catalog.check_integrity().expect("integrity after remove_map");

        let b = catalog.insert_map(map("mpathb"));
        catalog.attach(sdb, b);
        catalog.attach(sdc, b);
        catalog.remove_map_with_paths(b);
        assert_eq!(catalog.path_count(), 0);
        assert_eq!(catalog.map_count(), 0);
    }

    #[test]
    fn lookups_and_reset() {
        let mut catalog = Catalog::new();
        let sdb = catalog.insert_path(path("sdb", 16));
        let m = catalog.insert_map(map("mpatha"));
        catalog.attach(sdb, m);

        assert_eq!(catalog.find_path("sdb"), Some(sdb));
        assert_eq!(catalog.find_path_by_devt(DevT::new(8, 16)), Some(sdb));
        assert_eq!(catalog.find_map_by_alias("mpatha"), Some(m));
        assert_eq!(catalog.find_map_by_wwid("3600a"), Some(m));
        assert_eq!(catalog.usable_paths(m), 0);

        catalog.reset();
        assert!(catalog.find_path("sdb").is_none());
        assert_eq!(catalog.map_count(), 0);
    }

    #[test]
    fn cancelled_token_refuses_the_lock() {
        let shared = SharedCatalog::new();
        let token = CancellationToken::new();
        assert!(shared.lock_unless_cancelled(&token).is_some());
        token.cancel();
        assert!(shared.lock_unless_cancelled(&token).is_none());
    }

    #[test]
    fn snapshot_serializes() {
        let mut catalog = Catalog::new();
        let sdb = catalog.insert_path(path("sdb", 16));
        catalog.insert_path(path("sdc", 32));
        let m = catalog.insert_map(map("mpatha"));
        catalog.attach(sdb, m);

        let snapshot = catalog.snapshot();
        assert_eq!(snapshot.maps.len(), 1);
        assert_eq!(snapshot.orphans.len(), 1);
        let json = serde_json::to_string(&snapshot).expect("serialize snapshot");
        assert!(json.contains("\"alias\":\"mpatha\""));
    }
}
