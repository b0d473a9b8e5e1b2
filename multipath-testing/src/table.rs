// SPDX-License-Identifier: GPL-3.0-only

//! In-memory device-mapper stand-in.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use multipath_contracts::{EngineError, ErrorKind, TableEngine};
use multipath_types::{
    DevT, DmPathState, GroupState, GroupStatus, MPATH_UUID_PREFIX, MULTIPATH_TARGET, MapInfo,
    MapName, MapStatus, MapTable, PathAction, PathStatus, TableGroup, WaitOutcome,
};
use parking_lot::{Condvar, Mutex};

/// Major number handed out to fake devices.
pub const FAKE_DM_MAJOR: u32 = 253;

/// A call the engine made, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableCall {
    Create(String),
    Reload(String),
    Suspend(String),
    Resume(String),
    Remove(String),
    SwitchGroup(String, usize),
    MarkPath(String, DevT, PathAction),
    SetQueueing(String, bool),
}

impl TableCall {
    pub fn name(&self) -> &str {
        match self {
            TableCall::Create(name)
            | TableCall::Reload(name)
            | TableCall::Suspend(name)
            | TableCall::Resume(name)
            | TableCall::Remove(name)
            | TableCall::SwitchGroup(name, _)
            | TableCall::MarkPath(name, _, _)
            | TableCall::SetQueueing(name, _) => name,
        }
    }

    /// Table loads only: creates and reloads.
    pub fn is_load(&self) -> bool {
        matches!(self, TableCall::Create(_) | TableCall::Reload(_))
    }
}

/// Operations that accept injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableOp {
    Create,
    Reload,
    Remove,
    GetInfo,
    Status,
    Table,
    List,
    SwitchGroup,
    MarkPath,
    SetQueueing,
    Wait,
}

#[derive(Debug, Clone)]
struct FakeDevice {
    table: MapTable,
    uuid: String,
    devt: DevT,
    event_nr: u32,
    active_group: usize,
    failed: BTreeSet<DevT>,
    target: Option<String>,
}

impl FakeDevice {
    fn status(&self) -> MapStatus {
        MapStatus {
            groups: self
                .table
                .groups
                .iter()
                .enumerate()
                .map(|(index, group)| GroupStatus {
                    state: if index == self.active_group {
                        GroupState::Active
                    } else {
                        GroupState::Enabled
                    },
                    paths: group
                        .paths
                        .iter()
                        .map(|devt| PathStatus {
                            devt: *devt,
                            state: if self.failed.contains(devt) {
                                DmPathState::Failed
                            } else {
                                DmPathState::Active
                            },
                            fail_count: 0,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Move I/O off an active group without live paths, as the kernel
    /// does on the next request.
    fn leave_dead_group(&mut self) {
        let alive = |group: &TableGroup| {
            group.paths.iter().any(|devt| !self.failed.contains(devt))
        };
        if self.table.groups.get(self.active_group).is_some_and(alive) {
            return;
        }
        if let Some(index) = self.table.groups.iter().position(alive) {
            self.active_group = index;
        }
    }

    fn bump(&mut self) {
        self.event_nr += 1;
    }

    /// A freshly loaded table starts with every path active.
    fn load(&mut self, table: &MapTable) {
        self.table = table.clone();
        self.active_group = table.initial_group;
        self.failed.clear();
        self.bump();
    }
}

#[derive(Debug, Default)]
struct State {
    devices: BTreeMap<String, FakeDevice>,
    calls: Vec<TableCall>,
    failures: HashMap<TableOp, VecDeque<EngineError>>,
    busy: HashSet<String>,
    next_minor: u32,
    events: u64,
}

impl State {
    fn injected(&mut self, op: TableOp) -> Result<(), EngineError> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn device_mut(&mut self, name: &str) -> Result<&mut FakeDevice, EngineError> {
        self.devices
            .get_mut(name)
            .ok_or_else(|| EngineError::not_found(format!("{name}: no such device")))
    }

    fn insert(&mut self, name: &str, uuid: String, table: &MapTable) -> DevT {
        let devt = DevT::new(FAKE_DM_MAJOR, self.next_minor);
        self.next_minor += 1;
        self.devices.insert(
            name.to_string(),
            FakeDevice {
                table: table.clone(),
                uuid,
                devt,
                event_nr: 0,
                active_group: table.initial_group,
                failed: BTreeSet::new(),
                target: Some(MULTIPATH_TARGET.to_string()),
            },
        );
        devt
    }
}

/// Records every call and keeps per-device tables, event counters and
/// path states the way the kernel would.
#[derive(Debug, Default)]
pub struct FakeTableEngine {
    state: Mutex<State>,
    changed: Condvar,
    event_poll: bool,
}

impl FakeTableEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise multiplexed event waits.
    pub fn with_event_poll(mut self) -> Self {
        self.event_poll = true;
        self
    }

    pub fn calls(&self) -> Vec<TableCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Make the next `times` calls of `op` fail with an error of `kind`.
    pub fn fail(&self, op: TableOp, kind: ErrorKind, times: usize) {
        let mut state = self.state.lock();
        let queue = state.failures.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(EngineError::new(kind, format!("injected {op:?} failure")));
        }
    }

    /// An open device refuses removal with a busy error.
    pub fn set_busy(&self, name: &str, busy: bool) {
        let mut state = self.state.lock();
        if busy {
            state.busy.insert(name.to_string());
        } else {
            state.busy.remove(name);
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.state.lock().devices.contains_key(name)
    }

    pub fn event_nr(&self, name: &str) -> Option<u32> {
        self.state.lock().devices.get(name).map(|dev| dev.event_nr)
    }

    pub fn active_group(&self, name: &str) -> Option<usize> {
        self.state.lock().devices.get(name).map(|dev| dev.active_group)
    }

    pub fn live_table(&self, name: &str) -> Option<MapTable> {
        self.state.lock().devices.get(name).map(|dev| dev.table.clone())
    }

    pub fn path_state(&self, name: &str, devt: DevT) -> Option<DmPathState> {
        self.state
            .lock()
            .devices
            .get(name)
            .and_then(|dev| dev.status().path_state(devt))
    }

    /// Load a multipath device the daemon did not create.
    pub fn external_create(&self, name: &str, table: &MapTable) -> DevT {
        let mut state = self.state.lock();
        let uuid = format!("{MPATH_UUID_PREFIX}{}", table.wwid);
        let devt = state.insert(name, uuid, table);
        self.notify(&mut state);
        devt
    }

    /// Load a non-multipath device under `name`.
    pub fn external_create_linear(&self, name: &str, size: u64) -> DevT {
        let mut state = self.state.lock();
        let table = MapTable {
            size,
            ..MapTable::default()
        };
        let devt = state.insert(name, format!("LVM-{name}"), &table);
        if let Some(dev) = state.devices.get_mut(name) {
            dev.target = Some("linear".to_string());
        }
        devt
    }

    /// Replace a live table behind the daemon's back.
    pub fn external_reload(&self, name: &str, table: &MapTable) -> bool {
        let mut state = self.state.lock();
        let Some(dev) = state.devices.get_mut(name) else {
            return false;
        };
        dev.load(table);
        self.notify(&mut state);
        true
    }

    /// Remove a device behind the daemon's back.
    pub fn external_remove(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state.devices.remove(name).is_some();
        if removed {
            self.notify(&mut state);
        }
        removed
    }

    /// Fail a path in the kernel without going through the daemon.
    pub fn external_fail_path(&self, name: &str, devt: DevT) -> bool {
        let mut state = self.state.lock();
        let Some(dev) = state.devices.get_mut(name) else {
            return false;
        };
        dev.failed.insert(devt);
        dev.bump();
        self.notify(&mut state);
        true
    }

    fn notify(&self, state: &mut State) {
        state.events += 1;
        self.changed.notify_all();
    }
}

impl TableEngine for FakeTableEngine {
    fn create(&self, name: &str, table: &MapTable) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.calls.push(TableCall::Create(name.to_string()));
        state.injected(TableOp::Create)?;
        if state.devices.contains_key(name) {
            return Err(EngineError::new(
                ErrorKind::InvalidInput,
                format!("{name}: device exists"),
            ));
        }
        let uuid = format!("{MPATH_UUID_PREFIX}{}", table.wwid);
        state.insert(name, uuid, table);
        Ok(())
    }

    fn reload(&self, name: &str, table: &MapTable) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.calls.push(TableCall::Reload(name.to_string()));
        state.injected(TableOp::Reload)?;
        state.device_mut(name)?.load(table);
        self.notify(&mut state);
        Ok(())
    }

    fn suspend(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.calls.push(TableCall::Suspend(name.to_string()));
        state.device_mut(name).map(|_| ())
    }

    fn resume(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.calls.push(TableCall::Resume(name.to_string()));
        state.device_mut(name).map(|_| ())
    }

    fn remove(&self, name: &str, _no_flush: bool) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.calls.push(TableCall::Remove(name.to_string()));
        state.injected(TableOp::Remove)?;
        if state.busy.contains(name) {
            return Err(EngineError::busy(format!("{name}: device is open")));
        }
        if state.devices.remove(name).is_none() {
            return Err(EngineError::not_found(format!("{name}: no such device")));
        }
        self.notify(&mut state);
        Ok(())
    }

    fn get_info(&self, name: &str) -> Result<MapInfo, EngineError> {
        let mut state = self.state.lock();
        state.injected(TableOp::GetInfo)?;
        let open_count = u32::from(state.busy.contains(name));
        let Some(dev) = state.devices.get(name) else {
            return Ok(MapInfo {
                name: name.to_string(),
                exists: false,
                ..MapInfo::default()
            });
        };
        Ok(MapInfo {
            name: name.to_string(),
            exists: true,
            devt: dev.devt,
            uuid: dev.uuid.clone(),
            open_count,
            event_nr: dev.event_nr,
            target: dev.target.clone(),
        })
    }

    fn status(&self, name: &str) -> Result<MapStatus, EngineError> {
        let mut state = self.state.lock();
        state.injected(TableOp::Status)?;
        Ok(state.device_mut(name)?.status())
    }

    fn table(&self, name: &str) -> Result<MapTable, EngineError> {
        let mut state = self.state.lock();
        state.injected(TableOp::Table)?;
        Ok(state.device_mut(name)?.table.clone())
    }

    fn list_names(&self) -> Result<Vec<MapName>, EngineError> {
        let mut state = self.state.lock();
        state.injected(TableOp::List)?;
        Ok(state
            .devices
            .iter()
            .map(|(name, dev)| MapName {
                name: name.clone(),
                event_nr: dev.event_nr,
            })
            .collect())
    }

    fn get_event_counter(&self, name: &str) -> Result<u32, EngineError> {
        let mut state = self.state.lock();
        Ok(state.device_mut(name)?.event_nr)
    }

    fn switch_group(&self, name: &str, group: usize) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state
            .calls
            .push(TableCall::SwitchGroup(name.to_string(), group));
        state.injected(TableOp::SwitchGroup)?;
        let dev = state.device_mut(name)?;
        if group >= dev.table.groups.len() {
            return Err(EngineError::new(
                ErrorKind::InvalidInput,
                format!("{name}: no group {group}"),
            ));
        }
        dev.active_group = group;
        dev.bump();
        self.notify(&mut state);
        Ok(())
    }

    fn mark_path(&self, name: &str, devt: DevT, action: PathAction) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state
            .calls
            .push(TableCall::MarkPath(name.to_string(), devt, action));
        state.injected(TableOp::MarkPath)?;
        let dev = state.device_mut(name)?;
        if !dev.table.devices().any(|member| member == devt) {
            return Err(EngineError::new(
                ErrorKind::InvalidInput,
                format!("{name}: {devt} is not a member"),
            ));
        }
        match action {
            PathAction::Fail => {
                dev.failed.insert(devt);
                dev.leave_dead_group();
            }
            PathAction::Reinstate => {
                dev.failed.remove(&devt);
            }
        }
        dev.bump();
        self.notify(&mut state);
        Ok(())
    }

    fn set_queueing(&self, name: &str, queue: bool) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state
            .calls
            .push(TableCall::SetQueueing(name.to_string(), queue));
        state.injected(TableOp::SetQueueing)?;
        state.device_mut(name)?.table.queue_if_no_path = queue;
        Ok(())
    }

    fn supports_event_poll(&self) -> bool {
        self.event_poll
    }

    fn wait_any(&self, timeout: Duration) -> Result<bool, EngineError> {
        if !self.event_poll {
            return Err(EngineError::unsupported("multiplexed event wait"));
        }
        let mut state = self.state.lock();
        state.injected(TableOp::Wait)?;
        let seen = state.events;
        let deadline = Instant::now() + timeout;
        while state.events == seen {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn wait_event(
        &self,
        name: &str,
        event_nr: u32,
        timeout: Duration,
    ) -> Result<WaitOutcome, EngineError> {
        let mut state = self.state.lock();
        state.injected(TableOp::Wait)?;
        let deadline = Instant::now() + timeout;
        loop {
            match state.devices.get(name) {
                None => return Ok(WaitOutcome::Gone),
                Some(dev) if dev.event_nr > event_nr => {
                    return Ok(WaitOutcome::Changed(dev.event_nr));
                }
                Some(_) => {}
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return Ok(WaitOutcome::TimedOut);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(wwid: &str, groups: &[&[DevT]]) -> MapTable {
        MapTable {
            size: 1024,
            wwid: wwid.to_string(),
            queue_if_no_path: false,
            groups: groups
                .iter()
                .map(|paths| TableGroup {
                    selector: "service-time".to_string(),
                    paths: paths.to_vec(),
                })
                .collect(),
            initial_group: 0,
        }
    }

    #[test]
    fn reload_bumps_counter_and_resets_group() {
        let engine = FakeTableEngine::new();
        let a = DevT::new(8, 16);
        let b = DevT::new(8, 32);
        engine
            .create("mpatha", &table("3600a", &[&[a], &[b]]))
            .expect("create");
        engine.switch_group("mpatha", 1).expect("switch");
        assert_eq!(engine.active_group("mpatha"), Some(1));

        engine
            .reload("mpatha", &table("3600a", &[&[a], &[b]]))
            .expect("reload");
        assert_eq!(engine.active_group("mpatha"), Some(0));
        assert_eq!(engine.event_nr("mpatha"), Some(2));
    }

    #[test]
    fn reload_reactivates_failed_paths() {
        let engine = FakeTableEngine::new();
        let a = DevT::new(8, 16);
        let b = DevT::new(8, 32);
        engine
            .create("mpatha", &table("3600a", &[&[a, b]]))
            .expect("create");
        engine
            .mark_path("mpatha", a, PathAction::Fail)
            .expect("fail a");
        assert_eq!(engine.path_state("mpatha", a), Some(DmPathState::Failed));

        engine
            .reload("mpatha", &table("3600a", &[&[a, b]]))
            .expect("reload");
        assert_eq!(engine.path_state("mpatha", a), Some(DmPathState::Active));
    }

    #[test]
    fn busy_device_refuses_removal() {
        let engine = FakeTableEngine::new();
        engine
            .create("mpatha", &table("3600a", &[&[DevT::new(8, 16)]]))
            .expect("create");
        engine.set_busy("mpatha", true);
        assert!(engine.remove("mpatha", false).unwrap_err().is_busy());
        engine.set_busy("mpatha", false);
        engine.remove("mpatha", false).expect("remove");
        assert!(!engine.exists("mpatha"));
        assert!(!engine.get_info("mpatha").expect("info").exists);
    }

    #[test]
    fn injected_failures_are_consumed() {
        let engine = FakeTableEngine::new();
        engine.fail(TableOp::Create, ErrorKind::Busy, 1);
        let t = table("3600a", &[&[DevT::new(8, 16)]]);
        assert!(engine.create("mpatha", &t).is_err());
        engine.create("mpatha", &t).expect("second create");
        assert_eq!(
            engine.calls(),
            vec![
                TableCall::Create("mpatha".to_string()),
                TableCall::Create("mpatha".to_string())
            ]
        );
    }

    #[test]
    fn wait_event_reports_changes_and_removal() {
        let engine = FakeTableEngine::new();
        let a = DevT::new(8, 16);
        engine
            .create("mpatha", &table("3600a", &[&[a]]))
            .expect("create");
        assert_eq!(
            engine
                .wait_event("mpatha", 0, Duration::from_millis(10))
                .expect("wait"),
            WaitOutcome::TimedOut
        );
        engine.external_fail_path("mpatha", a);
        assert_eq!(
            engine
                .wait_event("mpatha", 0, Duration::from_millis(10))
                .expect("wait"),
            WaitOutcome::Changed(1)
        );
        assert_eq!(engine.path_state("mpatha", a), Some(DmPathState::Failed));
        engine.external_remove("mpatha");
        assert_eq!(
            engine
                .wait_event("mpatha", 1, Duration::from_millis(10))
                .expect("wait"),
            WaitOutcome::Gone
        );
    }
}
