// SPDX-License-Identifier: GPL-3.0-only

//! Device-mapper table models.
//!
//! The engine only ever deals with these structured forms; turning them into
//! target parameter strings (and back) is the table engine adapter's job.

use serde::{Deserialize, Serialize};

use crate::path::{DevT, DmPathState};

/// Target type name of multipath maps.
pub const MULTIPATH_TARGET: &str = "multipath";

/// UUID prefix of maps owned by the daemon.
pub const MPATH_UUID_PREFIX: &str = "mpath-";

/// Desired table of one multipath map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapTable {
    /// Size in 512-byte sectors.
    pub size: u64,
    /// Storage identity, used for the map UUID.
    pub wwid: String,
    /// Load the table with `queue_if_no_path`.
    pub queue_if_no_path: bool,
    /// Path groups in priority order.
    pub groups: Vec<TableGroup>,
    /// Zero-based index of the group the kernel should start with.
    pub initial_group: usize,
}

impl MapTable {
    pub fn path_count(&self) -> usize {
        self.groups.iter().map(|group| group.paths.len()).sum()
    }

    pub fn devices(&self) -> impl Iterator<Item = DevT> + '_ {
        self.groups.iter().flat_map(|group| group.paths.iter().copied())
    }
}

/// One priority group inside a [`MapTable`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableGroup {
    /// Path selector, e.g. `service-time`.
    pub selector: String,
    pub paths: Vec<DevT>,
}

/// Result of `get_info` on a mapped device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapInfo {
    pub name: String,
    pub exists: bool,
    pub devt: DevT,
    pub uuid: String,
    pub open_count: u32,
    pub event_nr: u32,
    /// Target type of the live table, if any.
    pub target: Option<String>,
}

impl MapInfo {
    /// Whether the live table is a multipath table owned by this daemon.
    pub fn is_multipath(&self) -> bool {
        self.exists
            && self.target.as_deref() == Some(MULTIPATH_TARGET)
            && self.uuid.starts_with(MPATH_UUID_PREFIX)
    }

    /// WWID encoded in the map UUID.
    pub fn wwid(&self) -> Option<&str> {
        self.uuid.strip_prefix(MPATH_UUID_PREFIX)
    }
}

/// Entry of the global device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapName {
    pub name: String,
    pub event_nr: u32,
}

/// Kernel state of a group in the live table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    /// Group currently used for I/O.
    Active,
    #[default]
    Enabled,
    Disabled,
}

/// Kernel-reported status of one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathStatus {
    pub devt: DevT,
    pub state: DmPathState,
    pub fail_count: u32,
}

/// Kernel-reported status of one group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStatus {
    pub state: GroupState,
    pub paths: Vec<PathStatus>,
}

/// Kernel-reported status of a whole multipath map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapStatus {
    pub groups: Vec<GroupStatus>,
}

impl MapStatus {
    /// Zero-based index of the active group, if the kernel reports one.
    pub fn active_group(&self) -> Option<usize> {
        self.groups
            .iter()
            .position(|group| group.state == GroupState::Active)
    }

    pub fn path_state(&self, devt: DevT) -> Option<DmPathState> {
        self.groups
            .iter()
            .flat_map(|group| group.paths.iter())
            .find(|path| path.devt == devt)
            .map(|path| path.state)
    }
}

/// Outcome of a blocking wait for table events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The event counter moved past the one waited on.
    Changed(u32),
    /// The device no longer exists.
    Gone,
    TimedOut,
}
