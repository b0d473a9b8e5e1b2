// SPDX-License-Identifier: GPL-3.0-only

//! Path-level models: health states, device numbers and identities.

use serde::{Deserialize, Serialize};

/// Health of a single path as reported by its checker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathState {
    /// Not probed yet, or the probe could not classify the path.
    #[default]
    Unchecked,
    /// The probe returned something the checker does not understand.
    Wild,
    Down,
    Up,
    /// Reachable but flapping; treated like `Down` for I/O.
    Shaky,
    /// Passive path (e.g. ALUA standby); usable but not preferred.
    Ghost,
    /// An asynchronous probe is still in flight.
    Pending,
    /// The device is gone from the system.
    Removed,
}

impl PathState {
    /// Whether the kernel may route I/O through a path in this state.
    pub fn is_usable(self) -> bool {
        matches!(self, PathState::Up | PathState::Ghost)
    }

    pub fn is_failed(self) -> bool {
        matches!(self, PathState::Down | PathState::Shaky)
    }

    /// States that carry no usable health information.
    pub fn is_unclassified(self) -> bool {
        matches!(self, PathState::Wild | PathState::Unchecked)
    }
}

impl std::fmt::Display for PathState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PathState::Unchecked => "unchecked",
            PathState::Wild => "wild",
            PathState::Down => "down",
            PathState::Up => "up",
            PathState::Shaky => "shaky",
            PathState::Ghost => "ghost",
            PathState::Pending => "pending",
            PathState::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// Per-path state as reported by the kernel's multipath target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmPathState {
    #[default]
    Undefined,
    Active,
    Failed,
}

/// Request sent to the kernel to change a path's table state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathAction {
    Fail,
    Reinstate,
}

impl PathAction {
    /// Target message keyword understood by dm-multipath.
    pub fn message(self) -> &'static str {
        match self {
            PathAction::Fail => "fail_path",
            PathAction::Reinstate => "reinstate_path",
        }
    }
}

/// Block device number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DevT {
    pub major: u32,
    pub minor: u32,
}

impl DevT {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl std::fmt::Display for DevT {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

impl std::str::FromStr for DevT {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("Invalid device number: {}", s))?;
        let major = major
            .parse()
            .map_err(|_| format!("Invalid major number: {}", s))?;
        let minor = minor
            .parse()
            .map_err(|_| format!("Invalid minor number: {}", s))?;
        Ok(DevT { major, minor })
    }
}

/// What identity probing learned about a block device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathIdentity {
    /// Kernel device name, e.g. `sdb`.
    pub dev: String,
    pub devt: DevT,
    /// Storage identity shared by every path to the same logical unit.
    /// Empty when the device could not be identified.
    pub wwid: String,
    /// Size in 512-byte sectors.
    pub size: u64,
}

impl PathIdentity {
    pub fn is_identified(&self) -> bool {
        !self.wwid.is_empty()
    }
}
