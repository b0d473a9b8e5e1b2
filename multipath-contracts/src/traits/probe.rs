// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use multipath_types::{DevT, PathIdentity, PathState};

use crate::EngineError;

/// Health checker and prioritizer bound to a single path.
///
/// One instance is selected per path when the path is first seen and lives
/// as long as the path does, so implementations may keep per-path state.
pub trait PathProber: Send {
    fn name(&self) -> &str;

    /// Cheap test run before every probe. `true` means the device is
    /// physically gone and the path should be destroyed.
    fn offline_test(&mut self, path: &PathIdentity) -> bool;

    /// Full health probe. Failures are reported as a state, never as an error.
    fn probe(&mut self, path: &PathIdentity, timeout: Duration) -> PathState;

    fn priority(&mut self, path: &PathIdentity) -> i32;

    /// Message produced by the last probe, if any.
    fn message(&self) -> Option<String>;
}

/// Block device discovery and identity probing.
pub trait DeviceDiscovery: Send + Sync {
    /// Names of every block device that may be a path.
    fn scan(&self) -> Result<Vec<String>, EngineError>;

    /// Identity of `dev`. An unidentifiable device yields an empty WWID.
    fn identify(&self, dev: &str) -> Result<PathIdentity, EngineError>;

    /// Kernel name of the block device with number `devt`.
    fn resolve_devt(&self, devt: DevT) -> Result<String, EngineError>;

    /// Pick the checker implementation for a newly seen path.
    fn select_prober(&self, path: &PathIdentity) -> Box<dyn PathProber>;
}
