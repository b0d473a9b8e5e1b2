// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use multipath_types::{DevT, MapInfo, MapName, MapStatus, MapTable, PathAction, WaitOutcome};

use crate::EngineError;

/// Kernel table engine (device-mapper) as seen by the daemon.
///
/// Every call may block on kernel I/O. Implementations must be safe to call
/// from several worker threads at once.
pub trait TableEngine: Send + Sync {
    /// Create `name` and load `table` into it.
    fn create(&self, name: &str, table: &MapTable) -> Result<(), EngineError>;

    /// Replace the live table of `name`.
    fn reload(&self, name: &str, table: &MapTable) -> Result<(), EngineError>;

    fn suspend(&self, name: &str) -> Result<(), EngineError>;

    fn resume(&self, name: &str) -> Result<(), EngineError>;

    /// Remove `name`. Fails with [`crate::ErrorKind::Busy`] while the device is open.
    fn remove(&self, name: &str, no_flush: bool) -> Result<(), EngineError>;

    /// Info on `name`; a missing device is reported with `exists == false`.
    fn get_info(&self, name: &str) -> Result<MapInfo, EngineError>;

    /// Per-group and per-path state of the live table.
    fn status(&self, name: &str) -> Result<MapStatus, EngineError>;

    /// The live table of `name`, decoded.
    fn table(&self, name: &str) -> Result<MapTable, EngineError>;

    /// Every multipath device together with its event counter.
    fn list_names(&self) -> Result<Vec<MapName>, EngineError>;

    fn get_event_counter(&self, name: &str) -> Result<u32, EngineError>;

    /// Make the zero-based `group` the active path group.
    fn switch_group(&self, name: &str, group: usize) -> Result<(), EngineError>;

    fn mark_path(&self, name: &str, devt: DevT, action: PathAction) -> Result<(), EngineError>;

    /// Toggle `queue_if_no_path` on the live table.
    fn set_queueing(&self, name: &str, queue: bool) -> Result<(), EngineError>;

    /// Whether [`TableEngine::wait_any`] is implemented.
    fn supports_event_poll(&self) -> bool {
        false
    }

    /// Block until any device's event counter changes or `timeout` elapses.
    /// Returns `true` when woken by an event.
    fn wait_any(&self, timeout: Duration) -> Result<bool, EngineError> {
        let _ = timeout;
        Err(EngineError::unsupported("multiplexed event wait"))
    }

    /// Block until the event counter of `name` moves past `event_nr`.
    fn wait_event(
        &self,
        name: &str,
        event_nr: u32,
        timeout: Duration,
    ) -> Result<WaitOutcome, EngineError>;
}
