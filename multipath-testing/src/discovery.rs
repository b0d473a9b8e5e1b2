// SPDX-License-Identifier: GPL-3.0-only

//! Scripted block devices and checkers.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use multipath_contracts::{DeviceDiscovery, EngineError, PathProber};
use multipath_types::{DevT, PathIdentity, PathState};
use parking_lot::Mutex;

#[derive(Debug, Clone)]
struct ScriptedDevice {
    identity: PathIdentity,
    /// State returned once `script` runs dry.
    state: PathState,
    script: VecDeque<PathState>,
    priority: i32,
    message: Option<String>,
    probes: usize,
}

type Devices = Arc<Mutex<BTreeMap<String, ScriptedDevice>>>;

/// Discovery over a set of devices the test controls.
///
/// Probers handed out share the device table, so changing a device's
/// script affects its path's next check.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDiscovery {
    devices: Devices,
}

impl ScriptedDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a healthy device with priority 1.
    pub fn add_device(&self, dev: &str, devt: DevT, wwid: &str, size: u64) {
        self.devices.lock().insert(
            dev.to_string(),
            ScriptedDevice {
                identity: PathIdentity {
                    dev: dev.to_string(),
                    devt,
                    wwid: wwid.to_string(),
                    size,
                },
                state: PathState::Up,
                script: VecDeque::new(),
                priority: 1,
                message: None,
                probes: 0,
            },
        );
    }

    /// Unplug `dev`: its prober's offline test starts reporting it gone.
    pub fn remove_device(&self, dev: &str) {
        self.devices.lock().remove(dev);
    }

    /// Queue states returned by the next probes of `dev`, in order.
    pub fn push_probes(&self, dev: &str, states: &[PathState]) {
        self.with_device(dev, |device| device.script.extend(states.iter().copied()));
    }

    pub fn set_state(&self, dev: &str, state: PathState) {
        self.with_device(dev, |device| {
            device.script.clear();
            device.state = state;
        });
    }

    pub fn set_priority(&self, dev: &str, priority: i32) {
        self.with_device(dev, |device| device.priority = priority);
    }

    pub fn set_message(&self, dev: &str, message: Option<&str>) {
        self.with_device(dev, |device| device.message = message.map(str::to_string));
    }

    pub fn set_wwid(&self, dev: &str, wwid: &str) {
        self.with_device(dev, |device| device.identity.wwid = wwid.to_string());
    }

    /// Number of probes run against `dev`.
    pub fn probe_count(&self, dev: &str) -> usize {
        self.devices
            .lock()
            .get(dev)
            .map(|device| device.probes)
            .unwrap_or_default()
    }

    fn with_device(&self, dev: &str, f: impl FnOnce(&mut ScriptedDevice)) {
        if let Some(device) = self.devices.lock().get_mut(dev) {
            f(device);
        }
    }
}

impl DeviceDiscovery for ScriptedDiscovery {
    fn scan(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.devices.lock().keys().cloned().collect())
    }

    fn identify(&self, dev: &str) -> Result<PathIdentity, EngineError> {
        self.devices
            .lock()
            .get(dev)
            .map(|device| device.identity.clone())
            .ok_or_else(|| EngineError::not_found(format!("{dev}: no such device")))
    }

    fn resolve_devt(&self, devt: DevT) -> Result<String, EngineError> {
        self.devices
            .lock()
            .values()
            .find(|device| device.identity.devt == devt)
            .map(|device| device.identity.dev.clone())
            .ok_or_else(|| EngineError::not_found(format!("no device {devt}")))
    }

    fn select_prober(&self, path: &PathIdentity) -> Box<dyn PathProber> {
        Box::new(ScriptedProber {
            dev: path.dev.clone(),
            devices: self.devices.clone(),
            message: None,
        })
    }
}

/// Prober reading its answers from a [`ScriptedDiscovery`].
#[derive(Debug)]
pub struct ScriptedProber {
    dev: String,
    devices: Devices,
    message: Option<String>,
}

impl PathProber for ScriptedProber {
    fn name(&self) -> &str {
        "scripted"
    }

    fn offline_test(&mut self, _path: &PathIdentity) -> bool {
        !self.devices.lock().contains_key(&self.dev)
    }

    fn probe(&mut self, _path: &PathIdentity, _timeout: Duration) -> PathState {
        let mut devices = self.devices.lock();
        let Some(device) = devices.get_mut(&self.dev) else {
            self.message = None;
            return PathState::Removed;
        };
        device.probes += 1;
        self.message = device.message.clone();
        device.script.pop_front().unwrap_or(device.state)
    }

    fn priority(&mut self, _path: &PathIdentity) -> i32 {
        self.devices
            .lock()
            .get(&self.dev)
            .map(|device| device.priority)
            .unwrap_or_default()
    }

    fn message(&self) -> Option<String> {
        self.message.clone()
    }
}
