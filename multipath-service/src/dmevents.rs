// SPDX-License-Identifier: GPL-3.0-only

//! Device-mapper table event watching.
//!
//! Every device the daemon owns has a watch entry holding the last event
//! counter the daemon has processed. Watchers publish [`DmEvent`]s on a
//! channel; the consumer applies them to the catalog and acknowledges the
//! entry afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use multipath_contracts::{EngineError, TableEngine};
use multipath_types::WaitOutcome;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, SharedCatalog};
use crate::context::{EngineContext, sleep_cancellable};
use crate::reconcile::{self, Resync};

/// Upper bound for one blocking wait, so cancellation is noticed.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(1);
/// Delay before a failed per-device wait is re-armed.
pub const REARM_DELAY: Duration = Duration::from_secs(1);
/// Interval of the polling pass when no multiplexed wait is available.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
const CONSUMER_WAIT: Duration = Duration::from_millis(200);

/// Resolved watching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Centralized,
    PerDevice,
}

/// A change noticed on a watched device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmEvent {
    Changed { name: String, event_nr: u32 },
    Removed { name: String },
}

impl DmEvent {
    pub fn name(&self) -> &str {
        match self {
            DmEvent::Changed { name, .. } | DmEvent::Removed { name } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    None,
    Update(u32),
    Remove,
}

#[derive(Debug)]
pub struct WatchEntry {
    pub name: String,
    pub event_nr: u32,
    pub action: PendingAction,
    waiter: Option<Waiter>,
}

#[derive(Debug)]
struct Waiter {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Registry of watched devices and the workers feeding the event channel.
pub struct DmEventWatcher {
    mode: WatchMode,
    table: Arc<dyn TableEngine>,
    events: Sender<DmEvent>,
    token: CancellationToken,
    entries: Mutex<HashMap<String, WatchEntry>>,
}

impl DmEventWatcher {
    pub fn new(
        mode: WatchMode,
        table: Arc<dyn TableEngine>,
        events: Sender<DmEvent>,
        token: CancellationToken,
    ) -> Self {
        Self {
            mode,
            table,
            events,
            token,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> WatchMode {
        self.mode
    }

    /// Start watching `name` from `event_nr`, or move an existing entry's
    /// counter forward to it.
    pub fn watch(&self, name: &str, event_nr: u32) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(name) {
            entry.event_nr = event_nr;
            entry.action = PendingAction::None;
            return;
        }

        let waiter = match self.mode {
            WatchMode::Centralized => None,
            WatchMode::PerDevice => self.spawn_waiter(name, event_nr),
        };
        debug!("{}: watching table events from {}", name, event_nr);
        entries.insert(
            name.to_string(),
            WatchEntry {
                name: name.to_string(),
                event_nr,
                action: PendingAction::None,
                waiter,
            },
        );
    }

    pub fn unwatch(&self, name: &str) {
        let entry = self.entries.lock().remove(name);
        if let Some(entry) = entry {
            debug!("{}: stopped watching table events", name);
            stop_waiter(entry.waiter, false);
        }
    }

    /// Drop every entry and wait for per-device waiters to exit.
    pub fn unwatch_all(&self) {
        let drained: Vec<WatchEntry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        for entry in drained {
            stop_waiter(entry.waiter, true);
        }
    }

    pub fn is_watching(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    pub fn event_nr(&self, name: &str) -> Option<u32> {
        self.entries.lock().get(name).map(|entry| entry.event_nr)
    }

    pub fn pending(&self, name: &str) -> Option<PendingAction> {
        self.entries.lock().get(name).map(|entry| entry.action)
    }

    pub fn watched(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Record that `name` was processed up to `event_nr`.
    pub fn acknowledge(&self, name: &str, event_nr: u32) {
        if let Some(entry) = self.entries.lock().get_mut(name) {
            entry.event_nr = event_nr;
            entry.action = PendingAction::None;
        }
    }

    /// Clear the pending action of `name` without moving its counter, so the
    /// next pass reports it again.
    pub fn retry_later(&self, name: &str) {
        if let Some(entry) = self.entries.lock().get_mut(name) {
            entry.action = PendingAction::None;
        }
    }

    /// Compare every entry against the kernel's device list and publish the
    /// differences. Entries still being processed are skipped.
    pub fn poll_pass(&self) -> Result<usize, EngineError> {
        let names = self.table.list_names()?;
        let current: HashMap<&str, u32> = names
            .iter()
            .map(|entry| (entry.name.as_str(), entry.event_nr))
            .collect();

        let mut events = Vec::new();
        {
            let mut entries = self.entries.lock();
            for entry in entries.values_mut() {
                if entry.action != PendingAction::None {
                    continue;
                }
                match current.get(entry.name.as_str()) {
                    None => {
                        entry.action = PendingAction::Remove;
                        events.push(DmEvent::Removed {
                            name: entry.name.clone(),
                        });
                    }
                    Some(&event_nr) if event_nr != entry.event_nr => {
                        entry.action = PendingAction::Update(event_nr);
                        events.push(DmEvent::Changed {
                            name: entry.name.clone(),
                            event_nr,
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        let count = events.len();
        for event in events {
            if self.events.send(event).is_err() {
                debug!("dm event consumer is gone");
                break;
            }
        }
        Ok(count)
    }

    fn spawn_waiter(&self, name: &str, event_nr: u32) -> Option<Waiter> {
        let token = self.token.child_token();
        let table = self.table.clone();
        let events = self.events.clone();
        let device = name.to_string();
        let waiter_token = token.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("dmevent-{name}"))
            .spawn(move || run_device_waiter(device, event_nr, table, events, waiter_token));
        match spawned {
            Ok(handle) => Some(Waiter { token, handle }),
            Err(e) => {
                warn!("{}: cannot start event waiter: {}", name, e);
                None
            }
        }
    }
}

impl Drop for DmEventWatcher {
    fn drop(&mut self) {
        self.unwatch_all();
    }
}

fn stop_waiter(waiter: Option<Waiter>, join: bool) {
    let Some(waiter) = waiter else {
        return;
    };
    waiter.token.cancel();
    if !join || waiter.handle.thread().id() == std::thread::current().id() {
        return;
    }
    if waiter.handle.join().is_err() {
        warn!("dm event waiter panicked");
    }
}

/// First few failures, then every 60th.
fn should_log_failure(failures: u32) -> bool {
    failures <= 3 || failures % 60 == 0
}

fn run_device_waiter(
    name: String,
    mut event_nr: u32,
    table: Arc<dyn TableEngine>,
    events: Sender<DmEvent>,
    token: CancellationToken,
) {
    let mut failures = 0u32;
    while !token.is_cancelled() {
        match table.wait_event(&name, event_nr, WAIT_TIMEOUT) {
            Ok(WaitOutcome::TimedOut) => {}
            Ok(WaitOutcome::Changed(current)) => {
                failures = 0;
                if current == event_nr || token.is_cancelled() {
                    continue;
                }
                event_nr = current;
                let event = DmEvent::Changed {
                    name: name.clone(),
                    event_nr,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Ok(WaitOutcome::Gone) => {
                if !token.is_cancelled() {
                    let _ = events.send(DmEvent::Removed { name: name.clone() });
                }
                break;
            }
            Err(e) => {
                failures += 1;
                if should_log_failure(failures) {
                    warn!(
                        "{}: event wait failed ({} times), re-arming: {}",
                        name, failures, e
                    );
                }
                if !sleep_cancellable(&token, REARM_DELAY) {
                    break;
                }
            }
        }
    }
    debug!("{}: event waiter stopped", name);
}

/// Apply one event to the catalog and settle the watch entry.
pub fn apply_event(ctx: &EngineContext, catalog: &mut Catalog, event: &DmEvent) {
    match event {
        DmEvent::Removed { name } => {
            match reconcile::remove_map(ctx, catalog, name) {
                Ok(()) => info!("{}: removed outside the daemon", name),
                Err(e) => debug!("{}: {}", name, e),
            }
            ctx.watcher.unwatch(name);
        }
        DmEvent::Changed { name, event_nr } => match reconcile::resync_map(ctx, catalog, name) {
            Ok(Resync::Gone) => ctx.watcher.unwatch(name),
            Ok(Resync::Updated(current)) => {
                ctx.watcher.acknowledge(name, current.max(*event_nr));
            }
            Err(e) => {
                warn!("{}: resync failed, will retry: {}", name, e);
                ctx.watcher.retry_later(name);
            }
        },
    }
}

/// Consumer worker: applies published events under the catalog lock.
pub fn run_consumer(
    ctx: Arc<EngineContext>,
    catalog: SharedCatalog,
    events: Receiver<DmEvent>,
    token: CancellationToken,
) {
    info!("dm event consumer started");
    while !token.is_cancelled() {
        let event = match events.recv_timeout(CONSUMER_WAIT) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let Some(mut guard) = catalog.lock_unless_cancelled(&token) else {
            break;
        };
        apply_event(&ctx, &mut guard, &event);
    }
    info!("dm event consumer stopped");
}

/// Centralized watcher: one multiplexed wait, then one pass over all devices.
pub fn run_poller(ctx: Arc<EngineContext>, token: CancellationToken) {
    info!("dm event poller started");
    let multiplexed = ctx.table.supports_event_poll();
    let mut failures = 0u32;

    while !token.is_cancelled() {
        if multiplexed {
            if let Err(e) = ctx.table.wait_any(WAIT_TIMEOUT) {
                debug!("multiplexed event wait failed: {}", e);
                if !sleep_cancellable(&token, REARM_DELAY) {
                    break;
                }
            }
        } else if !sleep_cancellable(&token, POLL_INTERVAL) {
            break;
        }
        if token.is_cancelled() {
            break;
        }

        match ctx.watcher.poll_pass() {
            Ok(count) => {
                failures = 0;
                if count > 0 {
                    debug!("dm event pass found {} changes", count);
                }
            }
            Err(e) => {
                failures += 1;
                if should_log_failure(failures) {
                    warn!("dm event pass failed, retrying: {}", e);
                }
            }
        }
    }
    info!("dm event poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_logging_is_capped() {
        let logged: Vec<u32> = (1..=130).filter(|n| should_log_failure(*n)).collect();
        assert_eq!(logged, vec![1, 2, 3, 60, 120]);
    }

    #[test]
    fn event_names() {
        let changed = DmEvent::Changed {
            name: "mpatha".to_string(),
            event_nr: 4,
        };
        assert_eq!(changed.name(), "mpatha");
        assert_eq!(
            DmEvent::Removed {
                name: "mpathb".to_string()
            }
            .name(),
            "mpathb"
        );
    }
}
