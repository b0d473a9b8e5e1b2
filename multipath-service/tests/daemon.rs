// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{MAP, WWID, config};
use multipath_testing::{FakeTableEngine, ScriptedDiscovery};
use multipath_types::DevT;
use multipathd::daemon::resolve_watch_mode;
use multipathd::{
    Daemon, DaemonHandle, DmEventStrategy, ReconcileError, TopologySnapshot, WatchMode,
};

fn wait_for(handle: &DaemonHandle, done: impl Fn(&TopologySnapshot) -> bool) -> TopologySnapshot {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let topology = handle.topology().expect("topology");
        if done(&topology) || Instant::now() > deadline {
            return topology;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn auto_strategy_follows_the_engine() {
    let plain = FakeTableEngine::new();
    let polling = FakeTableEngine::new().with_event_poll();

    assert_eq!(
        resolve_watch_mode(DmEventStrategy::Auto, &plain),
        WatchMode::PerDevice
    );
    assert_eq!(
        resolve_watch_mode(DmEventStrategy::Auto, &polling),
        WatchMode::Centralized
    );
    assert_eq!(
        resolve_watch_mode(DmEventStrategy::Centralized, &plain),
        WatchMode::Centralized
    );
    assert_eq!(
        resolve_watch_mode(DmEventStrategy::PerDevice, &polling),
        WatchMode::PerDevice
    );
}

#[test]
fn daemon_serves_commands_until_shutdown() {
    let table = Arc::new(FakeTableEngine::new().with_event_poll());
    let discovery = ScriptedDiscovery::default();
    discovery.add_device("sdb", DevT::new(8, 16), WWID, common::SIZE);
    discovery.add_device("sdc", DevT::new(8, 32), WWID, common::SIZE);

    let mut daemon = Daemon::new(config(), None, table.clone(), Arc::new(discovery.clone()));
    daemon.start().expect("start");
    assert!(daemon.start().is_err(), "second start is refused");

    let handle = daemon.handle();
    let topology = handle.topology().expect("topology");
    assert_eq!(topology.maps.len(), 1);
    assert_eq!(topology.maps[0].alias, MAP);
    assert!(table.exists(MAP));

    discovery.add_device("sdd", DevT::new(8, 48), WWID, common::SIZE);
    handle.add_path("sdd").expect("add sdd");
    let paths: usize = handle.topology().expect("topology").maps[0]
        .groups
        .iter()
        .map(|group| group.paths.len())
        .sum();
    assert_eq!(paths, 3);

    daemon.shutdown();
    assert!(handle.is_shutting_down());
    assert!(matches!(
        handle.add_path("sde"),
        Err(ReconcileError::Cancelled)
    ));
}

#[test]
fn external_removal_reaches_the_catalog() {
    let table = Arc::new(FakeTableEngine::new().with_event_poll());
    let discovery = ScriptedDiscovery::default();
    discovery.add_device("sdb", DevT::new(8, 16), WWID, common::SIZE);

    let mut daemon = Daemon::new(config(), None, table.clone(), Arc::new(discovery));
    daemon.start().expect("start");
    let handle = daemon.handle();
    assert_eq!(handle.topology().expect("topology").maps.len(), 1);

    table.external_remove(MAP);
    let topology = wait_for(&handle, |t| t.maps.is_empty());
    assert!(topology.maps.is_empty());
    assert!(!daemon.context().watcher.is_watching(MAP));

    daemon.shutdown();
}

#[test]
fn snapshot_serializes_for_diagnostics() {
    let table = Arc::new(FakeTableEngine::new().with_event_poll());
    let discovery = ScriptedDiscovery::default();
    discovery.add_device("sdb", DevT::new(8, 16), WWID, common::SIZE);

    let mut daemon = Daemon::new(config(), None, table, Arc::new(discovery));
    daemon.start().expect("start");
    let topology = daemon.handle().topology().expect("topology");
    daemon.shutdown();

    let json = serde_json::to_value(&topology).expect("serialize");
    assert_eq!(json["maps"][0]["alias"], MAP);
    assert_eq!(json["maps"][0]["wwid"], WWID);
    assert_eq!(json["maps"][0]["groups"][0]["paths"][0]["dev"], "sdb");
    assert!(json["orphans"].as_array().is_some_and(|o| o.is_empty()));
}
