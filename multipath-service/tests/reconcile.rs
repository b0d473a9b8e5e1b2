// SPDX-License-Identifier: GPL-3.0-only

mod common;

use common::{MAP, SIZE, WWID, config, harness};
use multipath_contracts::{ErrorKind, TableEngine};
use multipath_testing::{TableCall, TableOp};
use multipath_types::{
    DevT, DmPathState, GroupingPolicy, MapTable, PathAction, PathState, TableGroup,
};
use multipathd::catalog::TableAction;
use multipathd::{ReconcileError, reconcile};

#[test]
fn second_path_reloads_the_existing_map() {
    let mut h = harness(config());
    h.add("sdb", 16);
    h.add("sdc", 32);

    assert_eq!(
        h.loads(),
        vec![
            TableCall::Create(MAP.to_string()),
            TableCall::Reload(MAP.to_string())
        ]
    );
    assert_eq!(h.members(MAP), vec!["sdb", "sdc"]);
    assert_eq!(h.catalog.map_count(), 1);
    assert_eq!(h.table.live_table(MAP).map(|t| t.path_count()), Some(2));
    assert!(h.ctx.watcher.is_watching(MAP));
    assert_eq!(h.ctx.watcher.event_nr(MAP), h.table.event_nr(MAP));
    h.assert_consistent();
}

#[test]
fn new_paths_are_probed_before_attach() {
    let mut h = harness(config());
    h.add("sdb", 16);
    assert_eq!(h.path("sdb").state, PathState::Up);
    assert_eq!(h.discovery.probe_count("sdb"), 1);
}

#[test]
fn down_path_is_failed_when_the_map_is_created() {
    let mut h = harness(config());
    let sdb = h.plug("sdb", 16, WWID);
    h.discovery.set_state("sdb", PathState::Down);
    h.add_path("sdb");

    assert_eq!(h.path("sdb").state, PathState::Down);
    assert_eq!(h.path("sdb").dm_state, DmPathState::Failed);
    assert_eq!(h.table.path_state(MAP, sdb), Some(DmPathState::Failed));
    assert_eq!(
        h.marks(),
        vec![TableCall::MarkPath(MAP.to_string(), sdb, PathAction::Fail)]
    );
    assert_eq!(h.ctx.watcher.event_nr(MAP), h.table.event_nr(MAP));

    h.passes(3);
    assert_eq!(h.table.path_state(MAP, sdb), Some(DmPathState::Failed));
    assert_eq!(h.marks().len(), 1);
}

#[test]
fn down_path_is_failed_when_added_to_an_existing_map() {
    let mut h = harness(config());
    h.add("sdb", 16);
    let sdc = h.plug("sdc", 32, WWID);
    h.discovery.set_state("sdc", PathState::Down);
    h.table.clear_calls();

    h.add_path("sdc");
    assert_eq!(h.loads(), vec![TableCall::Reload(MAP.to_string())]);
    assert_eq!(
        h.marks(),
        vec![TableCall::MarkPath(MAP.to_string(), sdc, PathAction::Fail)]
    );
    assert_eq!(h.table.path_state(MAP, sdc), Some(DmPathState::Failed));
    assert_eq!(
        h.table.path_state(MAP, DevT::new(8, 16)),
        Some(DmPathState::Active)
    );
}

#[test]
fn failed_path_stays_failed_across_reloads() {
    let mut cfg = config();
    cfg.path_grouping_policy = GroupingPolicy::Multibus;
    let mut h = harness(cfg);
    let sdb = h.plug("sdb", 16, WWID);
    h.add_path("sdb");
    h.add("sdc", 32);
    h.discovery.set_state("sdb", PathState::Down);
    h.pass();
    assert_eq!(h.table.path_state(MAP, sdb), Some(DmPathState::Failed));
    h.table.clear_calls();

    // A new table starts with every path active again.
    h.add("sdd", 48);
    assert_eq!(h.loads(), vec![TableCall::Reload(MAP.to_string())]);
    assert_eq!(
        h.marks(),
        vec![TableCall::MarkPath(MAP.to_string(), sdb, PathAction::Fail)]
    );
    assert_eq!(h.table.path_state(MAP, sdb), Some(DmPathState::Failed));
    assert_eq!(h.path("sdb").dm_state, DmPathState::Failed);
    assert_eq!(
        h.table.path_state(MAP, DevT::new(8, 48)),
        Some(DmPathState::Active)
    );
    assert_eq!(h.ctx.watcher.event_nr(MAP), h.table.event_nr(MAP));
    h.assert_consistent();
}

#[test]
fn adding_a_known_path_is_a_no_op() {
    let mut h = harness(config());
    let first = h.add("sdb", 16);
    let again = h.add_path("sdb");
    assert_eq!(first, again);
    assert_eq!(h.loads().len(), 1);
}

#[test]
fn blacklisted_devices_are_refused() {
    let mut h = harness(config());
    h.plug("loop0", 0, WWID);
    let err = reconcile::add_path(&h.ctx, &mut h.catalog, "loop0").unwrap_err();
    assert!(matches!(err, ReconcileError::Blacklisted(_)));
    assert_eq!(h.catalog.path_count(), 0);
}

#[test]
fn unidentified_path_stays_orphan() {
    let mut h = harness(config());
    h.plug("sdb", 16, "");
    let err = reconcile::add_path(&h.ctx, &mut h.catalog, "sdb").unwrap_err();
    assert!(matches!(err, ReconcileError::NoIdentity(_)));
    assert!(h.path("sdb").is_orphan());
    assert_eq!(h.catalog.map_count(), 0);
    assert!(h.table.calls().is_empty());
    h.assert_consistent();
}

#[test]
fn size_mismatch_drops_the_path() {
    let mut h = harness(config());
    h.add("sdb", 16);
    h.plug_sized("sdc", 32, WWID, SIZE / 2);

    let err = reconcile::add_path(&h.ctx, &mut h.catalog, "sdc").unwrap_err();
    assert!(matches!(err, ReconcileError::SizeMismatch { .. }));
    assert!(h.catalog.find_path("sdc").is_none());
    assert_eq!(h.members(MAP), vec!["sdb"]);
    assert_eq!(h.loads().len(), 1);
    h.assert_consistent();
}

#[test]
fn zero_size_path_creates_nothing() {
    let mut h = harness(config());
    h.plug_sized("sdb", 16, WWID, 0);

    let err = reconcile::add_path(&h.ctx, &mut h.catalog, "sdb").unwrap_err();
    assert!(matches!(err, ReconcileError::ZeroSize(_)));
    assert_eq!(h.catalog.path_count(), 0);
    assert_eq!(h.catalog.map_count(), 0);
    assert!(h.table.calls().is_empty());
}

#[test]
fn removing_paths_reloads_then_flushes() {
    let mut h = harness(config());
    h.add("sdb", 16);
    h.add("sdc", 32);
    h.table.clear_calls();

    reconcile::remove_path(&h.ctx, &mut h.catalog, "sdb").expect("remove sdb");
    assert_eq!(h.loads(), vec![TableCall::Reload(MAP.to_string())]);
    assert_eq!(h.members(MAP), vec!["sdc"]);

    reconcile::remove_path(&h.ctx, &mut h.catalog, "sdc").expect("remove sdc");
    assert_eq!(h.catalog.map_count(), 0);
    assert_eq!(h.catalog.path_count(), 0);
    assert!(!h.table.exists(MAP));
    assert!(!h.ctx.watcher.is_watching(MAP));
    h.assert_consistent();
}

#[test]
fn busy_flush_is_retried_by_the_checker() {
    let mut h = harness(config());
    h.add("sdb", 16);
    h.add("sdc", 32);

    reconcile::remove_path(&h.ctx, &mut h.catalog, "sdb").expect("remove sdb");
    h.table.set_busy(MAP, true);
    reconcile::remove_path(&h.ctx, &mut h.catalog, "sdc").expect("remove sdc");

    let map = h.map(MAP);
    assert!(map.paths.is_empty());
    assert!(map.flush_pending);
    assert!(h.table.exists(MAP));

    h.pass();
    assert!(h.table.exists(MAP), "still open");
    assert_eq!(h.catalog.map_count(), 1);

    h.table.set_busy(MAP, false);
    h.pass();
    assert_eq!(h.catalog.map_count(), 0);
    assert!(!h.table.exists(MAP));
    h.assert_consistent();
}

#[test]
fn flush_of_open_map_reports_busy() {
    let mut h = harness(config());
    h.add("sdb", 16);
    h.table.set_busy(MAP, true);

    let err = reconcile::flush(&h.ctx, &mut h.catalog, MAP).unwrap_err();
    assert!(matches!(err, ReconcileError::Busy(_)));
    assert_eq!(h.members(MAP), vec!["sdb"]);

    h.table.set_busy(MAP, false);
    reconcile::flush(&h.ctx, &mut h.catalog, MAP).expect("flush");
    assert_eq!(h.catalog.map_count(), 0);
    assert!(h.path("sdb").is_orphan());
    h.assert_consistent();
}

#[test]
fn create_gives_up_after_retries() {
    let mut h = harness(config());
    h.plug("sdb", 16, WWID);
    h.table.fail(TableOp::Create, ErrorKind::Busy, 4);

    let err = reconcile::add_path(&h.ctx, &mut h.catalog, "sdb").unwrap_err();
    assert!(matches!(err, ReconcileError::Table { .. }));
    assert_eq!(h.loads().len(), 4);
    assert_eq!(h.catalog.map_count(), 0);
    assert!(h.path("sdb").is_orphan());
    h.assert_consistent();
}

#[test]
fn permanent_create_failure_is_not_retried() {
    let mut h = harness(config());
    h.plug("sdb", 16, WWID);
    h.table.fail(TableOp::Create, ErrorKind::InvalidInput, 1);

    assert!(reconcile::add_path(&h.ctx, &mut h.catalog, "sdb").is_err());
    assert_eq!(h.loads().len(), 1);
}

#[test]
fn transient_create_failure_recovers() {
    let mut h = harness(config());
    h.plug("sdb", 16, WWID);
    h.table.fail(TableOp::Create, ErrorKind::Timeout, 2);

    h.add_path("sdb");
    assert_eq!(h.loads().len(), 3);
    assert_eq!(h.map(MAP).stats.map_loads, 1);
}

#[test]
fn exhausted_reload_is_retried_by_the_checker() {
    let mut h = harness(config());
    h.add("sdb", 16);
    h.plug("sdc", 32, WWID);
    h.table.fail(TableOp::Reload, ErrorKind::Busy, 4);

    assert!(reconcile::add_path(&h.ctx, &mut h.catalog, "sdc").is_err());
    assert_eq!(h.members(MAP), vec!["sdb", "sdc"]);
    assert_eq!(h.map(MAP).action, TableAction::Reload);
    assert_eq!(h.table.live_table(MAP).map(|t| t.path_count()), Some(1));

    h.pass();
    assert_eq!(h.map(MAP).action, TableAction::Nothing);
    assert_eq!(h.table.live_table(MAP).map(|t| t.path_count()), Some(2));
    h.assert_consistent();
}

#[test]
fn alias_collision_refuses_second_wwid() {
    let mut cfg = config();
    cfg.multipaths.push(multipathd::config::MultipathOverride {
        wwid: "3600a0980other".to_string(),
        alias: Some("mpathb".to_string()),
        ..Default::default()
    });
    let mut h = harness(cfg);
    h.add("sdb", 16);
    // A map adopted under the alias reserved for another WWID.
    h.plug("sdd", 48, "3600a0980third");
    let table = MapTable {
        size: SIZE,
        wwid: "3600a0980third".to_string(),
        queue_if_no_path: false,
        groups: vec![TableGroup {
            selector: "service-time".to_string(),
            paths: vec![DevT::new(8, 48)],
        }],
        initial_group: 0,
    };
    h.table.external_create("mpathb", &table);
    reconcile::add_map(&h.ctx, &mut h.catalog, "mpathb").expect("adopt mpathb");

    h.plug("sdc", 32, "3600a0980other");
    let err = reconcile::add_path(&h.ctx, &mut h.catalog, "sdc").unwrap_err();
    assert!(matches!(err, ReconcileError::AliasInUse { .. }));
    assert_eq!(h.catalog.map_count(), 2);
    h.assert_consistent();
}

#[test]
fn existing_map_is_adopted_and_forgotten() {
    let mut h = harness(config());
    let sdd = h.plug("sdd", 48, WWID);
    let sde = h.plug("sde", 64, WWID);
    let table = MapTable {
        size: SIZE,
        wwid: WWID.to_string(),
        queue_if_no_path: false,
        groups: vec![
            TableGroup {
                selector: "service-time".to_string(),
                paths: vec![sdd],
            },
            TableGroup {
                selector: "service-time".to_string(),
                paths: vec![sde],
            },
        ],
        initial_group: 0,
    };
    h.table.external_create(MAP, &table);

    reconcile::add_map(&h.ctx, &mut h.catalog, MAP).expect("adopt");
    assert_eq!(h.members(MAP), vec!["sdd", "sde"]);
    assert_eq!(h.path("sdd").state, PathState::Up);
    assert_eq!(
        h.map(MAP).devt,
        Some(h.table.get_info(MAP).expect("info").devt)
    );
    assert!(h.ctx.watcher.is_watching(MAP));
    assert!(h.loads().is_empty());

    h.table.external_remove(MAP);
    reconcile::remove_map(&h.ctx, &mut h.catalog, MAP).expect("remove");
    assert_eq!(h.catalog.map_count(), 0);
    assert_eq!(h.catalog.path_count(), 0);
    assert!(!h.ctx.watcher.is_watching(MAP));
    h.assert_consistent();
}

#[test]
fn foreign_maps_are_not_adopted() {
    let mut h = harness(config());
    h.table.external_create_linear("vg0-root", SIZE);
    let err = reconcile::add_map(&h.ctx, &mut h.catalog, "vg0-root").unwrap_err();
    assert!(matches!(err, ReconcileError::NotMultipath(_)));

    let err = reconcile::add_map(&h.ctx, &mut h.catalog, "missing").unwrap_err();
    assert!(matches!(err, ReconcileError::MapNotFound(_)));
    assert_eq!(h.catalog.map_count(), 0);
}

#[test]
fn initial_scan_builds_the_topology() {
    let mut cfg = config();
    cfg.path_grouping_policy = GroupingPolicy::Multibus;
    let mut h = harness(cfg);
    h.plug("sdb", 16, WWID);
    h.plug("sdc", 32, WWID);
    h.plug("sdd", 48, "3600a0980other");
    h.plug("loop0", 0, WWID);

    reconcile::initial_scan(&h.ctx, &mut h.catalog).expect("scan");
    assert_eq!(h.catalog.map_count(), 2);
    assert_eq!(h.catalog.path_count(), 3);
    assert_eq!(h.members(MAP), vec!["sdb", "sdc"]);
    assert_eq!(h.map(MAP).groups.len(), 1);
    h.assert_consistent();

    reconcile::reconfigure(&h.ctx, &mut h.catalog).expect("reconfigure");
    assert_eq!(h.catalog.map_count(), 2);
    assert_eq!(h.members(MAP), vec!["sdb", "sdc"]);
    h.assert_consistent();
}
