// SPDX-License-Identifier: GPL-3.0-only

//! Path group selection and failback.

use multipath_types::{FailbackPolicy, GroupingPolicy};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, MapKey, Multipath, PathGroupStatus, PathKey};
use crate::context::EngineContext;
use crate::error::{ReconcileError, Result};
use crate::{groups, reconcile};

/// What the failback policy wants done with the active group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailbackDecision {
    Stay,
    Switch(usize),
    /// Start (or restart) a countdown towards `group`.
    Defer { group: usize, ticks: u32 },
}

/// Index of the enabled group with the highest aggregate priority.
///
/// Ties go to the lower index. Without any enabled group the active group is kept.
pub fn select_best_group(map: &Multipath) -> usize {
    let mut best: Option<(usize, i32)> = None;
    for (index, group) in map.groups.iter().enumerate() {
        if group.status != PathGroupStatus::Enabled {
            continue;
        }
        match best {
            Some((_, priority)) if priority >= group.priority => {}
            _ => best = Some((index, group.priority)),
        }
    }
    best.map(|(index, _)| index)
        .unwrap_or_else(|| map.active_group.min(map.groups.len().saturating_sub(1)))
}

/// Pure failback decision.
///
/// `pending` is the group a running countdown targets, if any.
/// `followover_ok` tells whether the recomputation was triggered by the first
/// recovering path of `best`.
pub fn decide(
    policy: FailbackPolicy,
    active: usize,
    best: usize,
    pending: Option<usize>,
    followover_ok: bool,
) -> FailbackDecision {
    if best == active {
        return FailbackDecision::Stay;
    }
    match policy {
        FailbackPolicy::Manual => FailbackDecision::Stay,
        FailbackPolicy::Immediate => FailbackDecision::Switch(best),
        FailbackPolicy::Deferred(ticks) => {
            if pending == Some(best) {
                FailbackDecision::Stay
            } else {
                FailbackDecision::Defer { group: best, ticks }
            }
        }
        FailbackPolicy::Followover => {
            if followover_ok {
                FailbackDecision::Switch(best)
            } else {
                FailbackDecision::Stay
            }
        }
    }
}

/// Whether `trigger` is the first path of group `best` to come back while
/// the rest of that group is still down.
pub fn followover_allows(
    catalog: &Catalog,
    map: MapKey,
    best: usize,
    trigger: Option<PathKey>,
) -> bool {
    let Some(trigger) = trigger else {
        return false;
    };
    let Some(group) = catalog.map(map).and_then(|m| m.groups.get(best)) else {
        return false;
    };
    if !group.paths.contains(&trigger) {
        return false;
    }
    group
        .paths
        .iter()
        .filter(|key| **key != trigger)
        .filter_map(|key| catalog.path(*key))
        .all(|path| !path.state.is_usable())
}

/// Recompute the best group of `map` and act on the failback policy.
///
/// With `refresh_priorities` every member's priority is re-read first.
/// `trigger` is the path whose recovery caused the recomputation.
pub fn recompute(
    ctx: &EngineContext,
    catalog: &mut Catalog,
    map: MapKey,
    refresh_priorities: bool,
    trigger: Option<PathKey>,
) -> Result<FailbackDecision> {
    if refresh_priorities {
        for key in catalog.members(map) {
            if let Some(path) = catalog.path_mut(key) {
                path.refresh_priority();
            }
        }
    }

    let regroup = catalog
        .map(map)
        .is_some_and(|m| m.settings.grouping == GroupingPolicy::GroupByPrio)
        && groups::layout_changed(catalog, map);
    if regroup {
        debug!("priorities changed the group layout, reloading");
        groups::rebuild_groups(catalog, map);
        if let Some(m) = catalog.map_mut(map) {
            m.best_group = select_best_group(m);
        }
        reconcile::reload_map(ctx, catalog, map)?;
    } else {
        groups::refresh_group_priorities(catalog, map);
    }

    let Some(m) = catalog.map(map) else {
        return Err(ReconcileError::MapNotFound(format!("{map:?}")));
    };
    let best = select_best_group(m);
    let pending = (m.failback_tick > 0).then_some(m.best_group);
    let followover_ok = m.settings.failback == FailbackPolicy::Followover
        && followover_allows(catalog, map, best, trigger);
    let decision = decide(m.settings.failback, m.active_group, best, pending, followover_ok);

    let Some(m) = catalog.map_mut(map) else {
        return Err(ReconcileError::MapNotFound(format!("{map:?}")));
    };
    m.best_group = best;
    match decision {
        FailbackDecision::Stay => {
            if best == m.active_group {
                m.failback_tick = 0;
            }
        }
        FailbackDecision::Switch(group) => {
            apply(ctx, m, group)?;
        }
        FailbackDecision::Defer { group, ticks } => {
            debug!(
                "{}: failback to group #{} in {} ticks",
                m.alias,
                group + 1,
                ticks
            );
            m.failback_tick = ticks;
        }
    }
    Ok(decision)
}

/// Make `group` the active group of `map`. No-op if it already is.
pub fn apply(ctx: &EngineContext, map: &mut Multipath, group: usize) -> Result<bool> {
    if map.active_group == group || group >= map.groups.len() {
        return Ok(false);
    }
    ctx.table
        .switch_group(&map.alias, group)
        .map_err(|e| ReconcileError::table(&map.alias, e))?;

    info!("{}: switch to path group #{}", map.alias, group + 1);
    map.active_group = group;
    map.failback_tick = 0;
    map.stats.switch_group += 1;
    Ok(true)
}

/// Advance the deferred failback countdown of `map` by one checker pass.
pub fn failback_tick(ctx: &EngineContext, catalog: &mut Catalog, map: MapKey) {
    let Some(m) = catalog.map_mut(map) else {
        return;
    };
    if m.failback_tick == 0 {
        return;
    }
    m.failback_tick -= 1;
    if m.failback_tick > 0 {
        return;
    }

    let target = m.best_group;
    if let Err(e) = apply(ctx, m, target) {
        warn!("{}: deferred failback failed: {}", m.alias, e);
    }
}
