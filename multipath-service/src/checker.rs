// SPDX-License-Identifier: GPL-3.0-only

//! Periodic path health checks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use multipath_types::{DevT, DmPathState, LogCheckerErr, PathAction, PathState};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, MapKey, PathKey, SharedCatalog};
use crate::config::DaemonConfig;
use crate::context::{EngineContext, sleep_cancellable};
use crate::failover;
use crate::reconcile::{self, MapPresence};

pub const CHECKER_TICK: Duration = Duration::from_secs(1);

/// Check one path if its countdown has elapsed. Returns true if the check
/// changed the kernel table or the topology.
pub fn check_path(ctx: &EngineContext, catalog: &mut Catalog, key: PathKey) -> bool {
    let config = ctx.config();
    let timeout = ctx.checker_timeout();

    let Some(path) = catalog.path_mut(key) else {
        return false;
    };
    if path.tick > 1 {
        path.tick -= 1;
        return false;
    }
    path.tick = path.check_interval;
    let dev = path.dev().to_string();

    if path.prober.offline_test(&path.identity) {
        info!("{}: device removed", dev);
        remove_gone_path(ctx, catalog, key, &dev);
        return true;
    }

    let new_state = path.probe(timeout);
    match new_state {
        PathState::Removed => {
            info!("{}: checker reports the device removed", dev);
            remove_gone_path(ctx, catalog, key, &dev);
            return true;
        }
        PathState::Pending => {
            path.tick = 1;
            return false;
        }
        PathState::Wild | PathState::Unchecked => {
            debug!("{}: checker returned {}, re-reading identity", dev, new_state);
            return match reconcile::reidentify_path(ctx, catalog, key) {
                Ok(moved) => moved,
                Err(e) => {
                    warn!("{}: {}", dev, e);
                    false
                }
            };
        }
        _ => {}
    }

    let Some(map) = path.map else {
        path.prev_state = path.state;
        path.state = new_state;
        check_orphan(ctx, catalog, key, &dev);
        return false;
    };

    match reconcile::sync_map_state(ctx, catalog, map) {
        Ok(MapPresence::Present(_)) => {}
        Ok(MapPresence::Gone) => {
            warn!("{}: map of this path vanished", dev);
            reconcile::remove_map_key(ctx, catalog, map);
            return true;
        }
        Err(e) => debug!("{}: cannot refresh kernel state: {}", dev, e),
    }

    handle_transition(ctx, catalog, key, map, new_state, &config)
}

fn remove_gone_path(ctx: &EngineContext, catalog: &mut Catalog, key: PathKey, dev: &str) {
    if let Err(e) = reconcile::remove_path_key(ctx, catalog, key) {
        warn!("{}: removal incomplete: {}", dev, e);
    }
}

/// Orphans that had no identity are retried once identification succeeds.
fn check_orphan(ctx: &EngineContext, catalog: &mut Catalog, key: PathKey, dev: &str) {
    let identified = catalog
        .path(key)
        .is_some_and(|path| path.identity.is_identified());
    if identified {
        return;
    }
    if let Err(e) = reconcile::refresh_identity(ctx, catalog, key) {
        debug!("{}: {}", dev, e);
        return;
    }
    if catalog
        .path(key)
        .is_some_and(|path| path.identity.is_identified())
        && let Err(e) = reconcile::attach_path(ctx, catalog, key)
    {
        warn!("{}: cannot attach: {}", dev, e);
    }
}

fn mark(ctx: &EngineContext, alias: &str, dev: &str, devt: DevT, action: PathAction) -> bool {
    match ctx.table.mark_path(alias, devt, action) {
        Ok(()) => true,
        Err(e) => {
            warn!("{}: {} {} failed: {}", alias, action.message(), dev, e);
            false
        }
    }
}

fn handle_transition(
    ctx: &EngineContext,
    catalog: &mut Catalog,
    key: PathKey,
    map: MapKey,
    new_state: PathState,
    config: &DaemonConfig,
) -> bool {
    let Some(alias) = catalog.map(map).map(|m| m.alias.clone()) else {
        return false;
    };
    let Some(path) = catalog.path_mut(key) else {
        return false;
    };
    let old_state = path.state;
    let dev = path.dev().to_string();
    let devt = path.devt();
    let mut acted = false;
    let mut failed = false;
    let mut recovered = false;

    if new_state != old_state {
        path.prev_state = old_state;
    }

    if new_state.is_failed() {
        if old_state.is_usable() {
            info!("{}: {} is {}", alias, dev, new_state);
            if mark(ctx, &alias, &dev, devt, PathAction::Fail) {
                path.dm_state = DmPathState::Failed;
            }
            path.failures += 1;
            failed = true;
            acted = true;
        } else if new_state != old_state && path.dm_state == DmPathState::Active {
            if mark(ctx, &alias, &dev, devt, PathAction::Fail) {
                path.dm_state = DmPathState::Failed;
            }
            acted = true;
        } else if new_state == PathState::Down
            && new_state == old_state
            && let Some(message) = &path.message
        {
            match config.log_checker_err {
                LogCheckerErr::Always => info!("{}: {}", dev, message),
                LogCheckerErr::Once if !path.message_logged => {
                    info!("{}: {}", dev, message);
                    path.message_logged = true;
                }
                LogCheckerErr::Once => debug!("{}: {}", dev, message),
            }
        }
        path.check_interval = config.polling_interval;
    } else if new_state.is_usable() {
        if !old_state.is_usable() {
            info!("{}: {} is {}", alias, dev, new_state);
            if mark(ctx, &alias, &dev, devt, PathAction::Reinstate) {
                path.dm_state = DmPathState::Active;
            }
            recovered = true;
            path.check_interval = config.polling_interval;
            acted = true;
        } else if path.dm_state == DmPathState::Failed {
            debug!("{}: kernel has {} failed, reinstating", alias, dev);
            if mark(ctx, &alias, &dev, devt, PathAction::Reinstate) {
                path.dm_state = DmPathState::Active;
            }
            acted = true;
        } else if new_state == old_state {
            path.check_interval = path
                .check_interval
                .saturating_mul(2)
                .min(config.max_check_interval())
                .max(config.polling_interval);
        } else {
            path.check_interval = config.polling_interval;
        }
        path.message_logged = false;
    }

    path.state = new_state;
    path.tick = path.check_interval;

    let newly_active = recovered && old_state == PathState::Down;
    if !newly_active {
        path.refresh_priority();
    }

    if failed && let Some(m) = catalog.map_mut(map) {
        m.stats.path_failures += 1;
        m.failback_tick = 0;
    }

    reconcile::update_queue_mode(ctx, catalog, map);
    let trigger = recovered.then_some(key);
    if let Err(e) = failover::recompute(ctx, catalog, map, newly_active, trigger) {
        warn!("{}: cannot recompute path groups: {}", alias, e);
    }
    acted
}

/// One checker pass: advance device countdowns, check every path, then
/// retry pending flushes and reloads.
pub fn checker_pass(ctx: &EngineContext, catalog: &mut Catalog) -> usize {
    for map in catalog.map_keys() {
        failover::failback_tick(ctx, catalog, map);
        reconcile::retry_tick(ctx, catalog, map);
    }

    let mut acted = 0;
    for key in catalog.path_keys() {
        if check_path(ctx, catalog, key) {
            acted += 1;
        }
    }

    reconcile::retry_pending(ctx, catalog);
    acted
}

/// Checker worker: one pass per tick until cancelled.
pub fn run_checker(ctx: Arc<EngineContext>, catalog: SharedCatalog, token: CancellationToken) {
    info!("path checker started");
    loop {
        let started = Instant::now();
        let Some(mut guard) = catalog.lock_unless_cancelled(&token) else {
            break;
        };
        let acted = checker_pass(&ctx, &mut guard);
        let (maps, paths) = (guard.map_count(), guard.path_count());
        drop(guard);

        if acted > 0 {
            debug!(
                "checker pass acted on {} paths ({} maps, {} paths known)",
                acted, maps, paths
            );
        }
        if !sleep_cancellable(&token, CHECKER_TICK.saturating_sub(started.elapsed())) {
            break;
        }
    }
    info!("path checker stopped");
}
