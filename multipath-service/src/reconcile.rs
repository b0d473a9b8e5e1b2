// SPDX-License-Identifier: GPL-3.0-only

//! Keeps the kernel's multipath tables consistent with the catalog.
//!
//! Every function here runs with the catalog lock held by the caller and
//! receives the locked catalog as `&mut Catalog`.

use std::collections::BTreeSet;

use multipath_types::{DevT, DmPathState, NoPathRetry, PathAction, PathState};
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, MapKey, Multipath, Path, PathKey, TableAction};
use crate::context::EngineContext;
use crate::error::{ReconcileError, Result};
use crate::{failover, groups};

/// Whether a device still exists in the kernel after a state refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapPresence {
    /// Present, with its current event counter.
    Present(u32),
    Gone,
}

/// Outcome of re-synchronizing a device after a table event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resync {
    Updated(u32),
    Gone,
}

fn map_alias(catalog: &Catalog, map: MapKey) -> Result<String> {
    catalog
        .map(map)
        .map(|m| m.alias.clone())
        .ok_or_else(|| ReconcileError::MapNotFound(format!("{map:?}")))
}

/// Discover `dev` and attach it to its multipath device.
pub fn add_path(ctx: &EngineContext, catalog: &mut Catalog, dev: &str) -> Result<PathKey> {
    let config = ctx.config();
    if config.is_blacklisted(dev) {
        return Err(ReconcileError::Blacklisted(dev.to_string()));
    }

    let key = match catalog.find_path(dev) {
        Some(key) => {
            if catalog.path(key).is_some_and(|path| !path.is_orphan()) {
                debug!("{}: already attached", dev);
                return Ok(key);
            }
            refresh_identity(ctx, catalog, key)?;
            key
        }
        None => {
            let identity = ctx
                .discovery
                .identify(dev)
                .map_err(|e| ReconcileError::discovery(dev, e))?;
            let prober = ctx.discovery.select_prober(&identity);
            debug!("{}: using {} checker", dev, prober.name());
            catalog.insert_path(Path::new(identity, prober, config.polling_interval))
        }
    };

    attach_path(ctx, catalog, key)?;
    Ok(key)
}

/// Re-read the identity of a path from discovery.
pub fn refresh_identity(ctx: &EngineContext, catalog: &mut Catalog, key: PathKey) -> Result<()> {
    let Some(path) = catalog.path(key) else {
        return Err(ReconcileError::PathNotFound(format!("{key:?}")));
    };
    let dev = path.dev().to_string();
    let identity = ctx
        .discovery
        .identify(&dev)
        .map_err(|e| ReconcileError::discovery(&dev, e))?;

    if let Some(path) = catalog.path_mut(key)
        && path.identity != identity
    {
        debug!("{}: identity refreshed, wwid '{}'", dev, identity.wwid);
        path.identity = identity;
    }
    Ok(())
}

/// Re-read the identity of any path. A member whose WWID or size changed
/// leaves its device and is attached again under the new identity.
///
/// Returns true if the path moved.
pub fn reidentify_path(ctx: &EngineContext, catalog: &mut Catalog, key: PathKey) -> Result<bool> {
    let Some(path) = catalog.path(key) else {
        return Err(ReconcileError::PathNotFound(format!("{key:?}")));
    };
    let (old_wwid, old_size) = (path.wwid().to_string(), path.identity.size);
    refresh_identity(ctx, catalog, key)?;

    let Some(path) = catalog.path(key) else {
        return Err(ReconcileError::PathNotFound(format!("{key:?}")));
    };
    let Some(map) = path.map else {
        return Ok(false);
    };
    if path.wwid() == old_wwid && path.identity.size == old_size {
        return Ok(false);
    }

    let dev = path.dev().to_string();
    let alias = map_alias(catalog, map)?;
    info!(
        "{}: {} changed identity to wwid '{}', moving it",
        alias,
        dev,
        path.wwid()
    );
    catalog.detach(key);
    if let Some(path) = catalog.path_mut(key) {
        path.dm_state = DmPathState::Undefined;
    }

    let updated = if catalog.map(map).is_some_and(|m| m.paths.is_empty()) {
        flush_empty_map(ctx, catalog, map)
    } else {
        reload_map(ctx, catalog, map)
    };
    if let Err(e) = updated {
        warn!("{}: cannot update after losing {}: {}", alias, dev, e);
    }

    if catalog
        .path(key)
        .is_some_and(|path| path.identity.is_identified())
    {
        attach_path(ctx, catalog, key)?;
    }
    Ok(true)
}

/// Attach an orphan path to the device with the same WWID, creating the
/// device when none exists yet.
pub fn attach_path(ctx: &EngineContext, catalog: &mut Catalog, key: PathKey) -> Result<MapKey> {
    let config = ctx.config();
    let timeout = ctx.checker_timeout();

    let Some(path) = catalog.path_mut(key) else {
        return Err(ReconcileError::PathNotFound(format!("{key:?}")));
    };
    if let Some(map) = path.map {
        return Ok(map);
    }
    let dev = path.dev().to_string();
    if !path.identity.is_identified() {
        debug!("{}: no wwid, keeping it detached", dev);
        return Err(ReconcileError::NoIdentity(dev));
    }
    if path.state == PathState::Unchecked {
        path.probe_initial(timeout);
    }
    path.refresh_priority();
    let wwid = path.wwid().to_string();
    let size = path.identity.size;

    match catalog.find_map_by_wwid(&wwid) {
        Some(map) => {
            let Some(m) = catalog.map(map) else {
                return Err(ReconcileError::MapNotFound(wwid));
            };
            let alias = m.alias.clone();
            if m.size != size {
                warn!(
                    "{}: size {} does not match {} size {}, dropping path",
                    dev, size, alias, m.size
                );
                let map_size = m.size;
                catalog.remove_path(key);
                return Err(ReconcileError::SizeMismatch {
                    dev,
                    alias,
                    path_size: size,
                    map_size,
                });
            }

            catalog.attach(key, map);
            info!("{}: adding path {}", alias, dev);
            reload_map(ctx, catalog, map)?;
            Ok(map)
        }
        None => {
            if size == 0 {
                warn!("{}: zero size, dropping path", dev);
                catalog.remove_path(key);
                return Err(ReconcileError::ZeroSize(dev));
            }

            let settings = config.map_settings(&wwid);
            if let Some(other) = catalog.find_map_by_alias(&settings.alias) {
                let owner = catalog
                    .map(other)
                    .map(|m| m.wwid.clone())
                    .unwrap_or_default();
                return Err(ReconcileError::AliasInUse {
                    alias: settings.alias,
                    wwid: owner,
                });
            }

            let alias = settings.alias.clone();
            let map = catalog.insert_map(Multipath::new(&wwid, size, settings));
            catalog.attach(key, map);
            regroup(catalog, map);
            if let Some(m) = catalog.map_mut(map) {
                m.action = TableAction::Create;
            }

            info!("{}: creating map for {} with path {}", alias, wwid, dev);
            if let Err(e) = commit_map(ctx, catalog, map) {
                error!("{}: cannot create map: {}", alias, e);
                catalog.remove_map(map);
                return Err(e);
            }
            Ok(map)
        }
    }
}

fn regroup(catalog: &mut Catalog, map: MapKey) {
    groups::rebuild_groups(catalog, map);
    if let Some(m) = catalog.map_mut(map) {
        m.best_group = failover::select_best_group(m);
    }
}

/// Regroup `map` and load the new table into the kernel.
pub fn reload_map(ctx: &EngineContext, catalog: &mut Catalog, map: MapKey) -> Result<()> {
    regroup(catalog, map);
    match catalog.map_mut(map) {
        Some(m) => m.action = TableAction::Reload,
        None => return Err(ReconcileError::MapNotFound(format!("{map:?}"))),
    }
    commit_map(ctx, catalog, map)
}

/// Run the pending table action of `map`, retrying transient failures.
fn commit_map(ctx: &EngineContext, catalog: &mut Catalog, map: MapKey) -> Result<()> {
    let retries = ctx.config().reload_retries;
    let mut attempt = 0;

    let alias = loop {
        let Some(m) = catalog.map(map) else {
            return Err(ReconcileError::MapNotFound(format!("{map:?}")));
        };
        let alias = m.alias.clone();
        let action = m.action;
        let Some(table) = groups::build_table(catalog, map) else {
            return Err(ReconcileError::MapNotFound(alias));
        };

        let result = match action {
            TableAction::Create => ctx.table.create(&alias, &table),
            TableAction::Reload => ctx.table.reload(&alias, &table),
            TableAction::Nothing => return Ok(()),
        };

        match result {
            Ok(()) => {
                if let Some(m) = catalog.map_mut(map) {
                    m.action = TableAction::Nothing;
                    m.stats.map_loads += 1;
                }
                debug!("{}: loaded table with {} paths", alias, table.path_count());
                break alias;
            }
            Err(e) => {
                attempt += 1;
                if !e.kind.is_transient() || attempt > retries {
                    warn!("{}: {:?} failed, giving up: {}", alias, action, e);
                    return Err(ReconcileError::table(&alias, e));
                }
                warn!(
                    "{}: {:?} failed (attempt {}/{}): {}",
                    alias, action, attempt, retries, e
                );
                if action == TableAction::Reload && !refresh_members(ctx, catalog, map) {
                    return Ok(());
                }
            }
        }
    };

    match sync_and_enforce(ctx, catalog, map) {
        Ok(MapPresence::Present(event_nr)) => ctx.watcher.watch(&alias, event_nr),
        Ok(MapPresence::Gone) => warn!("{}: vanished right after loading", alias),
        Err(e) => warn!("{}: cannot read back kernel state: {}", alias, e),
    }
    Ok(())
}

/// Refresh the kernel state of `map`, then fail or reinstate members the
/// kernel disagrees with. Marks change the kernel state, so it is re-read.
fn sync_and_enforce(
    ctx: &EngineContext,
    catalog: &mut Catalog,
    map: MapKey,
) -> Result<MapPresence> {
    let presence = sync_map_state(ctx, catalog, map)?;
    if presence == MapPresence::Gone || enforce_path_states(ctx, catalog, map) == 0 {
        return Ok(presence);
    }
    sync_map_state(ctx, catalog, map)
}

/// Fail members the checker found down but the kernel still uses, and
/// reinstate usable members the kernel has failed. Returns the number of
/// marks issued.
pub fn enforce_path_states(ctx: &EngineContext, catalog: &mut Catalog, map: MapKey) -> usize {
    let Some(alias) = catalog.map(map).map(|m| m.alias.clone()) else {
        return 0;
    };

    let mut marked = 0;
    for key in catalog.members(map) {
        let Some(path) = catalog.path_mut(key) else {
            continue;
        };
        let (action, target) = if path.state.is_failed() && path.dm_state != DmPathState::Failed {
            (PathAction::Fail, DmPathState::Failed)
        } else if path.state.is_usable() && path.dm_state != DmPathState::Active {
            (PathAction::Reinstate, DmPathState::Active)
        } else {
            continue;
        };

        debug!(
            "{}: kernel has {} {:?}, daemon has it {}",
            alias,
            path.dev(),
            path.dm_state,
            path.state
        );
        match ctx.table.mark_path(&alias, path.devt(), action) {
            Ok(()) => {
                path.dm_state = target;
                marked += 1;
            }
            Err(e) => warn!(
                "{}: {} {} failed: {}",
                alias,
                action.message(),
                path.dev(),
                e
            ),
        }
    }
    marked
}

/// Drop members that disappeared and regroup. Returns false once `map` is gone.
fn refresh_members(ctx: &EngineContext, catalog: &mut Catalog, map: MapKey) -> bool {
    for key in catalog.members(map) {
        let gone = catalog
            .path_mut(key)
            .is_some_and(|path| path.prober.offline_test(&path.identity));
        if gone {
            if let Some(path) = catalog.remove_path(key) {
                info!("{}: removed while reloading", path.dev());
            }
        }
    }

    if catalog.map(map).is_some_and(|m| m.paths.is_empty()) {
        if let Err(e) = flush_empty_map(ctx, catalog, map) {
            warn!("cannot flush emptied map: {}", e);
        }
        return catalog.map(map).is_some_and(|m| !m.paths.is_empty());
    }
    regroup(catalog, map);
    catalog.map(map).is_some()
}

/// Refresh the kernel-reported state of `map` into the catalog.
pub fn sync_map_state(
    ctx: &EngineContext,
    catalog: &mut Catalog,
    map: MapKey,
) -> Result<MapPresence> {
    let alias = map_alias(catalog, map)?;
    let info = ctx
        .table
        .get_info(&alias)
        .map_err(|e| ReconcileError::table(&alias, e))?;
    if !info.exists {
        return Ok(MapPresence::Gone);
    }
    let status = ctx
        .table
        .status(&alias)
        .map_err(|e| ReconcileError::table(&alias, e))?;

    for key in catalog.members(map) {
        if let Some(path) = catalog.path_mut(key) {
            path.dm_state = status
                .path_state(path.devt())
                .unwrap_or(DmPathState::Undefined);
        }
    }
    if let Some(m) = catalog.map_mut(map) {
        m.devt = Some(info.devt);
        if let Some(active) = status.active_group() {
            m.active_group = active;
        }
    }
    Ok(MapPresence::Present(info.event_nr))
}

/// Forget `dev` and update its device.
pub fn remove_path(ctx: &EngineContext, catalog: &mut Catalog, dev: &str) -> Result<()> {
    let key = catalog
        .find_path(dev)
        .ok_or_else(|| ReconcileError::PathNotFound(dev.to_string()))?;
    remove_path_key(ctx, catalog, key)
}

/// Detach and destroy a path; flush its device when it was the last member,
/// reload it otherwise.
pub fn remove_path_key(ctx: &EngineContext, catalog: &mut Catalog, key: PathKey) -> Result<()> {
    let map = catalog.detach(key);
    let Some(path) = catalog.remove_path(key) else {
        return Err(ReconcileError::PathNotFound(format!("{key:?}")));
    };
    let Some(map) = map else {
        debug!("{}: removed orphan path", path.dev());
        return Ok(());
    };

    let alias = map_alias(catalog, map)?;
    info!("{}: removed path {}", alias, path.dev());
    if catalog.map(map).is_some_and(|m| m.paths.is_empty()) {
        return flush_empty_map(ctx, catalog, map);
    }
    reload_map(ctx, catalog, map)
}

/// Flush a device without members. A busy device is kept and retried later.
pub(crate) fn flush_empty_map(ctx: &EngineContext, catalog: &mut Catalog, map: MapKey) -> Result<()> {
    match flush_map(ctx, catalog, map) {
        Ok(()) => Ok(()),
        Err(ReconcileError::Busy(alias)) => {
            if let Some(m) = catalog.map_mut(map) {
                if !m.flush_pending {
                    info!("{}: in use, flush deferred", alias);
                }
                m.flush_pending = true;
            }
            Ok(())
        }
        Err(e) => {
            if let Some(m) = catalog.map_mut(map) {
                m.flush_pending = true;
            }
            Err(e)
        }
    }
}

/// Remove `map` from the kernel. On success its paths become orphans.
///
/// A busy device yields [`ReconcileError::Busy`] and nothing changes.
pub fn flush_map(ctx: &EngineContext, catalog: &mut Catalog, map: MapKey) -> Result<()> {
    let alias = map_alias(catalog, map)?;
    match ctx.table.remove(&alias, false) {
        Ok(()) => {}
        Err(e) if e.is_not_found() => debug!("{}: already gone from the kernel", alias),
        Err(e) if e.is_busy() => return Err(ReconcileError::Busy(alias)),
        Err(e) => return Err(ReconcileError::table(&alias, e)),
    }

    ctx.watcher.unwatch(&alias);
    catalog.remove_map(map);
    info!("{}: map flushed", alias);
    Ok(())
}

/// Flush the device called `name`.
pub fn flush(ctx: &EngineContext, catalog: &mut Catalog, name: &str) -> Result<()> {
    let map = catalog
        .find_map_by_alias(name)
        .ok_or_else(|| ReconcileError::MapNotFound(name.to_string()))?;
    flush_map(ctx, catalog, map)
}

/// Adopt a multipath device that appeared in the kernel.
pub fn add_map(ctx: &EngineContext, catalog: &mut Catalog, name: &str) -> Result<MapKey> {
    let info = ctx
        .table
        .get_info(name)
        .map_err(|e| ReconcileError::table(name, e))?;
    if !info.exists {
        return Err(ReconcileError::MapNotFound(name.to_string()));
    }
    if !info.is_multipath() {
        return Err(ReconcileError::NotMultipath(name.to_string()));
    }
    if let Some(map) = catalog.find_map_by_alias(name) {
        debug!("{}: already known", name);
        return Ok(map);
    }

    let wwid = info.wwid().unwrap_or_default().to_string();
    if let Some(other) = catalog.find_map_by_wwid(&wwid) {
        let alias = map_alias(catalog, other)?;
        warn!("{}: {} is already mapped as {}", name, wwid, alias);
        return Err(ReconcileError::AliasInUse { alias, wwid });
    }

    let table = ctx
        .table
        .table(name)
        .map_err(|e| ReconcileError::table(name, e))?;
    let config = ctx.config();
    let mut settings = config.map_settings(&wwid);
    settings.alias = name.to_string();

    let map = catalog.insert_map(Multipath::new(&wwid, table.size, settings));
    if let Some(m) = catalog.map_mut(map) {
        m.queueing = table.queue_if_no_path;
        m.devt = Some(info.devt);
    }

    for devt in table.devices() {
        let key = match catalog.find_path_by_devt(devt) {
            Some(key) => key,
            None => match adopt_path(ctx, catalog, devt) {
                Ok(key) => key,
                Err(e) => {
                    warn!("{}: cannot adopt path {}: {}", name, devt, e);
                    continue;
                }
            },
        };
        let Some(path) = catalog.path(key) else {
            continue;
        };
        if path.map.is_some_and(|owner| owner != map) {
            warn!("{}: {} already belongs to another map", name, path.dev());
            continue;
        }
        if path.wwid() != wwid {
            warn!("{}: {} has wwid '{}', skipping", name, path.dev(), path.wwid());
            continue;
        }
        catalog.attach(key, map);
    }

    if catalog.map(map).is_some_and(|m| m.paths.is_empty()) {
        warn!("{}: no usable path members, flushing", name);
        flush_empty_map(ctx, catalog, map)?;
        if catalog.map(map).is_none() {
            return Err(ReconcileError::MapNotFound(name.to_string()));
        }
        return Ok(map);
    }

    regroup(catalog, map);
    match sync_map_state(ctx, catalog, map)? {
        MapPresence::Present(event_nr) => ctx.watcher.watch(name, event_nr),
        MapPresence::Gone => {
            catalog.remove_map_with_paths(map);
            return Err(ReconcileError::MapNotFound(name.to_string()));
        }
    }

    info!(
        "{}: adopted map with {} paths",
        name,
        catalog.members(map).len()
    );
    Ok(map)
}

fn adopt_path(ctx: &EngineContext, catalog: &mut Catalog, devt: DevT) -> Result<PathKey> {
    let config = ctx.config();
    let dev = ctx
        .discovery
        .resolve_devt(devt)
        .map_err(|e| ReconcileError::discovery(&devt.to_string(), e))?;
    let identity = ctx
        .discovery
        .identify(&dev)
        .map_err(|e| ReconcileError::discovery(&dev, e))?;
    let prober = ctx.discovery.select_prober(&identity);

    let mut path = Path::new(identity, prober, config.polling_interval);
    path.probe_initial(ctx.checker_timeout());
    path.refresh_priority();
    Ok(catalog.insert_path(path))
}

/// Forget a device that was removed from the kernel, with its paths.
pub fn remove_map(ctx: &EngineContext, catalog: &mut Catalog, name: &str) -> Result<()> {
    let map = catalog
        .find_map_by_alias(name)
        .ok_or_else(|| ReconcileError::MapNotFound(name.to_string()))?;
    remove_map_key(ctx, catalog, map);
    Ok(())
}

pub(crate) fn remove_map_key(ctx: &EngineContext, catalog: &mut Catalog, map: MapKey) {
    let Some(m) = catalog.map(map) else {
        return;
    };
    let alias = m.alias.clone();
    ctx.watcher.unwatch(&alias);
    catalog.remove_map_with_paths(map);
    info!("{}: removed", alias);
}

/// Re-read the kernel state of `name` after a table event.
///
/// A table whose membership no longer matches the catalog is reloaded.
pub fn resync_map(ctx: &EngineContext, catalog: &mut Catalog, name: &str) -> Result<Resync> {
    let Some(map) = catalog.find_map_by_alias(name) else {
        return Ok(Resync::Gone);
    };

    let event_nr = match sync_map_state(ctx, catalog, map)? {
        MapPresence::Gone => {
            remove_map_key(ctx, catalog, map);
            return Ok(Resync::Gone);
        }
        MapPresence::Present(event_nr) => event_nr,
    };

    let live = ctx
        .table
        .table(name)
        .map_err(|e| ReconcileError::table(name, e))?;
    let live: BTreeSet<DevT> = live.devices().collect();
    let ours: BTreeSet<DevT> = catalog
        .members(map)
        .into_iter()
        .filter_map(|key| catalog.path(key).map(Path::devt))
        .collect();
    if live == ours {
        if enforce_path_states(ctx, catalog, map) == 0 {
            return Ok(Resync::Updated(event_nr));
        }
        return match sync_map_state(ctx, catalog, map)? {
            MapPresence::Present(event_nr) => Ok(Resync::Updated(event_nr)),
            MapPresence::Gone => {
                remove_map_key(ctx, catalog, map);
                Ok(Resync::Gone)
            }
        };
    }

    warn!("{}: table changed outside the daemon, reloading", name);
    reload_map(ctx, catalog, map)?;
    let event_nr = ctx
        .table
        .get_event_counter(name)
        .map_err(|e| ReconcileError::table(name, e))?;
    Ok(Resync::Updated(event_nr))
}

fn set_queueing(ctx: &EngineContext, map: &mut Multipath, queue: bool) {
    match ctx.table.set_queueing(&map.alias, queue) {
        Ok(()) => map.queueing = queue,
        Err(e) => warn!("{}: cannot change queueing: {}", map.alias, e),
    }
}

/// Enter or leave no-path recovery mode depending on the usable path count.
pub fn update_queue_mode(ctx: &EngineContext, catalog: &mut Catalog, map: MapKey) {
    let usable = catalog.usable_paths(map);
    let interval = ctx.config().polling_interval;
    let Some(m) = catalog.map_mut(map) else {
        return;
    };

    if usable == 0 && !m.in_recovery {
        m.in_recovery = true;
        match m.settings.no_path_retry {
            NoPathRetry::Fail => {
                info!("{}: no usable paths, failing I/O", m.alias);
                if m.queueing {
                    set_queueing(ctx, m, false);
                }
            }
            NoPathRetry::Queue => info!("{}: no usable paths, queueing I/O", m.alias),
            NoPathRetry::Retries(retries) => {
                m.retry_tick = retries.saturating_mul(interval);
                info!(
                    "{}: no usable paths, queueing for {} checks",
                    m.alias, retries
                );
            }
        }
    } else if usable > 0 && m.in_recovery {
        m.in_recovery = false;
        m.retry_tick = 0;
        if m.settings.no_path_retry.queues() && !m.queueing {
            set_queueing(ctx, m, true);
        }
        info!("{}: path restored, leaving recovery mode", m.alias);
    }
}

/// Advance the no-path retry countdown of `map` by one checker pass.
pub fn retry_tick(ctx: &EngineContext, catalog: &mut Catalog, map: MapKey) {
    let Some(m) = catalog.map_mut(map) else {
        return;
    };
    if !m.in_recovery || m.retry_tick == 0 {
        return;
    }
    m.retry_tick -= 1;
    if m.retry_tick == 0 && m.queueing {
        warn!("{}: retries exhausted, disabling queueing", m.alias);
        set_queueing(ctx, m, false);
        m.stats.queueing_timeouts += 1;
    }
}

/// Retry busy flushes and reloads that ran out of attempts.
pub fn retry_pending(ctx: &EngineContext, catalog: &mut Catalog) {
    for map in catalog.map_keys() {
        let Some(m) = catalog.map_mut(map) else {
            continue;
        };
        if m.flush_pending {
            if !m.paths.is_empty() {
                m.flush_pending = false;
            } else if let Err(e) = flush_empty_map(ctx, catalog, map) {
                debug!("flush still pending: {}", e);
            }
            continue;
        }
        if m.action == TableAction::Reload
            && let Err(e) = commit_map(ctx, catalog, map)
        {
            debug!("reload still pending: {}", e);
        }
    }
}

/// Adopt existing multipath devices, then discover and attach paths.
pub fn initial_scan(ctx: &EngineContext, catalog: &mut Catalog) -> Result<()> {
    let config = ctx.config();

    match ctx.table.list_names() {
        Ok(names) => {
            for entry in names {
                match add_map(ctx, catalog, &entry.name) {
                    Ok(_) => {}
                    Err(ReconcileError::NotMultipath(name)) => {
                        debug!("{}: not a multipath map, ignoring", name)
                    }
                    Err(e) => warn!("{}: cannot adopt map: {}", entry.name, e),
                }
            }
        }
        Err(e) => warn!("cannot list existing maps: {}", e),
    }

    let devices = ctx
        .discovery
        .scan()
        .map_err(|e| ReconcileError::discovery("block devices", e))?;
    for dev in devices {
        if config.is_blacklisted(&dev) || catalog.find_path(&dev).is_some() {
            continue;
        }
        match add_path(ctx, catalog, &dev) {
            Ok(_) | Err(ReconcileError::NoIdentity(_)) => {}
            Err(e) => warn!("{}: {}", dev, e),
        }
    }

    info!(
        "topology: {} maps, {} paths",
        catalog.map_count(),
        catalog.path_count()
    );
    Ok(())
}

/// Re-read the configuration and rebuild the catalog from scratch.
pub fn reconfigure(ctx: &EngineContext, catalog: &mut Catalog) -> Result<()> {
    ctx.reload_config()?;
    ctx.watcher.unwatch_all();
    catalog.reset();
    initial_scan(ctx, catalog)
}
