// SPDX-License-Identifier: GPL-3.0-only

//! Kernel uevent ingestion: a listener queues events, a dispatcher applies them.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use multipath_sys::{Uevent, UeventAction, UeventSocket};
use multipath_types::MPATH_UUID_PREFIX;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, SharedCatalog};
use crate::context::{EngineContext, sleep_cancellable};
use crate::error::{ReconcileError, Result};
use crate::reconcile;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(1);
const DISPATCH_WAIT: Duration = Duration::from_millis(200);

/// Listener worker: reads the netlink socket and forwards block uevents.
pub fn run_listener(events: Sender<Uevent>, token: CancellationToken) {
    let mut socket = match UeventSocket::open(SOCKET_TIMEOUT) {
        Ok(socket) => socket,
        Err(e) => {
            error!("cannot listen for uevents: {}", e);
            return;
        }
    };
    info!("uevent listener started");

    while !token.is_cancelled() {
        match socket.recv() {
            Ok(Some(event)) if event.subsystem == "block" => {
                if events.send(event).is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("uevent receive failed: {}", e);
                if !sleep_cancellable(&token, SOCKET_TIMEOUT) {
                    break;
                }
            }
        }
    }
    info!("uevent listener stopped");
}

/// Dispatcher worker: applies queued uevents under the catalog lock.
pub fn run_dispatcher(
    ctx: Arc<EngineContext>,
    catalog: SharedCatalog,
    events: Receiver<Uevent>,
    token: CancellationToken,
) {
    info!("uevent dispatcher started");
    while !token.is_cancelled() {
        let event = match events.recv_timeout(DISPATCH_WAIT) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let Some(mut guard) = catalog.lock_unless_cancelled(&token) else {
            break;
        };
        if let Err(e) = dispatch(&ctx, &mut guard, &event) {
            match e {
                ReconcileError::NoIdentity(_) | ReconcileError::Blacklisted(_) => {
                    debug!("uevent {:?}: {}", event.action, e)
                }
                _ => warn!("uevent {:?} {}: {}", event.action, event.devpath, e),
            }
        }
    }
    info!("uevent dispatcher stopped");
}

/// Route one uevent to the matching engine operation.
pub fn dispatch(ctx: &EngineContext, catalog: &mut Catalog, event: &Uevent) -> Result<()> {
    if event.subsystem != "block" {
        return Ok(());
    }
    if event.is_dm() {
        return dispatch_dm(ctx, catalog, event);
    }
    if !event.is_block_disk() {
        return Ok(());
    }
    let Some(dev) = event.kernel_name() else {
        return Ok(());
    };
    if ctx.config().is_blacklisted(dev) {
        debug!("{}: blacklisted, ignoring {:?}", dev, event.action);
        return Ok(());
    }

    match &event.action {
        UeventAction::Add => reconcile::add_path(ctx, catalog, dev).map(|_| ()),
        UeventAction::Remove => match reconcile::remove_path(ctx, catalog, dev) {
            Err(ReconcileError::PathNotFound(_)) => Ok(()),
            other => other,
        },
        UeventAction::Change => {
            let orphan = catalog
                .find_path(dev)
                .and_then(|key| catalog.path(key))
                .is_none_or(|path| path.is_orphan());
            if orphan {
                reconcile::add_path(ctx, catalog, dev).map(|_| ())
            } else {
                Ok(())
            }
        }
        UeventAction::Other(_) => Ok(()),
    }
}

fn dispatch_dm(ctx: &EngineContext, catalog: &mut Catalog, event: &Uevent) -> Result<()> {
    let known = event
        .dm_name
        .as_deref()
        .and_then(|name| catalog.find_map_by_alias(name))
        .or_else(|| event.devt.and_then(|devt| catalog.find_map_by_devt(devt)));

    match &event.action {
        UeventAction::Remove => {
            let Some(map) = known else {
                return Ok(());
            };
            let alias = catalog
                .map(map)
                .map(|m| m.alias.clone())
                .unwrap_or_default();
            reconcile::remove_map(ctx, catalog, &alias)
        }
        UeventAction::Add | UeventAction::Change => {
            if known.is_some() {
                return Ok(());
            }
            let owned = event
                .dm_uuid
                .as_deref()
                .is_some_and(|uuid| uuid.starts_with(MPATH_UUID_PREFIX));
            match (&event.dm_name, owned) {
                (Some(name), true) => reconcile::add_map(ctx, catalog, name).map(|_| ()),
                _ => Ok(()),
            }
        }
        UeventAction::Other(_) => Ok(()),
    }
}
