// SPDX-License-Identifier: GPL-3.0-only

//! Multipath daemon engine
//!
//! Tracks block device paths and the device-mapper multipath maps built on
//! top of them, checks path health, switches path groups on failure and
//! failback, and keeps the in-memory topology consistent with the kernel.
//!
//! The engine functions take `&mut Catalog`; workers lock the shared catalog
//! once per unit of work and pass the guard down.

pub mod catalog;
pub mod checker;
pub mod config;
pub mod context;
pub mod daemon;
pub mod dmevents;
pub mod error;
pub mod failover;
pub mod groups;
pub mod logging;
pub mod reconcile;
pub mod routing;
pub mod uevents;

pub use catalog::{Catalog, MapKey, PathKey, SharedCatalog, TopologySnapshot};
pub use config::{DaemonConfig, DmEventStrategy};
pub use context::EngineContext;
pub use daemon::{Daemon, DaemonHandle};
pub use dmevents::{DmEvent, DmEventWatcher, WatchMode};
pub use error::{ConfigError, ReconcileError, Result};
