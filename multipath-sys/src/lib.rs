// SPDX-License-Identifier: GPL-3.0-only

//! Low-level system adapters for the multipath daemon
//!
//! This crate talks to the running kernel on behalf of the engine:
//! - Device-mapper tables through the `dmsetup` utility
//! - Path identity and health through sysfs
//! - Hotplug notifications through the kernel uevent netlink socket
//!
//! These operations require elevated privileges and should only be called
//! from the daemon.

pub mod dm;
pub mod error;
pub mod sysfs;
pub mod uevent;

pub use dm::DmsetupEngine;
pub use error::{Result, SysError};
pub use sysfs::{SysfsDiscovery, SysfsStateProber};
pub use uevent::{Uevent, UeventAction, UeventSocket};
