// SPDX-License-Identifier: GPL-3.0-only

//! Canonical domain models for the multipath daemon
//!
//! These models are shared by every layer of the stack:
//!
//! - **multipath-contracts**: capability traits are expressed in these types
//! - **multipath-sys**: adapters translate kernel/sysfs data into them
//! - **multipath-service**: the engine stores and serializes them
//!
//! Nothing in here performs I/O.

pub mod path;
pub mod policy;
pub mod table;

pub use path::{DevT, DmPathState, PathAction, PathIdentity, PathState};
pub use policy::{FailbackPolicy, GroupingPolicy, KeywordOrTicks, LogCheckerErr, NoPathRetry};
pub use table::{
    GroupState, GroupStatus, MPATH_UUID_PREFIX, MULTIPATH_TARGET, MapInfo, MapName, MapStatus,
    MapTable, PathStatus, TableGroup, WaitOutcome,
};
