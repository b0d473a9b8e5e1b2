// SPDX-License-Identifier: GPL-3.0-only

//! Capability contracts between the multipath engine and its adapters.

pub mod error;
pub mod traits;

pub use error::{EngineError, ErrorKind};
pub use traits::{DeviceDiscovery, PathProber, TableEngine};
