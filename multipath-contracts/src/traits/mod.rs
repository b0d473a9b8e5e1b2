// SPDX-License-Identifier: GPL-3.0-only

pub mod probe;
pub mod table;

pub use probe::{DeviceDiscovery, PathProber};
pub use table::TableEngine;
