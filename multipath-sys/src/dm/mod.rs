// SPDX-License-Identifier: GPL-3.0-only

pub mod dmsetup;
pub mod table;

pub use dmsetup::DmsetupEngine;
pub use table::{parse_status, parse_table, render_table};
