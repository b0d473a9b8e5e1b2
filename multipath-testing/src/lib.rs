// SPDX-License-Identifier: GPL-3.0-only

//! Test doubles for the multipath engine's adapter contracts.

pub mod discovery;
pub mod table;

pub use discovery::{ScriptedDiscovery, ScriptedProber};
pub use table::{FAKE_DM_MAJOR, FakeTableEngine, TableCall, TableOp};
