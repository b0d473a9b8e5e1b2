// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use multipath_contracts::{DeviceDiscovery, TableEngine};
use multipath_sys::{DmsetupEngine, SysfsDiscovery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Concern {
    Table,
    Discovery,
}

const REQUIRED_CONCERNS: [Concern; 2] = [Concern::Table, Concern::Discovery];

pub struct AdapterRegistry {
    routes: HashMap<Concern, &'static str>,
    table: Arc<dyn TableEngine>,
    discovery: Arc<dyn DeviceDiscovery>,
}

impl AdapterRegistry {
    pub fn build_default() -> Result<Self> {
        let table = DmsetupEngine::new().context("device-mapper tooling is not available")?;
        Self::from_parts(
            [(Concern::Table, "dmsetup"), (Concern::Discovery, "sysfs")],
            Arc::new(table),
            Arc::new(SysfsDiscovery::default()),
        )
    }

    /// Assemble a registry from explicit adapters, checking that every
    /// concern has a route.
    pub fn from_parts(
        routes: impl IntoIterator<Item = (Concern, &'static str)>,
        table: Arc<dyn TableEngine>,
        discovery: Arc<dyn DeviceDiscovery>,
    ) -> Result<Self> {
        let routes: HashMap<_, _> = routes.into_iter().collect();
        for concern in REQUIRED_CONCERNS {
            if !routes.contains_key(&concern) {
                return Err(anyhow!(
                    "Missing required adapter routing for concern: {:?}",
                    concern
                ));
            }
        }

        Ok(Self {
            routes,
            table,
            discovery,
        })
    }

    pub fn table(&self) -> Arc<dyn TableEngine> {
        self.table.clone()
    }

    pub fn discovery(&self) -> Arc<dyn DeviceDiscovery> {
        self.discovery.clone()
    }

    pub fn route_for(&self, concern: Concern) -> Option<&'static str> {
        self.routes.get(&concern).copied()
    }
}

#[cfg(test)]
mod tests {
    use multipath_testing::{FakeTableEngine, ScriptedDiscovery};

    use super::*;

    fn parts() -> (Arc<dyn TableEngine>, Arc<dyn DeviceDiscovery>) {
        (
            Arc::new(FakeTableEngine::new()),
            Arc::new(ScriptedDiscovery::default()),
        )
    }

    #[test]
    fn every_concern_needs_a_route() {
        let (table, discovery) = parts();
        let err = AdapterRegistry::from_parts([(Concern::Table, "fake")], table, discovery)
            .err()
            .expect("missing discovery route");
        assert!(err.to_string().contains("Discovery"));
    }

    #[test]
    fn routes_are_reported() {
        let (table, discovery) = parts();
        let registry = AdapterRegistry::from_parts(
            [(Concern::Table, "fake"), (Concern::Discovery, "scripted")],
            table,
            discovery,
        )
        .expect("registry");
        assert_eq!(registry.route_for(Concern::Table), Some("fake"));
        assert_eq!(registry.route_for(Concern::Discovery), Some("scripted"));
    }
}
