// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use multipath_contracts::{DeviceDiscovery, TableEngine};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::dmevents::DmEventWatcher;
use crate::error::ConfigError;

/// Adapters and settings shared by every engine operation.
pub struct EngineContext {
    pub table: Arc<dyn TableEngine>,
    pub discovery: Arc<dyn DeviceDiscovery>,
    pub watcher: DmEventWatcher,
    config: RwLock<Arc<DaemonConfig>>,
    config_path: Option<PathBuf>,
}

impl EngineContext {
    pub fn new(
        table: Arc<dyn TableEngine>,
        discovery: Arc<dyn DeviceDiscovery>,
        watcher: DmEventWatcher,
        config: DaemonConfig,
        config_path: Option<PathBuf>,
    ) -> Self {
        Self {
            table,
            discovery,
            watcher,
            config: RwLock::new(Arc::new(config)),
            config_path,
        }
    }

    pub fn config(&self) -> Arc<DaemonConfig> {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: DaemonConfig) {
        *self.config.write() = Arc::new(config);
    }

    /// Re-read the configuration file, keeping the current settings on error.
    pub fn reload_config(&self) -> Result<Arc<DaemonConfig>, ConfigError> {
        let Some(path) = &self.config_path else {
            return Ok(self.config());
        };
        let config = DaemonConfig::load(path)?;
        tracing::info!("reloaded configuration from {}", path.display());
        self.set_config(config);
        Ok(self.config())
    }

    pub fn checker_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.config().checker_timeout))
    }
}

/// Sleep for `duration` in short slices. Returns false if cancelled.
pub fn sleep_cancellable(token: &CancellationToken, duration: Duration) -> bool {
    const SLICE: Duration = Duration::from_millis(50);

    let deadline = Instant::now() + duration;
    loop {
        if token.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_stops_on_cancel() {
        let token = CancellationToken::new();
        assert!(sleep_cancellable(&token, Duration::from_millis(10)));

        token.cancel();
        let started = Instant::now();
        assert!(!sleep_cancellable(&token, Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
