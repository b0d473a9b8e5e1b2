// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use multipath_types::{FailbackPolicy, GroupingPolicy, LogCheckerErr, NoPathRetry};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/multipathd.toml";
pub const DEFAULT_SELECTOR: &str = "service-time";

const DEFAULT_BLACKLIST: [&str; 7] = ["loop", "ram", "sr", "zram", "nbd", "dm-", "md"];

/// How table change events are collected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmEventStrategy {
    /// Centralized when the table engine supports a multiplexed wait.
    #[default]
    Auto,
    Centralized,
    PerDevice,
}

impl FromStr for DmEventStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "auto" => Ok(DmEventStrategy::Auto),
            "centralized" => Ok(DmEventStrategy::Centralized),
            "per_device" => Ok(DmEventStrategy::PerDevice),
            _ => Err(format!("Invalid dm event strategy: {}", s)),
        }
    }
}

/// Per-WWID overrides from `[[multipath]]` sections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MultipathOverride {
    pub wwid: String,
    pub alias: Option<String>,
    pub failback: Option<FailbackPolicy>,
    pub no_path_retry: Option<NoPathRetry>,
    pub path_grouping_policy: Option<GroupingPolicy>,
}

/// Effective settings for one multipath device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MapSettings {
    pub alias: String,
    pub failback: FailbackPolicy,
    pub no_path_retry: NoPathRetry,
    pub grouping: GroupingPolicy,
    pub selector: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Base path check interval in seconds.
    pub polling_interval: u32,
    /// Ceiling for the adaptive check interval; four times the base when unset.
    pub max_polling_interval: Option<u32>,
    /// Probe timeout in seconds.
    pub checker_timeout: u32,
    pub failback: FailbackPolicy,
    pub no_path_retry: NoPathRetry,
    pub path_grouping_policy: GroupingPolicy,
    pub path_selector: String,
    pub log_checker_err: LogCheckerErr,
    pub reload_retries: u32,
    pub dm_event_strategy: DmEventStrategy,
    pub uevent_listen: bool,
    pub blacklist_devnode: Vec<String>,
    pub log_level: Option<String>,
    pub log_dir: Option<PathBuf>,
    #[serde(rename = "multipath")]
    pub multipaths: Vec<MultipathOverride>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            polling_interval: 5,
            max_polling_interval: None,
            checker_timeout: 30,
            failback: FailbackPolicy::default(),
            no_path_retry: NoPathRetry::default(),
            path_grouping_policy: GroupingPolicy::default(),
            path_selector: DEFAULT_SELECTOR.to_string(),
            log_checker_err: LogCheckerErr::default(),
            reload_retries: 3,
            dm_event_strategy: DmEventStrategy::default(),
            uevent_listen: true,
            blacklist_devnode: DEFAULT_BLACKLIST.iter().map(ToString::to_string).collect(),
            log_level: None,
            log_dir: None,
            multipaths: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Read and validate `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.polling_interval == 0 {
            return Err(ConfigError::Invalid(
                "polling_interval must be at least 1".to_string(),
            ));
        }
        if self.max_check_interval() < self.polling_interval {
            return Err(ConfigError::Invalid(format!(
                "max_polling_interval {} is below polling_interval {}",
                self.max_check_interval(),
                self.polling_interval
            )));
        }
        if self.path_selector.trim().is_empty() {
            return Err(ConfigError::Invalid("path_selector is empty".to_string()));
        }

        let mut wwids = HashSet::new();
        let mut aliases = HashSet::new();
        for entry in &self.multipaths {
            if entry.wwid.is_empty() {
                return Err(ConfigError::Invalid(
                    "[[multipath]] entry without wwid".to_string(),
                ));
            }
            if !wwids.insert(entry.wwid.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate [[multipath]] entry for {}",
                    entry.wwid
                )));
            }
            if let Some(alias) = &entry.alias
                && !aliases.insert(alias.as_str())
            {
                return Err(ConfigError::Invalid(format!("duplicate alias {alias}")));
            }
        }
        Ok(())
    }

    pub fn max_check_interval(&self) -> u32 {
        self.max_polling_interval
            .unwrap_or_else(|| self.polling_interval.saturating_mul(4))
    }

    pub fn is_blacklisted(&self, dev: &str) -> bool {
        self.blacklist_devnode
            .iter()
            .any(|prefix| !prefix.is_empty() && dev.starts_with(prefix.as_str()))
    }

    /// Settings for the device identified by `wwid`, with overrides applied.
    pub fn map_settings(&self, wwid: &str) -> MapSettings {
        let entry = self.multipaths.iter().find(|entry| entry.wwid == wwid);
        MapSettings {
            alias: entry
                .and_then(|entry| entry.alias.clone())
                .unwrap_or_else(|| wwid.to_string()),
            failback: entry
                .and_then(|entry| entry.failback)
                .unwrap_or(self.failback),
            no_path_retry: entry
                .and_then(|entry| entry.no_path_retry)
                .unwrap_or(self.no_path_retry),
            grouping: entry
                .and_then(|entry| entry.path_grouping_policy)
                .unwrap_or(self.path_grouping_policy),
            selector: self.path_selector.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = DaemonConfig::from_toml_str("").expect("parse empty config");
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.max_check_interval(), 20);
        assert!(config.is_blacklisted("loop0"));
        assert!(config.is_blacklisted("dm-3"));
        assert!(!config.is_blacklisted("sdb"));
    }

    #[test]
    fn parses_overrides() {
        let config = DaemonConfig::from_toml_str(
            r#"
            polling_interval = 2
            max_polling_interval = 16
            failback = 3
            no_path_retry = "queue"
            path_grouping_policy = "group_by_prio"
            log_checker_err = "once"
            dm_event_strategy = "per_device"

            [[multipath]]
            wwid = "3600a0980383030"
            alias = "data"
            failback = "immediate"
            no_path_retry = 12
            "#,
        )
        .expect("parse config");

        assert_eq!(config.max_check_interval(), 16);
        assert_eq!(config.log_checker_err, LogCheckerErr::Once);
        assert_eq!(config.dm_event_strategy, DmEventStrategy::PerDevice);

        let settings = config.map_settings("3600a0980383030");
        assert_eq!(settings.alias, "data");
        assert_eq!(settings.failback, FailbackPolicy::Immediate);
        assert_eq!(settings.no_path_retry, NoPathRetry::Retries(12));
        assert_eq!(settings.grouping, GroupingPolicy::GroupByPrio);

        let fallback = config.map_settings("36001405ffff");
        assert_eq!(fallback.alias, "36001405ffff");
        assert_eq!(fallback.failback, FailbackPolicy::Deferred(3));
        assert_eq!(fallback.no_path_retry, NoPathRetry::Queue);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(DaemonConfig::from_toml_str("polling_interval = 0").is_err());
        assert!(
            DaemonConfig::from_toml_str("polling_interval = 10\nmax_polling_interval = 5").is_err()
        );
        assert!(DaemonConfig::from_toml_str("unknown_key = true").is_err());
        assert!(DaemonConfig::from_toml_str("failback = \"sometimes\"").is_err());

        let duplicate_alias = r#"
            [[multipath]]
            wwid = "3600a"
            alias = "data"

            [[multipath]]
            wwid = "3600b"
            alias = "data"
        "#;
        assert!(DaemonConfig::from_toml_str(duplicate_alias).is_err());
    }

    #[test]
    fn strategy_from_cli_value() {
        assert_eq!(
            "per-device".parse::<DmEventStrategy>(),
            Ok(DmEventStrategy::PerDevice)
        );
        assert_eq!(
            "Centralized".parse::<DmEventStrategy>(),
            Ok(DmEventStrategy::Centralized)
        );
        assert!("both".parse::<DmEventStrategy>().is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join(format!(
            "multipathd-missing-{}.toml",
            std::process::id()
        ));
        let config = DaemonConfig::load(&path).expect("missing file is not an error");
        assert_eq!(config.polling_interval, 5);
    }
}
