// SPDX-License-Identifier: GPL-3.0-only

//! Policy knobs shared by the daemon configuration and the engine.

use serde::{Deserialize, Serialize};

/// Raw configuration value: either a keyword or a tick count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeywordOrTicks {
    Ticks(u32),
    Keyword(String),
}

/// When the active path group may change after priorities improve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "KeywordOrTicks", into = "KeywordOrTicks")]
pub enum FailbackPolicy {
    /// Never switch automatically.
    #[default]
    Manual,
    /// Switch as soon as a better group is computed.
    Immediate,
    /// Wait this many checker ticks before switching.
    Deferred(u32),
    /// Switch only when the first recovering path of the best group triggers it.
    Followover,
}

impl TryFrom<KeywordOrTicks> for FailbackPolicy {
    type Error = String;

    fn try_from(value: KeywordOrTicks) -> Result<Self, Self::Error> {
        match value {
            KeywordOrTicks::Ticks(0) => Ok(FailbackPolicy::Immediate),
            KeywordOrTicks::Ticks(ticks) => Ok(FailbackPolicy::Deferred(ticks)),
            KeywordOrTicks::Keyword(keyword) => keyword.parse(),
        }
    }
}

impl From<FailbackPolicy> for KeywordOrTicks {
    fn from(policy: FailbackPolicy) -> Self {
        match policy {
            FailbackPolicy::Deferred(ticks) => KeywordOrTicks::Ticks(ticks),
            other => KeywordOrTicks::Keyword(other.to_string()),
        }
    }
}

impl std::fmt::Display for FailbackPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailbackPolicy::Manual => write!(f, "manual"),
            FailbackPolicy::Immediate => write!(f, "immediate"),
            FailbackPolicy::Deferred(ticks) => write!(f, "{}", ticks),
            FailbackPolicy::Followover => write!(f, "followover"),
        }
    }
}

impl std::str::FromStr for FailbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(FailbackPolicy::Manual),
            "immediate" => Ok(FailbackPolicy::Immediate),
            "followover" => Ok(FailbackPolicy::Followover),
            other => match other.parse::<u32>() {
                Ok(0) => Ok(FailbackPolicy::Immediate),
                Ok(ticks) => Ok(FailbackPolicy::Deferred(ticks)),
                Err(_) => Err(format!("Invalid failback policy: {}", s)),
            },
        }
    }
}

/// What to do with I/O once a device has no usable path left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "KeywordOrTicks", into = "KeywordOrTicks")]
pub enum NoPathRetry {
    /// Fail I/O immediately.
    #[default]
    Fail,
    /// Queue I/O until a path comes back.
    Queue,
    /// Queue for this many polling intervals, then fail.
    Retries(u32),
}

impl NoPathRetry {
    /// Whether the table should be loaded with `queue_if_no_path`.
    pub fn queues(self) -> bool {
        !matches!(self, NoPathRetry::Fail)
    }
}

impl TryFrom<KeywordOrTicks> for NoPathRetry {
    type Error = String;

    fn try_from(value: KeywordOrTicks) -> Result<Self, Self::Error> {
        match value {
            KeywordOrTicks::Ticks(0) => Ok(NoPathRetry::Fail),
            KeywordOrTicks::Ticks(retries) => Ok(NoPathRetry::Retries(retries)),
            KeywordOrTicks::Keyword(keyword) => match keyword.to_lowercase().as_str() {
                "fail" => Ok(NoPathRetry::Fail),
                "queue" => Ok(NoPathRetry::Queue),
                _ => Err(format!("Invalid no_path_retry value: {}", keyword)),
            },
        }
    }
}

impl From<NoPathRetry> for KeywordOrTicks {
    fn from(value: NoPathRetry) -> Self {
        match value {
            NoPathRetry::Fail => KeywordOrTicks::Keyword("fail".to_string()),
            NoPathRetry::Queue => KeywordOrTicks::Keyword("queue".to_string()),
            NoPathRetry::Retries(retries) => KeywordOrTicks::Ticks(retries),
        }
    }
}

/// How paths of one device are split into path groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingPolicy {
    /// One path per group.
    #[default]
    Failover,
    /// Every path in a single group.
    Multibus,
    /// One group per distinct path priority.
    GroupByPrio,
}

/// How often a checker message for a path that stays down is logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCheckerErr {
    Once,
    #[default]
    Always,
}
