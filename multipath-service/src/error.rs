// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use multipath_contracts::EngineError;
use thiserror::Error;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced by the reconciliation engine
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("path {0} has no identity")]
    NoIdentity(String),

    #[error("path {0} is blacklisted")]
    Blacklisted(String),

    #[error("path {dev} size {path_size} does not match {alias} size {map_size}")]
    SizeMismatch {
        dev: String,
        alias: String,
        path_size: u64,
        map_size: u64,
    },

    #[error("path {0} has zero size")]
    ZeroSize(String),

    #[error("path {0} not found")]
    PathNotFound(String),

    #[error("map {0} not found")]
    MapNotFound(String),

    #[error("map {0} is not a multipath map")]
    NotMultipath(String),

    #[error("alias {alias} is already used by {wwid}")]
    AliasInUse { alias: String, wwid: String },

    #[error("map {0} is busy")]
    Busy(String),

    #[error("table engine failed on {name}: {source}")]
    Table {
        name: String,
        #[source]
        source: EngineError,
    },

    #[error("cannot probe {name}: {source}")]
    Discovery {
        name: String,
        #[source]
        source: EngineError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("operation cancelled")]
    Cancelled,
}

impl ReconcileError {
    pub(crate) fn table(name: &str, source: EngineError) -> Self {
        ReconcileError::Table {
            name: name.to_string(),
            source,
        }
    }

    pub(crate) fn discovery(name: &str, source: EngineError) -> Self {
        ReconcileError::Discovery {
            name: name.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
