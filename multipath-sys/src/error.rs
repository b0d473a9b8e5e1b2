// SPDX-License-Identifier: GPL-3.0-only

use multipath_contracts::{EngineError, ErrorKind};
use thiserror::Error;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device busy: {0}")]
    Busy(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

impl From<SysError> for EngineError {
    fn from(err: SysError) -> Self {
        let kind = match &err {
            SysError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            SysError::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            SysError::Io(_) => ErrorKind::Unavailable,
            SysError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            SysError::DeviceNotFound(_) => ErrorKind::NotFound,
            SysError::Busy(_) => ErrorKind::Busy,
            SysError::Parse(_) => ErrorKind::InvalidInput,
            SysError::OperationFailed(_) => ErrorKind::Internal,
        };
        EngineError::new(kind, err.to_string())
    }
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;
