// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command failed: {command}; output: {output}")]
    CommandFailed { command: String, output: String },

    #[error("command timed out after {seconds}s: {command}")]
    CommandTimeout { command: String, seconds: u64 },

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("unsupported filesystem: {0}")]
    UnsupportedFilesystem(String),

    #[error("invalid partition table on {disk}: {reason}")]
    InvalidPartitionTable { disk: String, reason: String },

    #[error("not enough free space on {disk}: requested {requested} sectors, {available} available")]
    NotEnoughSpace {
        disk: String,
        requested: u64,
        available: u64,
    },

    #[error("failed to parse {what}: {detail}")]
    Parse { what: String, detail: String },

    #[error("image error: {0}")]
    Image(String),

    #[error("signature verification failed: {0}")]
    Verification(String),
}

impl SysError {
    pub(crate) fn parse(what: impl Into<String>, detail: impl Into<String>) -> Self {
        SysError::Parse {
            what: what.into(),
            detail: detail.into(),
        }
    }
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;
