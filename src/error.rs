//! ==============================================================================
//! error.rs - error taxonomy for the gateway
//! ==============================================================================
//!
//! purpose:
//!     one enum per concern. only the config errors are fatal, and only at
//!     startup. everything else is logged and the gateway keeps running.
//!
//! relationships:
//!     - used by: config.rs, store.rs, sampler.rs, control.rs, session.rs
//!
//! ==============================================================================

use std::path::PathBuf;

/// device config could not be turned into credentials (fatal at startup)
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {path} not found or unreadable: {source}")]
    Missing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config file {path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// reading store i/o failure (non-fatal, the reading is dropped)
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("couldn't {op} persistence file {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(op: &'static str, path: &std::path::Path, source: std::io::Error) -> Self {
        StoreError::Io { op, path: path.to_path_buf(), source }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("temperature sensor unavailable")]
    Unavailable,
    #[error("temperature sensor returned {0:?}")]
    Unparseable(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("unknown log level {0:?}")]
    InvalidLevel(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,
    #[error("platform request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("platform rejected readings for {key}: HTTP {status}")]
    Rejected { key: String, status: u16 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
