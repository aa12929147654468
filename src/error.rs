//! Unified error types for pod-ipam

use std::io;
use thiserror::Error;

/// Main error type for pod-ipam operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Invalid plugin configuration: {0}")]
    Config(String),

    #[error("Failed to parse network configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid CNI_ARGS: {0}")]
    InvalidArgs(String),

    #[error("Unsupported CNI version '{0}'")]
    UnsupportedVersion(String),

    // Pool errors
    #[error("IP pool is invalid: {0}")]
    Validation(String),

    #[error("Failed to update IP pool '{pool}', resource version is stale; retry")]
    Conflict { pool: String },

    #[error("No free address found in IP pool '{pool}' after {attempts} attempts")]
    PoolExhausted { pool: String, attempts: u32 },

    #[error("Pod {namespace}/{pod} has no reservation in IP pool '{pool}'")]
    NoReservation {
        pool: String,
        namespace: String,
        pod: String,
    },

    // Collaborator errors
    #[error("IP pool store error: {0}")]
    Store(String),

    #[error("Pod lookup failed: {0}")]
    LivenessQuery(String),
}

impl Error {
    /// True when the operation lost an optimistic-concurrency race and
    /// should be restarted from a fresh read.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

/// Result type alias for pod-ipam operations
pub type Result<T> = std::result::Result<T, Error>;
