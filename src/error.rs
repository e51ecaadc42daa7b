//! Error types for the Keystone cluster controller.
//!
//! A single unified error type [`KeystoneError`] covers every operation the
//! controller performs, along with a convenient [`Result`] alias.
//!
//! # Error Categories
//!
//! - **Placement**: not enough workers, or workers below the expected quality
//! - **Recruitment**: queued requests expiring, all-or-nothing failures
//! - **Failure detection**: protocol violations from monitoring clients
//! - **Leadership**: lost elections and coordinator churn
//! - **Store**: errors from the external metadata store
//! - **Configuration**: invalid settings or missing configuration

use std::io;
use thiserror::Error;

/// Main error type for controller operations.
#[derive(Error, Debug)]
pub enum KeystoneError {
    // Placement errors
    #[error("No more servers: {0}")]
    NoMoreServers(String),

    #[error("Placement below expected fitness during startup grace window")]
    OperationFailed,

    #[error("Recruitment failed: {0}")]
    RecruitmentFailed(String),

    // Queued-request errors
    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    // Failure-detection protocol errors
    #[error("Client presented version {presented} ahead of server version {current}")]
    FutureVersion { presented: u64, current: u64 },

    // Leadership errors
    #[error("Not the leader")]
    NotLeader,

    #[error("Coordinators changed")]
    CoordinatorsChanged,

    // Task lifecycle
    #[error("Cancelled")]
    Cancelled,

    // External metadata store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KeystoneError {
    /// Check if the error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KeystoneError::StoreUnavailable(_) | KeystoneError::Timeout(_)
        )
    }

    /// Placement errors are expected under worker churn and never bring the
    /// controller down; everything else escalates per caller policy.
    pub fn is_placement(&self) -> bool {
        matches!(
            self,
            KeystoneError::NoMoreServers(_) | KeystoneError::OperationFailed
        )
    }
}

impl From<serde_json::Error> for KeystoneError {
    fn from(e: serde_json::Error) -> Self {
        KeystoneError::Serialization(e.to_string())
    }
}

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, KeystoneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(KeystoneError::StoreUnavailable("conn reset".into()).is_retryable());
        assert!(!KeystoneError::NoMoreServers("no storage fit".into()).is_retryable());
        assert!(!KeystoneError::Cancelled.is_retryable());
    }

    #[test]
    fn test_placement_classification() {
        assert!(KeystoneError::NoMoreServers("x".into()).is_placement());
        assert!(KeystoneError::OperationFailed.is_placement());
        assert!(!KeystoneError::Internal("x".into()).is_placement());
    }
}
