//! Error types for the controller tasks

use thiserror::Error;

/// Errors raised by controller operations
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Run store or archive failure
    #[error(transparent)]
    Runs(#[from] engine_common::Error),

    /// Archive failure outside run bookkeeping
    #[error(transparent)]
    Archive(#[from] engine_common::ArchiveError),

    /// Status store failure outside run bookkeeping
    #[error(transparent)]
    Store(#[from] engine_common::StoreError),

    /// Cluster API failure
    #[error(transparent)]
    Cluster(#[from] engine_kube::ClusterError),

    /// The settings ConfigMap is structurally unusable
    #[error("invalid settings in {config_map}: {message}")]
    InvalidSettings {
        /// ConfigMap name
        config_map: String,
        /// What is missing or malformed
        message: String,
    },
}

impl ControllerError {
    /// Create an invalid-settings error
    pub fn invalid_settings(config_map: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidSettings {
            config_map: config_map.into(),
            message: msg.into(),
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;
