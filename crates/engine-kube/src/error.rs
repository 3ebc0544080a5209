//! Error types for cluster operations

use thiserror::Error;

/// Errors raised by the cluster facade
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A pod with the requested name already exists
    #[error("pod {name} already exists")]
    AlreadyExists {
        /// Name that collided
        name: String,
    },

    /// The requested object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of object, e.g. ConfigMap
        kind: String,
        /// Object name
        name: String,
    },

    /// Any other Kubernetes API failure
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

impl ClusterError {
    /// Whether this error reports a name collision on create
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}
