//! Kubernetes integration for the engine controller: the cluster facade,
//! pod helpers and a ConfigMap-backed run store

#![deny(missing_docs)]

pub mod error;
pub mod facade;
pub mod pods;
pub mod store;

pub use error::ClusterError;
pub use facade::{ClusterFacade, KubeFacade};
pub use store::ConfigMapStatusStore;

/// Label carrying the engine label a worker pod was launched under
pub const ENGINE_CONTROLLER_LABEL: &str = "galasa-engine-controller";

/// Label carrying the run name a worker pod executes
pub const RUN_LABEL: &str = "galasa-run";
