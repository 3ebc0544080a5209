//! Deletes worker pods whose run has terminated

use std::sync::Arc;

use engine_common::metrics;
use engine_kube::pods::{run_name, terminated_pods};
use engine_kube::ClusterFacade;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::settings::Settings;

/// Removes terminated worker pods
pub struct PodCleanup {
    facade: Arc<dyn ClusterFacade>,
    settings: watch::Receiver<Arc<Settings>>,
}

impl PodCleanup {
    /// Create a cleanup task
    pub fn new(facade: Arc<dyn ClusterFacade>, settings: watch::Receiver<Arc<Settings>>) -> Self {
        Self { facade, settings }
    }

    /// One periodic pass; errors are logged
    pub async fn tick(&self) {
        match self.cleanup().await {
            Ok(0) => debug!("No terminated worker pods"),
            Ok(deleted) => info!(deleted, "Cleaned up terminated worker pods"),
            Err(e) => error!(error = %e, "Pod cleanup failed"),
        }
    }

    /// Delete every failed or succeeded worker pod that carries a run label.
    /// Returns the number deleted.
    pub async fn cleanup(&self) -> Result<usize> {
        if !self.facade.dependencies_ready().await {
            warn!("Store or archive not ready, skipping pod cleanup");
            return Ok(0);
        }

        let engine_label = self.settings.borrow().engine_label.clone();
        let pods = self.facade.list_worker_pods(&engine_label).await?;

        let mut deleted = 0;
        for pod in terminated_pods(&pods) {
            let (Some(pod_name), Some(run)) = (pod.metadata.name.as_deref(), run_name(pod)) else {
                continue;
            };
            match self.facade.delete_pod(pod_name).await {
                Ok(()) => {
                    info!(pod = %pod_name, run = %run, "Deleted terminated worker pod");
                    metrics::record_pod_cleaned();
                    deleted += 1;
                }
                Err(e) => warn!(
                    pod = %pod_name,
                    run = %run,
                    error = %e,
                    "Failed to delete terminated worker pod"
                ),
            }
        }
        Ok(deleted)
    }
}
