//! Thin facade over the Kubernetes API used by the controller
//!
//! Everything the scheduler, interrupt processor and cleanup task need from
//! the cluster goes through [`ClusterFacade`], so they can be tested with a
//! mock instead of a live API server.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::ClusterError;
use crate::pods::is_pod_ready;
use crate::{ENGINE_CONTROLLER_LABEL, RUN_LABEL};

/// Cluster operations needed by the controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterFacade: Send + Sync {
    /// Worker pods launched under the given engine label
    async fn list_worker_pods(&self, engine_label: &str) -> Result<Vec<Pod>, ClusterError>;

    /// Create a pod. A name collision is reported as
    /// [`ClusterError::AlreadyExists`].
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError>;

    /// Delete a pod by name; a pod that is already gone is not an error
    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError>;

    /// The worker pod for a run, if one exists
    async fn get_worker_pod(&self, run_name: &str) -> Result<Option<Pod>, ClusterError>;

    /// Whether the status store and result archive services are ready
    async fn dependencies_ready(&self) -> bool;

    /// Fetch a ConfigMap in the controller namespace
    async fn get_config_map(&self, name: &str) -> Result<ConfigMap, ClusterError>;
}

/// [`ClusterFacade`] backed by a kube client
#[derive(Clone)]
pub struct KubeFacade {
    client: Client,
    namespace: String,
    install_name: String,
}

impl KubeFacade {
    /// Create a facade for `namespace`. `install_name` prefixes the app labels
    /// of the dependency pods checked by [`ClusterFacade::dependencies_ready`].
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        install_name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            install_name: install_name.into(),
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn component_ready(&self, component: &str) -> bool {
        let selector = dependency_selector(&self.install_name, component);
        match self.pods().list(&ListParams::default().labels(&selector)).await {
            Ok(pods) => {
                let ready = pods.items.iter().any(is_pod_ready);
                if !ready {
                    debug!(component, selector = %selector, "Dependency has no ready pods");
                }
                ready
            }
            Err(e) => {
                warn!(component, error = %e, "Failed to check dependency readiness");
                false
            }
        }
    }
}

/// Label selector for a dependency component's pods
pub fn dependency_selector(install_name: &str, component: &str) -> String {
    if install_name.is_empty() {
        format!("app={component}")
    } else {
        format!("app={install_name}-{component}")
    }
}

#[async_trait]
impl ClusterFacade for KubeFacade {
    async fn list_worker_pods(&self, engine_label: &str) -> Result<Vec<Pod>, ClusterError> {
        let selector = format!("{ENGINE_CONTROLLER_LABEL}={engine_label}");
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(pods.items)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        match self.pods().create(&PostParams::default(), pod).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(ClusterError::AlreadyExists {
                name: pod.metadata.name.clone().unwrap_or_default(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        match self.pods().delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(pod = %name, "Deleted pod");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(pod = %name, "Pod already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_worker_pod(&self, run_name: &str) -> Result<Option<Pod>, ClusterError> {
        let selector = format!("{RUN_LABEL}={run_name}");
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(pods.items.into_iter().next())
    }

    async fn dependencies_ready(&self) -> bool {
        // Both checks run every time so each missing dependency is logged
        let store = self.component_ready("etcd").await;
        let archive = self.component_ready("ras").await;
        store && archive
    }

    async fn get_config_map(&self, name: &str) -> Result<ConfigMap, ClusterError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.get(name).await {
            Ok(cm) => Ok(cm),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(ClusterError::NotFound {
                kind: "ConfigMap".to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}
