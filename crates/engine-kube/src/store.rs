//! Durable status store kept in a ConfigMap
//!
//! Every write is a read-modify-replace of the whole ConfigMap. The replace
//! carries the `resourceVersion` that was read, so the API server rejects it
//! with 409 Conflict if another replica wrote in between; the write is then
//! re-evaluated against the fresh data. Compare-and-swap is therefore atomic
//! across replicas.
//!
//! ConfigMaps are limited to 1 MiB, which bounds how many run records one
//! store can hold.

use std::collections::BTreeMap;

use async_trait::async_trait;
use engine_common::store::{StatusStore, StoreResult};
use engine_common::StoreError;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::debug;

/// Conflicting writes tolerated before a store operation gives up
pub const MAX_CONFLICT_RETRIES: u32 = 5;

/// [`StatusStore`] backed by the data map of a single ConfigMap
#[derive(Clone)]
pub struct ConfigMapStatusStore {
    api: Api<ConfigMap>,
    name: String,
    namespace: String,
}

impl ConfigMapStatusStore {
    /// Use ConfigMap `name` in `namespace`, creating it on first write
    pub fn new(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
            namespace: namespace.to_string(),
        }
    }

    async fn read(&self) -> StoreResult<BTreeMap<String, String>> {
        let cm = self.api.get_opt(&self.name).await.map_err(backend)?;
        Ok(cm.and_then(|cm| cm.data).unwrap_or_default())
    }

    /// Apply `mutate` to the current data and write it back if it returns
    /// `true`. Returns whatever `mutate` returned on the attempt that stuck.
    async fn modify<F>(&self, key: &str, mut mutate: F) -> StoreResult<bool>
    where
        F: FnMut(&mut BTreeMap<String, String>) -> bool + Send,
    {
        for attempt in 1..=MAX_CONFLICT_RETRIES {
            let existing = self.api.get_opt(&self.name).await.map_err(backend)?;
            let result = match existing {
                Some(mut cm) => {
                    let mut data = cm.data.take().unwrap_or_default();
                    if !mutate(&mut data) {
                        return Ok(false);
                    }
                    cm.data = Some(data);
                    self.api
                        .replace(&self.name, &PostParams::default(), &cm)
                        .await
                }
                None => {
                    let mut data = BTreeMap::new();
                    if !mutate(&mut data) {
                        return Ok(false);
                    }
                    let cm = ConfigMap {
                        metadata: ObjectMeta {
                            name: Some(self.name.clone()),
                            namespace: Some(self.namespace.clone()),
                            ..Default::default()
                        },
                        data: Some(data),
                        ..Default::default()
                    };
                    self.api.create(&PostParams::default(), &cm).await
                }
            };

            match result {
                Ok(_) => return Ok(true),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    debug!(key, attempt, configmap = %self.name, "Store write conflict, retrying");
                }
                Err(e) => return Err(backend(e)),
            }
        }

        Err(StoreError::Contention {
            key: key.to_string(),
            attempts: MAX_CONFLICT_RETRIES,
        })
    }
}

fn backend(e: kube::Error) -> StoreError {
    StoreError::backend(e.to_string())
}

/// Conditional update applied to one snapshot of the data map
pub(crate) fn apply_cas(
    data: &mut BTreeMap<String, String>,
    key: &str,
    expected: Option<&str>,
    new_value: &str,
    extra: &BTreeMap<String, String>,
) -> bool {
    if data.get(key).map(String::as_str) != expected {
        return false;
    }
    data.insert(key.to_string(), new_value.to_string());
    data.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    true
}

/// Remove keys from one snapshot; `false` if nothing changed
pub(crate) fn apply_delete(
    data: &mut BTreeMap<String, String>,
    matches: impl Fn(&str) -> bool,
) -> bool {
    let before = data.len();
    data.retain(|k, _| !matches(k));
    data.len() != before
}

#[async_trait]
impl StatusStore for ConfigMapStatusStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.read().await?.remove(key))
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<BTreeMap<String, String>> {
        let mut data = self.read().await?;
        data.retain(|k, _| k.starts_with(prefix));
        Ok(data)
    }

    async fn put(&self, key: &str, value: &str) -> StoreResult<()> {
        self.modify(key, |data| {
            data.insert(key.to_string(), value.to_string());
            true
        })
        .await?;
        Ok(())
    }

    async fn put_all(&self, values: BTreeMap<String, String>) -> StoreResult<()> {
        let first = values.keys().next().cloned().unwrap_or_default();
        self.modify(&first, |data| {
            data.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
            true
        })
        .await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
        extra: BTreeMap<String, String>,
    ) -> StoreResult<bool> {
        self.modify(key, |data| apply_cas(data, key, expected, new_value, &extra))
            .await
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        let first = keys.first().cloned().unwrap_or_default();
        self.modify(&first, |data| {
            apply_delete(data, |k| keys.iter().any(|key| key == k))
        })
        .await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<()> {
        self.modify(prefix, |data| apply_delete(data, |k| k.starts_with(prefix)))
            .await?;
        Ok(())
    }
}
