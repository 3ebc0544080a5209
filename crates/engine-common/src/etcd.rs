//! Durable status store kept in etcd
//!
//! This is the shared dynamic status store the workers write to. Keys are
//! held under the `dss.framework.` namespace. Compare-and-swap is a single
//! etcd transaction guarded on the current value of the key (or on its
//! version being zero when it must be absent), so it is atomic across
//! replicas.

use std::collections::BTreeMap;

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, DeleteOptions, GetOptions, KvClient, Txn, TxnOp};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::{StatusStore, StoreResult};

/// Scheme prefix of an etcd store locator
pub const ETCD_SCHEME: &str = "etcd:";

/// Namespace prepended to every key the controller reads or writes
pub const FRAMEWORK_NAMESPACE: &str = "dss.framework.";

/// Endpoints named by a store locator such as `etcd:http://etcd:2379`.
///
/// Several endpoints may be given separated by commas. Returns `None` when
/// the locator is not an etcd one.
pub fn parse_locator(locator: &str) -> Option<Vec<String>> {
    let rest = locator.trim().strip_prefix(ETCD_SCHEME)?;
    let endpoints: Vec<String> = rest
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect();
    (!endpoints.is_empty()).then_some(endpoints)
}

fn namespaced(key: &str) -> String {
    format!("{FRAMEWORK_NAMESPACE}{key}")
}

fn backend(e: etcd_client::Error) -> StoreError {
    StoreError::backend(e.to_string())
}

/// [`StatusStore`] backed by etcd
#[derive(Clone)]
pub struct EtcdStatusStore {
    kv: KvClient,
}

impl EtcdStatusStore {
    /// Connect to the given endpoints
    pub async fn connect(endpoints: &[String]) -> StoreResult<Self> {
        let client = Client::connect(endpoints, None).await.map_err(backend)?;
        info!(endpoints = ?endpoints, "Connected to etcd status store");
        Ok(Self {
            kv: client.kv_client(),
        })
    }

    fn put_ops(values: &BTreeMap<String, String>) -> Vec<TxnOp> {
        values
            .iter()
            .map(|(k, v)| TxnOp::put(namespaced(k), v.as_str(), None))
            .collect()
    }
}

#[async_trait]
impl StatusStore for EtcdStatusStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let resp = self
            .kv
            .clone()
            .get(namespaced(key), None)
            .await
            .map_err(backend)?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(kv.value_str().map_err(backend)?.to_string())),
            None => Ok(None),
        }
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<BTreeMap<String, String>> {
        let resp = self
            .kv
            .clone()
            .get(namespaced(prefix), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(backend)?;
        let mut values = BTreeMap::new();
        for kv in resp.kvs() {
            let key = kv.key_str().map_err(backend)?;
            let Some(key) = key.strip_prefix(FRAMEWORK_NAMESPACE) else {
                continue;
            };
            values.insert(key.to_string(), kv.value_str().map_err(backend)?.to_string());
        }
        Ok(values)
    }

    async fn put(&self, key: &str, value: &str) -> StoreResult<()> {
        self.kv
            .clone()
            .put(namespaced(key), value, None)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn put_all(&self, values: BTreeMap<String, String>) -> StoreResult<()> {
        if values.is_empty() {
            return Ok(());
        }
        let txn = Txn::new().and_then(Self::put_ops(&values));
        self.kv.clone().txn(txn).await.map_err(backend)?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
        extra: BTreeMap<String, String>,
    ) -> StoreResult<bool> {
        let guard = match expected {
            Some(value) => Compare::value(namespaced(key), CompareOp::Equal, value),
            None => Compare::version(namespaced(key), CompareOp::Equal, 0),
        };
        let mut ops = vec![TxnOp::put(namespaced(key), new_value, None)];
        ops.extend(Self::put_ops(&extra));

        let txn = Txn::new().when(vec![guard]).and_then(ops);
        let resp = self.kv.clone().txn(txn).await.map_err(backend)?;
        if !resp.succeeded() {
            debug!(key, expected = ?expected, "Compare-and-swap lost");
        }
        Ok(resp.succeeded())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let ops: Vec<TxnOp> = keys
            .iter()
            .map(|k| TxnOp::delete(namespaced(k), None))
            .collect();
        self.kv
            .clone()
            .txn(Txn::new().and_then(ops))
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<()> {
        self.kv
            .clone()
            .delete(namespaced(prefix), Some(DeleteOptions::new().with_prefix()))
            .await
            .map_err(backend)?;
        Ok(())
    }
}
