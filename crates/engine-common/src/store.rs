//! Durable status store port
//!
//! Every replica of the controller shares one store. The only cross-replica
//! mutual exclusion is [`StatusStore::compare_and_swap`], so every claim on a
//! run must be a single conditional write.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StoreError;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key/value store with atomic compare-and-swap
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Read a single key
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Read every key starting with `prefix`
    async fn get_prefix(&self, prefix: &str) -> StoreResult<BTreeMap<String, String>>;

    /// Write a single key
    async fn put(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Write several keys in one operation
    async fn put_all(&self, values: BTreeMap<String, String>) -> StoreResult<()>;

    /// Set `key` to `new_value` and write every `extra` entry, only if the
    /// current value of `key` equals `expected` (`None` means absent).
    ///
    /// Returns `false` without writing anything when the condition fails.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
        extra: BTreeMap<String, String>,
    ) -> StoreResult<bool>;

    /// Delete the given keys; missing keys are ignored
    async fn delete(&self, keys: &[String]) -> StoreResult<()>;

    /// Delete every key starting with `prefix`
    async fn delete_prefix(&self, prefix: &str) -> StoreResult<()>;
}

/// In-process store used by tests and single-replica tooling
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    data: Mutex<BTreeMap<String, String>>,
}

impl MemoryStatusStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with the given entries
    pub fn with_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let data = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            data: Mutex::new(data),
        }
    }

    /// Copy of every entry currently held
    pub fn snapshot(&self) -> StoreResult<BTreeMap<String, String>> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, BTreeMap<String, String>>> {
        self.data
            .lock()
            .map_err(|_| StoreError::backend("memory store lock poisoned"))
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<BTreeMap<String, String>> {
        Ok(self
            .lock()?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn put(&self, key: &str, value: &str) -> StoreResult<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn put_all(&self, values: BTreeMap<String, String>) -> StoreResult<()> {
        self.lock()?.extend(values);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
        extra: BTreeMap<String, String>,
    ) -> StoreResult<bool> {
        let mut data = self.lock()?;
        if data.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        data.insert(key.to_string(), new_value.to_string());
        data.extend(extra);
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        let mut data = self.lock()?;
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<()> {
        self.lock()?.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}
