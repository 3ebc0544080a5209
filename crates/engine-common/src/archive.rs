//! Result archive port and implementations
//!
//! The archive holds one document per run attempt. The controller only ever
//! creates a record for a requeued run and replays the status updates that
//! were deferred when the interrupt was requested.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::ArchiveError;
use crate::run::{DeferredArchiveAction, TestStructure};

/// Result type for archive operations
pub type ArchiveResult<T> = std::result::Result<T, ArchiveError>;

/// Outcome of a status update on an archive record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The record was changed
    Updated,
    /// The record already had the requested status and result
    Unchanged,
    /// No record with that id exists
    Missing,
}

/// Store of archived run results
#[async_trait]
pub trait ResultArchive: Send + Sync {
    /// Create a new record for a run, seeded from `structure`.
    ///
    /// `previous_id` is the record the run had before; the returned id is the
    /// new record's.
    async fn create_record(
        &self,
        previous_id: &str,
        structure: &TestStructure,
    ) -> ArchiveResult<String>;

    /// Set the status and result of an existing record
    async fn update_status(
        &self,
        record_id: &str,
        status: &str,
        result: &str,
    ) -> ArchiveResult<UpdateOutcome>;

    /// Apply an action deferred at interrupt time. Replaying an action that
    /// was already applied is a no-op.
    async fn replay_deferred_action(
        &self,
        run_name: &str,
        action: &DeferredArchiveAction,
    ) -> ArchiveResult<()> {
        let outcome = self
            .update_status(
                &action.run_id,
                &action.desired_run_status,
                &action.desired_run_result,
            )
            .await?;
        match outcome {
            UpdateOutcome::Updated => info!(
                run = %run_name,
                record = %action.run_id,
                status = %action.desired_run_status,
                result = %action.desired_run_result,
                "Updated archive record"
            ),
            UpdateOutcome::Unchanged => debug!(
                run = %run_name,
                record = %action.run_id,
                "Archive record already up to date"
            ),
            UpdateOutcome::Missing => warn!(
                run = %run_name,
                record = %action.run_id,
                "Archive record not found, skipping deferred action"
            ),
        }
        Ok(())
    }
}

/// In-process archive used by tests and local tooling
#[derive(Debug, Default)]
pub struct MemoryArchive {
    inner: Mutex<MemoryArchiveState>,
}

#[derive(Debug, Default)]
struct MemoryArchiveState {
    next_id: u64,
    records: BTreeMap<String, TestStructure>,
    created: Vec<(String, String)>,
}

impl MemoryArchive {
    /// Create an empty archive
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record under a fixed id
    pub fn insert(&self, id: impl Into<String>, structure: TestStructure) {
        if let Ok(mut state) = self.inner.lock() {
            state.records.insert(id.into(), structure);
        }
    }

    /// A copy of the record with the given id
    pub fn record(&self, id: &str) -> Option<TestStructure> {
        self.inner.lock().ok()?.records.get(id).cloned()
    }

    /// `(previous_id, new_id)` for every record created through the port
    pub fn created(&self) -> Vec<(String, String)> {
        self.inner
            .lock()
            .map(|s| s.created.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> ArchiveResult<MutexGuard<'_, MemoryArchiveState>> {
        self.inner
            .lock()
            .map_err(|_| ArchiveError::Malformed("memory archive lock poisoned".to_string()))
    }
}

#[async_trait]
impl ResultArchive for MemoryArchive {
    async fn create_record(
        &self,
        previous_id: &str,
        structure: &TestStructure,
    ) -> ArchiveResult<String> {
        let mut state = self.lock()?;
        state.next_id += 1;
        let id = format!("record-{}", state.next_id);
        state.records.insert(id.clone(), structure.clone());
        state.created.push((previous_id.to_string(), id.clone()));
        Ok(id)
    }

    async fn update_status(
        &self,
        record_id: &str,
        status: &str,
        result: &str,
    ) -> ArchiveResult<UpdateOutcome> {
        let mut state = self.lock()?;
        let Some(record) = state.records.get_mut(record_id) else {
            return Ok(UpdateOutcome::Missing);
        };
        if record.status.as_deref() == Some(status) && record.result.as_deref() == Some(result) {
            return Ok(UpdateOutcome::Unchanged);
        }
        record.status = Some(status.to_string());
        record.result = Some(result.to_string());
        Ok(UpdateOutcome::Updated)
    }
}

/// Archive stored in a CouchDB database over HTTP
///
/// Updates are revision-guarded: the document is fetched, patched and written
/// back with its `_rev`, so a concurrent writer makes the update fail with a
/// 409 instead of being silently overwritten.
#[derive(Debug, Clone)]
pub struct CouchArchive {
    client: reqwest::Client,
    base_url: String,
    database: String,
    token: Option<String>,
}

impl CouchArchive {
    /// Default database holding run documents
    pub const DEFAULT_DATABASE: &'static str = "galasa_run";

    /// Create a client for `base_url` (e.g. `http://couchdb:5984`)
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            database: Self::DEFAULT_DATABASE.to_string(),
            token,
        }
    }

    /// Use a different database name
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    fn database_url(&self) -> String {
        format!("{}/{}", self.base_url, self.database)
    }

    fn document_url(&self, id: &str) -> String {
        format!("{}/{}", self.database_url(), id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ResultArchive for CouchArchive {
    async fn create_record(
        &self,
        previous_id: &str,
        structure: &TestStructure,
    ) -> ArchiveResult<String> {
        let response = self
            .authorize(self.client.post(self.database_url()))
            .json(structure)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArchiveError::Status {
                status: status.as_u16(),
                context: format!("create record replacing {previous_id}"),
            });
        }
        let body: Value = response.json().await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ArchiveError::Malformed("create response has no id".to_string()))
    }

    async fn update_status(
        &self,
        record_id: &str,
        status: &str,
        result: &str,
    ) -> ArchiveResult<UpdateOutcome> {
        let url = self.document_url(record_id);
        let response = self.authorize(self.client.get(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(UpdateOutcome::Missing);
        }
        if !response.status().is_success() {
            return Err(ArchiveError::Status {
                status: response.status().as_u16(),
                context: format!("read record {record_id}"),
            });
        }
        let mut doc: Value = response.json().await?;
        if !apply_status(&mut doc, status, result)? {
            return Ok(UpdateOutcome::Unchanged);
        }

        let response = self.authorize(self.client.put(&url)).json(&doc).send().await?;
        if !response.status().is_success() {
            return Err(ArchiveError::Status {
                status: response.status().as_u16(),
                context: format!("update record {record_id}"),
            });
        }
        Ok(UpdateOutcome::Updated)
    }
}

/// Patch status and result into an archive document; `false` if it already
/// carried both values.
fn apply_status(doc: &mut Value, status: &str, result: &str) -> ArchiveResult<bool> {
    let Some(fields) = doc.as_object_mut() else {
        return Err(ArchiveError::Malformed(
            "archive document is not an object".to_string(),
        ));
    };
    let unchanged = fields.get("status").and_then(Value::as_str) == Some(status)
        && fields.get("result").and_then(Value::as_str) == Some(result);
    if unchanged {
        return Ok(false);
    }
    fields.insert("status".to_string(), Value::String(status.to_string()));
    fields.insert("result".to_string(), Value::String(result.to_string()));
    Ok(true)
}
