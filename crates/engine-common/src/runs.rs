//! Run repository over the durable status store
//!
//! Each run is a set of keys `run.<name>.<suffix>`. Reads assemble those keys
//! into a [`Run`]; writes touch only the suffixes they own.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::run::{
    decode_actions, encode_actions, format_timestamp, parse_timestamp, InterruptReason, Run,
    RunStatus,
};
use crate::store::StatusStore;
use crate::{Error, Result};

/// Prefix shared by every run key
pub const RUN_PREFIX: &str = "run.";

/// Key suffixes within a run record
pub mod keys {
    /// Lifecycle status
    pub const STATUS: &str = "status";
    /// Final result
    pub const RESULT: &str = "result";
    /// Queue time
    pub const QUEUED: &str = "queued";
    /// Finish time
    pub const FINISHED: &str = "finished";
    /// Last worker heartbeat
    pub const HEARTBEAT: &str = "heartbeat";
    /// Requested interrupt
    pub const INTERRUPT_REASON: &str = "interruptReason";
    /// When the interrupt was requested
    pub const INTERRUPTED_AT: &str = "interruptedAt";
    /// Archive record id
    pub const ARCHIVE_ID: &str = "rasrunid";
    /// Encoded deferred archive actions
    pub const ARCHIVE_ACTIONS: &str = "rasActions";
    /// Local-run marker
    pub const LOCAL: &str = "local";
    /// Trace flag for the worker
    pub const TRACE: &str = "trace";
    /// Submission group
    pub const GROUP: &str = "group";
    /// Submission id
    pub const SUBMISSION_ID: &str = "submissionId";
    /// Requesting user
    pub const REQUESTOR: &str = "requestor";
    /// `bundle/class` of the test
    pub const TEST: &str = "test";
    /// JSON array of tags
    pub const TAGS: &str = "tags";
    /// Name of the controller pod that allocated the run
    pub const CONTROLLER: &str = "controller";
    /// Allocation time
    pub const ALLOCATED: &str = "allocated";
    /// When an allocation that never started should be abandoned
    pub const ALLOCATE_TIMEOUT: &str = "allocate.timeout";
}

/// Full store key for a run attribute
pub fn run_key(run_name: &str, suffix: &str) -> String {
    format!("{RUN_PREFIX}{run_name}.{suffix}")
}

/// Reads and state transitions on test runs
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Runs currently in `queued` status
    async fn queued_runs(&self) -> Result<Vec<Run>>;

    /// Every run in the store
    async fn all_runs(&self) -> Result<Vec<Run>>;

    /// A single run, if it exists
    async fn get_run(&self, name: &str) -> Result<Option<Run>>;

    /// Claim a queued run for `controller`.
    ///
    /// Returns `false` when another replica already moved the run out of
    /// `queued`.
    async fn allocate(&self, name: &str, controller: &str, timeout: Duration) -> Result<bool>;

    /// Move a run to `finished` with the given result. Returns `false` if the
    /// run does not exist.
    async fn mark_finished(&self, name: &str, result: &str) -> Result<bool>;

    /// Move a run from `expected` to `cancelling`; `false` if the status changed
    async fn mark_cancelling(&self, name: &str, expected: RunStatus) -> Result<bool>;

    /// Put an interrupted run back on the queue, pointing it at
    /// `archive_id` when one is given. Local runs are left alone and return
    /// `false`.
    ///
    /// The interrupt markers are cleared last, so a failure part way leaves
    /// the run interrupted and it is picked up again.
    async fn reset(&self, name: &str, archive_id: Option<&str>) -> Result<bool>;
}

/// [`RunRepository`] backed by a [`StatusStore`]
#[derive(Clone)]
pub struct StoreRunRepository {
    store: Arc<dyn StatusStore>,
    clock: Arc<dyn Clock>,
}

impl StoreRunRepository {
    /// Create a repository over `store`, stamping times from `clock`
    pub fn new(store: Arc<dyn StatusStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Write every attribute of `run` to the store
    pub async fn save(&self, run: &Run) -> Result<()> {
        self.store.put_all(run_entries(run)?).await?;
        Ok(())
    }

    fn now(&self) -> String {
        format_timestamp(self.clock.now())
    }
}

#[async_trait]
impl RunRepository for StoreRunRepository {
    async fn queued_runs(&self) -> Result<Vec<Run>> {
        Ok(self
            .all_runs()
            .await?
            .into_iter()
            .filter(|r| r.status == RunStatus::Queued)
            .collect())
    }

    async fn all_runs(&self) -> Result<Vec<Run>> {
        let entries = self.store.get_prefix(RUN_PREFIX).await?;
        let mut grouped: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (key, value) in entries {
            let Some(rest) = key.strip_prefix(RUN_PREFIX) else {
                continue;
            };
            let Some((name, suffix)) = rest.split_once('.') else {
                continue;
            };
            grouped
                .entry(name.to_string())
                .or_default()
                .insert(suffix.to_string(), value);
        }

        let mut runs = Vec::with_capacity(grouped.len());
        for (name, attrs) in grouped {
            match parse_run(&name, &attrs) {
                Ok(Some(run)) => runs.push(run),
                Ok(None) => debug!(run = %name, "run record has no status, skipping"),
                Err(e) => warn!(run = %name, error = %e, "skipping malformed run record"),
            }
        }
        Ok(runs)
    }

    async fn get_run(&self, name: &str) -> Result<Option<Run>> {
        let prefix = run_key(name, "");
        let attrs: BTreeMap<String, String> = self
            .store
            .get_prefix(&prefix)
            .await?
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|s| (s.to_string(), v)))
            .collect();
        parse_run(name, &attrs)
    }

    async fn allocate(&self, name: &str, controller: &str, timeout: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expires = now + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());
        let extra = BTreeMap::from([
            (run_key(name, keys::CONTROLLER), controller.to_string()),
            (run_key(name, keys::ALLOCATED), format_timestamp(now)),
            (run_key(name, keys::ALLOCATE_TIMEOUT), format_timestamp(expires)),
        ]);
        Ok(self
            .store
            .compare_and_swap(
                &run_key(name, keys::STATUS),
                Some(RunStatus::Queued.as_str()),
                RunStatus::Allocated.as_str(),
                extra,
            )
            .await?)
    }

    async fn mark_finished(&self, name: &str, result: &str) -> Result<bool> {
        if self.store.get(&run_key(name, keys::STATUS)).await?.is_none() {
            return Ok(false);
        }
        let values = BTreeMap::from([
            (
                run_key(name, keys::STATUS),
                RunStatus::Finished.as_str().to_string(),
            ),
            (run_key(name, keys::RESULT), result.to_string()),
            (run_key(name, keys::FINISHED), self.now()),
        ]);
        self.store.put_all(values).await?;
        Ok(true)
    }

    async fn mark_cancelling(&self, name: &str, expected: RunStatus) -> Result<bool> {
        Ok(self
            .store
            .compare_and_swap(
                &run_key(name, keys::STATUS),
                Some(expected.as_str()),
                RunStatus::Cancelling.as_str(),
                BTreeMap::new(),
            )
            .await?)
    }

    async fn reset(&self, name: &str, archive_id: Option<&str>) -> Result<bool> {
        let Some(run) = self.get_run(name).await? else {
            return Err(Error::RunNotFound(name.to_string()));
        };
        if run.local {
            return Ok(false);
        }
        let mut values = BTreeMap::from([(
            run_key(name, keys::STATUS),
            RunStatus::Queued.as_str().to_string(),
        )]);
        if let Some(id) = archive_id {
            values.insert(run_key(name, keys::ARCHIVE_ID), id.to_string());
        }
        self.store.put_all(values).await?;
        self.store
            .delete(&[
                run_key(name, keys::HEARTBEAT),
                run_key(name, keys::INTERRUPT_REASON),
                run_key(name, keys::INTERRUPTED_AT),
            ])
            .await?;
        Ok(true)
    }
}

fn parse_run(name: &str, attrs: &BTreeMap<String, String>) -> Result<Option<Run>> {
    let Some(status) = attrs.get(keys::STATUS) else {
        return Ok(None);
    };
    let get = |suffix: &str| {
        attrs
            .get(suffix)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let time = |suffix: &str| attrs.get(suffix).and_then(|v| parse_timestamp(v));
    let flag = |suffix: &str| {
        attrs
            .get(suffix)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
    };

    let (bundle, test) = match get(keys::TEST) {
        Some(t) => match t.split_once('/') {
            Some((b, c)) => (Some(b.to_string()), Some(c.to_string())),
            None => (None, Some(t)),
        },
        None => (None, None),
    };

    let tags = match get(keys::TAGS) {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| Error::encoding(run_key(name, keys::TAGS), e.to_string()))?,
        None => Vec::new(),
    };

    let deferred_actions = match attrs.get(keys::ARCHIVE_ACTIONS) {
        Some(raw) => decode_actions(&run_key(name, keys::ARCHIVE_ACTIONS), raw)?,
        None => Vec::new(),
    };

    Ok(Some(Run {
        name: name.to_string(),
        status: status.parse()?,
        result: get(keys::RESULT),
        interrupt_reason: attrs
            .get(keys::INTERRUPT_REASON)
            .and_then(|v| InterruptReason::parse(v)),
        interrupted_at: time(keys::INTERRUPTED_AT),
        queued: time(keys::QUEUED),
        heartbeat: time(keys::HEARTBEAT),
        finished: time(keys::FINISHED),
        bundle,
        test,
        requestor: get(keys::REQUESTOR),
        group: get(keys::GROUP),
        submission_id: get(keys::SUBMISSION_ID),
        tags,
        archive_id: get(keys::ARCHIVE_ID),
        deferred_actions,
        local: flag(keys::LOCAL),
        trace: flag(keys::TRACE),
    }))
}

fn run_entries(run: &Run) -> Result<BTreeMap<String, String>> {
    let name = run.name.as_str();
    let mut out = BTreeMap::new();
    let mut set = |suffix: &str, value: String| {
        out.insert(run_key(name, suffix), value);
    };

    set(keys::STATUS, run.status.as_str().to_string());
    set(keys::LOCAL, run.local.to_string());
    set(keys::TRACE, run.trace.to_string());
    if let Some(v) = &run.result {
        set(keys::RESULT, v.clone());
    }
    if let Some(v) = &run.interrupt_reason {
        set(keys::INTERRUPT_REASON, v.as_str().to_string());
    }
    for (suffix, ts) in [
        (keys::INTERRUPTED_AT, run.interrupted_at),
        (keys::QUEUED, run.queued),
        (keys::HEARTBEAT, run.heartbeat),
        (keys::FINISHED, run.finished),
    ] {
        if let Some(ts) = ts {
            set(suffix, format_timestamp(ts));
        }
    }
    match (&run.bundle, &run.test) {
        (Some(b), Some(t)) => set(keys::TEST, format!("{b}/{t}")),
        (None, Some(t)) => set(keys::TEST, t.clone()),
        _ => {}
    }
    for (suffix, value) in [
        (keys::REQUESTOR, &run.requestor),
        (keys::GROUP, &run.group),
        (keys::SUBMISSION_ID, &run.submission_id),
        (keys::ARCHIVE_ID, &run.archive_id),
    ] {
        if let Some(v) = value {
            set(suffix, v.clone());
        }
    }
    if !run.tags.is_empty() {
        let tags = serde_json::to_string(&run.tags)
            .map_err(|e| Error::encoding(run_key(name, keys::TAGS), e.to_string()))?;
        set(keys::TAGS, tags);
    }
    if !run.deferred_actions.is_empty() {
        set(keys::ARCHIVE_ACTIONS, encode_actions(&run.deferred_actions)?);
    }
    Ok(out)
}
