//! Shared fixtures for controller tests

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use engine_common::archive::ArchiveResult;
use engine_common::store::StoreResult;
use engine_common::{
    ArchiveError, ManualClock, MemoryArchive, MemoryStatusStore, ResultArchive, Run,
    RunRepository, StatusStore, StoreError, StoreRunRepository, TestStructure, UpdateOutcome,
};
use engine_kube::{ClusterError, ClusterFacade, RUN_LABEL};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use mockall::mock;
use tokio::sync::watch;

use crate::scheduler::{Scheduler, WorkerEnvironment};
use crate::settings::Settings;

mock! {
    pub Facade {}

    #[async_trait::async_trait]
    impl ClusterFacade for Facade {
        async fn list_worker_pods(&self, engine_label: &str) -> Result<Vec<Pod>, ClusterError>;
        async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError>;
        async fn delete_pod(&self, name: &str) -> Result<(), ClusterError>;
        async fn get_worker_pod(&self, run_name: &str) -> Result<Option<Pod>, ClusterError>;
        async fn dependencies_ready(&self) -> bool;
        async fn get_config_map(&self, name: &str) -> Result<ConfigMap, ClusterError>;
    }
}

/// Fixed "now" for every fixture clock
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// A pod with the given phase and optional run label
pub fn pod_with_phase(name: &str, phase: Option<&str>, run: Option<&str>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: run.map(|r| BTreeMap::from([(RUN_LABEL.to_string(), r.to_string())])),
            ..Default::default()
        },
        status: phase.map(|p| PodStatus {
            phase: Some(p.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Failure switches for [`FaultyStore`] and [`FaultyArchive`]
#[derive(Default)]
pub struct Faults {
    cas_keys: Mutex<BTreeSet<String>>,
    archive_down: AtomicBool,
}

impl Faults {
    /// Make every compare-and-swap on `key` fail with a backend error
    pub fn fail_cas_on(&self, key: &str) {
        self.cas_keys.lock().unwrap().insert(key.to_string());
    }

    /// Make every archive call fail
    pub fn set_archive_down(&self, down: bool) {
        self.archive_down.store(down, Ordering::SeqCst);
    }

    fn archive_check(&self) -> ArchiveResult<()> {
        if self.archive_down.load(Ordering::SeqCst) {
            return Err(ArchiveError::Status {
                status: 503,
                context: "archive unavailable".to_string(),
            });
        }
        Ok(())
    }
}

/// Memory store that fails selected operations
pub struct FaultyStore {
    inner: Arc<MemoryStatusStore>,
    faults: Arc<Faults>,
}

#[async_trait]
impl StatusStore for FaultyStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<BTreeMap<String, String>> {
        self.inner.get_prefix(prefix).await
    }

    async fn put(&self, key: &str, value: &str) -> StoreResult<()> {
        self.inner.put(key, value).await
    }

    async fn put_all(&self, values: BTreeMap<String, String>) -> StoreResult<()> {
        self.inner.put_all(values).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
        extra: BTreeMap<String, String>,
    ) -> StoreResult<bool> {
        if self.faults.cas_keys.lock().unwrap().contains(key) {
            return Err(StoreError::backend(format!("injected failure on {key}")));
        }
        self.inner
            .compare_and_swap(key, expected, new_value, extra)
            .await
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        self.inner.delete(keys).await
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<()> {
        self.inner.delete_prefix(prefix).await
    }
}

/// Memory archive that can be switched off
pub struct FaultyArchive {
    inner: Arc<MemoryArchive>,
    faults: Arc<Faults>,
}

#[async_trait]
impl ResultArchive for FaultyArchive {
    async fn create_record(
        &self,
        previous_id: &str,
        structure: &TestStructure,
    ) -> ArchiveResult<String> {
        self.faults.archive_check()?;
        self.inner.create_record(previous_id, structure).await
    }

    async fn update_status(
        &self,
        record_id: &str,
        status: &str,
        result: &str,
    ) -> ArchiveResult<UpdateOutcome> {
        self.faults.archive_check()?;
        self.inner.update_status(record_id, status, result).await
    }
}

/// In-memory store, archive and clock wired to a run repository
pub struct Fixture {
    pub store: Arc<MemoryStatusStore>,
    pub archive: Arc<MemoryArchive>,
    pub faults: Arc<Faults>,
    pub clock: Arc<ManualClock>,
    pub repo: Arc<StoreRunRepository>,
    pub settings_tx: watch::Sender<Arc<Settings>>,
}

impl Fixture {
    pub fn new(settings: Settings) -> Self {
        let store = Arc::new(MemoryStatusStore::new());
        let faults = Arc::new(Faults::default());
        let clock = Arc::new(ManualClock::new(epoch()));
        let faulty = Arc::new(FaultyStore {
            inner: store.clone(),
            faults: faults.clone(),
        });
        let repo = Arc::new(StoreRunRepository::new(faulty, clock.clone()));
        let (settings_tx, _) = watch::channel(Arc::new(settings));
        Self {
            store,
            archive: Arc::new(MemoryArchive::new()),
            faults,
            clock,
            repo,
            settings_tx,
        }
    }

    /// The archive as the controller sees it, subject to [`Faults`]
    pub fn result_archive(&self) -> Arc<dyn ResultArchive> {
        Arc::new(FaultyArchive {
            inner: self.archive.clone(),
            faults: self.faults.clone(),
        })
    }

    pub fn settings(&self) -> Settings {
        (**self.settings_tx.borrow()).clone()
    }

    pub fn settings_rx(&self) -> watch::Receiver<Arc<Settings>> {
        self.settings_tx.subscribe()
    }

    /// A queued run, queued `minute` minutes after the epoch hour began
    pub fn queued_run(&self, name: &str, minute: i64) -> Run {
        Run::queued(name, epoch() + chrono::Duration::minutes(minute))
    }

    pub async fn save(&self, run: &Run) {
        self.repo.save(run).await.unwrap();
    }

    pub async fn queue(&self, name: &str, minute: i64) {
        self.save(&self.queued_run(name, minute)).await;
    }

    pub async fn run(&self, name: &str) -> Run {
        self.repo.get_run(name).await.unwrap().unwrap()
    }

    pub fn scheduler(&self, facade: MockFacade) -> Scheduler {
        self.scheduler_as(facade, "controller-0")
    }

    pub fn scheduler_as(&self, facade: MockFacade, controller_id: &str) -> Scheduler {
        Scheduler::new(
            Arc::new(facade),
            self.repo.clone(),
            self.clock.clone(),
            self.settings_rx(),
            controller_id,
            WorkerEnvironment::default(),
        )
    }
}
