//! Scheduler: assigns queued runs to worker pods
//!
//! Each pass claims queued runs one at a time, oldest first, until the
//! active worker count reaches `max_engines`. A claim is a single
//! compare-and-swap of the run status from `queued` to `allocated`, so when
//! several replicas race for the same run exactly one of them launches it.

pub mod launch;
pub mod pod_spec;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use engine_common::run::RESULT_ENV_FAIL;
use engine_common::{metrics, Clock, Run, RunRepository};
use engine_kube::pods::active_pods;
use engine_kube::ClusterFacade;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::settings::Settings;

pub use launch::{AttemptResult, LaunchState, LaunchStep, RetryReason};
pub use pod_spec::{WorkerEnvironment, WorkerPodTemplate};

/// How long an allocated run may wait for its worker to start
pub const ALLOCATION_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Pause before retrying a pod create that failed for a reason other than a
/// name collision
pub const CREATE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Result of allocating and launching a single run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// A worker pod was created under this name
    Launched(String),
    /// Another replica claimed the run first
    AllocatedElsewhere,
    /// No pod could be created; the run was marked EnvFail
    Failed,
}

/// Moves queued runs onto worker pods
pub struct Scheduler {
    facade: Arc<dyn ClusterFacade>,
    runs: Arc<dyn RunRepository>,
    clock: Arc<dyn Clock>,
    settings: watch::Receiver<Arc<Settings>>,
    controller_id: String,
    environment: WorkerEnvironment,
}

impl Scheduler {
    /// Create a scheduler identified in the run store as `controller_id`
    pub fn new(
        facade: Arc<dyn ClusterFacade>,
        runs: Arc<dyn RunRepository>,
        clock: Arc<dyn Clock>,
        settings: watch::Receiver<Arc<Settings>>,
        controller_id: impl Into<String>,
        environment: WorkerEnvironment,
    ) -> Self {
        Self {
            facade,
            runs,
            clock,
            settings,
            controller_id: controller_id.into(),
            environment,
        }
    }

    /// One periodic pass; errors abandon the pass and are logged
    pub async fn tick(&self) {
        match self.schedule().await {
            Ok(0) => debug!("Scheduling pass launched no runs"),
            Ok(launched) => info!(launched, "Scheduling pass complete"),
            Err(e) => error!(error = %e, "Scheduling pass failed"),
        }
    }

    /// Launch as many queued runs as capacity allows. Returns the number of
    /// worker pods created.
    ///
    /// A run that cannot be claimed or launched is logged and skipped; only a
    /// failure to read the queue or list worker pods abandons the pass.
    pub async fn schedule(&self) -> Result<usize> {
        if !self.facade.dependencies_ready().await {
            warn!("Store or archive not ready, skipping scheduling pass");
            return Ok(0);
        }

        let settings = self.settings.borrow().clone();

        let mut queue: Vec<Run> = self
            .runs
            .queued_runs()
            .await?
            .into_iter()
            .filter(|run| !run.local && run.interrupt_reason.is_none())
            .collect();
        queue.sort_by_key(|run| (run.queued.is_none(), run.queued));
        let mut queue = VecDeque::from(queue);

        let mut launched = 0;
        while let Some(run) = queue.pop_front() {
            let pods = self.facade.list_worker_pods(&settings.engine_label).await?;
            let active = active_pods(&pods).len();
            if active >= settings.max_engines as usize {
                info!(
                    active,
                    max_engines = settings.max_engines,
                    waiting = queue.len() + 1,
                    "Worker capacity reached"
                );
                break;
            }

            match self.allocate_and_launch(&settings, &run).await {
                Ok(LaunchOutcome::Launched(_)) => launched += 1,
                Ok(_) => {}
                Err(e) => error!(run = %run.name, error = %e, "Failed to launch run, skipping"),
            }

            if !queue.is_empty() {
                self.clock.sleep(settings.launch_interval).await;
            }
        }
        Ok(launched)
    }

    /// Claim `run` for this controller and create its worker pod
    pub async fn allocate_and_launch(
        &self,
        settings: &Settings,
        run: &Run,
    ) -> Result<LaunchOutcome> {
        let claimed = self
            .runs
            .allocate(&run.name, &self.controller_id, ALLOCATION_TIMEOUT)
            .await?;
        if !claimed {
            info!(run = %run.name, "Run allocated by another controller");
            return Ok(LaunchOutcome::AllocatedElsewhere);
        }
        info!(run = %run.name, controller = %self.controller_id, "Allocated run");

        let template = WorkerPodTemplate::build(settings, &run.name, run.trace, &self.environment);
        let mut state = LaunchState::new(template.base_name(), settings.max_launch_attempts);

        while !state.exhausted() {
            let pod = template.pod_named(state.pod_name());
            let result = self.facade.create_pod(&pod).await;
            match state.record(AttemptResult::from(&result)) {
                LaunchStep::Launched(name) => {
                    metrics::record_submitted();
                    info!(run = %run.name, pod = %name, "Worker pod started");
                    return Ok(LaunchOutcome::Launched(name));
                }
                LaunchStep::Retry(RetryReason::NameConflict) => {
                    info!(
                        run = %run.name,
                        next = %state.pod_name(),
                        "Worker pod name taken, trying new name"
                    );
                }
                LaunchStep::Retry(RetryReason::Transient(reason)) => {
                    warn!(
                        run = %run.name,
                        pod = %state.pod_name(),
                        attempt = state.attempts(),
                        error = %reason,
                        "Failed to create worker pod, retrying"
                    );
                    self.clock.sleep(CREATE_RETRY_DELAY).await;
                }
                LaunchStep::GiveUp => break,
            }
        }

        error!(
            run = %run.name,
            attempts = state.attempts(),
            "Worker pod could not be started, giving up"
        );
        self.runs.mark_finished(&run.name, RESULT_ENV_FAIL).await?;
        metrics::record_launch_failure();
        Ok(LaunchOutcome::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{pod_with_phase, Fixture, MockFacade};
    use engine_common::RunStatus;
    use engine_kube::ClusterError;
    use k8s_openapi::api::core::v1::Pod;
    use std::sync::Mutex;

    /// Records the names of pods the scheduler tried to create
    #[derive(Clone, Default)]
    struct CreatedPods(Arc<Mutex<Vec<String>>>);

    impl CreatedPods {
        fn push(&self, pod: &Pod) {
            self.0
                .lock()
                .unwrap()
                .push(pod.metadata.name.clone().unwrap_or_default());
        }

        fn names(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    fn settings(max_engines: u32, attempts: u32) -> Settings {
        Settings {
            max_engines,
            max_launch_attempts: attempts,
            ..Settings::default()
        }
    }

    mod allocation {
        use super::*;

        #[tokio::test]
        async fn conflict_on_first_name_launches_suffixed_pod() {
            let fx = Fixture::new(settings(1, 5));
            fx.queue("U1", 0).await;
            let created = CreatedPods::default();

            let mut facade = MockFacade::new();
            let log = created.clone();
            facade.expect_create_pod().returning(move |pod| {
                log.push(pod);
                if log.names().len() == 1 {
                    Err(ClusterError::AlreadyExists {
                        name: pod.metadata.name.clone().unwrap_or_default(),
                    })
                } else {
                    Ok(pod.clone())
                }
            });
            let scheduler = fx.scheduler(facade);

            let run = fx.run("U1").await;
            let outcome = scheduler
                .allocate_and_launch(&fx.settings(), &run)
                .await
                .unwrap();

            assert_eq!(
                outcome,
                LaunchOutcome::Launched("k8s-standard-engine-u1-1".to_string())
            );
            assert_eq!(
                created.names(),
                vec!["k8s-standard-engine-u1", "k8s-standard-engine-u1-1"]
            );
            assert!(fx.clock.sleeps().is_empty());
            assert_eq!(fx.run("U1").await.status, RunStatus::Allocated);
        }

        #[tokio::test]
        async fn exhausted_attempts_mark_env_fail() {
            let fx = Fixture::new(settings(1, 5));
            fx.queue("U1", 0).await;
            let created = CreatedPods::default();

            let mut facade = MockFacade::new();
            let log = created.clone();
            facade.expect_create_pod().times(5).returning(move |pod| {
                log.push(pod);
                Err(ClusterError::AlreadyExists {
                    name: pod.metadata.name.clone().unwrap_or_default(),
                })
            });
            let scheduler = fx.scheduler(facade);

            let run = fx.run("U1").await;
            let outcome = scheduler
                .allocate_and_launch(&fx.settings(), &run)
                .await
                .unwrap();

            assert_eq!(outcome, LaunchOutcome::Failed);
            assert_eq!(created.names().len(), 5);
            let run = fx.run("U1").await;
            assert_eq!(run.status, RunStatus::Finished);
            assert_eq!(run.result.as_deref(), Some(RESULT_ENV_FAIL));
            assert!(run.finished.is_some());
        }

        #[tokio::test]
        async fn transient_failures_back_off_via_clock() {
            let fx = Fixture::new(settings(1, 3));
            fx.queue("U1", 0).await;

            let mut facade = MockFacade::new();
            let mut calls = 0;
            facade.expect_create_pod().times(2).returning(move |pod| {
                calls += 1;
                if calls == 1 {
                    Err(ClusterError::NotFound {
                        kind: "Namespace".to_string(),
                        name: "galasa".to_string(),
                    })
                } else {
                    Ok(pod.clone())
                }
            });
            let scheduler = fx.scheduler(facade);

            let run = fx.run("U1").await;
            let outcome = scheduler
                .allocate_and_launch(&fx.settings(), &run)
                .await
                .unwrap();
            assert_eq!(
                outcome,
                LaunchOutcome::Launched("k8s-standard-engine-u1".to_string())
            );
            assert_eq!(fx.clock.sleeps(), vec![CREATE_RETRY_DELAY]);
        }

        #[tokio::test]
        async fn lost_claim_creates_nothing() {
            let fx = Fixture::new(settings(1, 5));
            fx.queue("U1", 0).await;
            let run = fx.run("U1").await;
            assert!(fx
                .repo
                .allocate("U1", "other-controller", ALLOCATION_TIMEOUT)
                .await
                .unwrap());

            let mut facade = MockFacade::new();
            facade.expect_create_pod().never();
            let scheduler = fx.scheduler(facade);

            let outcome = scheduler
                .allocate_and_launch(&fx.settings(), &run)
                .await
                .unwrap();
            assert_eq!(outcome, LaunchOutcome::AllocatedElsewhere);
        }

        #[tokio::test]
        async fn racing_replicas_launch_once() {
            let fx = Fixture::new(settings(1, 5));
            fx.queue("U1", 0).await;
            let run = fx.run("U1").await;
            let created = CreatedPods::default();

            let mut tasks = Vec::new();
            for replica in 0..8 {
                let mut facade = MockFacade::new();
                let log = created.clone();
                facade.expect_create_pod().returning(move |pod| {
                    log.push(pod);
                    Ok(pod.clone())
                });
                let scheduler = fx.scheduler_as(facade, &format!("controller-{replica}"));
                let settings = fx.settings();
                let run = run.clone();
                tasks.push(tokio::spawn(async move {
                    scheduler.allocate_and_launch(&settings, &run).await.unwrap()
                }));
            }

            let outcomes: Vec<LaunchOutcome> = futures::future::join_all(tasks)
                .await
                .into_iter()
                .map(|r| r.unwrap())
                .collect();
            let launched = outcomes
                .iter()
                .filter(|o| matches!(o, LaunchOutcome::Launched(_)))
                .count();
            assert_eq!(launched, 1);
            assert_eq!(created.names().len(), 1);
        }
    }

    mod passes {
        use super::*;

        #[tokio::test]
        async fn not_ready_dependencies_skip_the_pass() {
            let fx = Fixture::new(settings(2, 5));
            fx.queue("U1", 0).await;

            let mut facade = MockFacade::new();
            facade.expect_dependencies_ready().returning(|| false);
            facade.expect_list_worker_pods().never();
            facade.expect_create_pod().never();
            let scheduler = fx.scheduler(facade);

            assert_eq!(scheduler.schedule().await.unwrap(), 0);
            assert_eq!(fx.run("U1").await.status, RunStatus::Queued);
        }

        #[tokio::test]
        async fn launches_oldest_first_until_capacity() {
            let fx = Fixture::new(settings(2, 5));
            fx.queue("U3", 30).await;
            fx.queue("U1", 10).await;
            fx.queue("U2", 20).await;
            let created = CreatedPods::default();

            let mut facade = MockFacade::new();
            facade.expect_dependencies_ready().returning(|| true);
            let listed = created.clone();
            facade.expect_list_worker_pods().returning(move |_| {
                Ok(listed
                    .names()
                    .iter()
                    .map(|name| pod_with_phase(name, Some("Running"), None))
                    .collect())
            });
            let log = created.clone();
            facade.expect_create_pod().returning(move |pod| {
                log.push(pod);
                Ok(pod.clone())
            });
            let scheduler = fx.scheduler(facade);

            assert_eq!(scheduler.schedule().await.unwrap(), 2);
            assert_eq!(
                created.names(),
                vec!["k8s-standard-engine-u1", "k8s-standard-engine-u2"]
            );
            assert_eq!(fx.run("U3").await.status, RunStatus::Queued);
            assert_eq!(fx.clock.sleeps(), vec![Settings::default().launch_interval; 2]);
        }

        #[tokio::test]
        async fn local_and_interrupted_runs_are_skipped() {
            let fx = Fixture::new(settings(5, 5));
            let mut local = fx.queued_run("L1", 0);
            local.local = true;
            fx.save(&local).await;
            let mut interrupted = fx.queued_run("U1", 1);
            interrupted.interrupt_reason = Some(engine_common::InterruptReason::Cancelled);
            fx.save(&interrupted).await;

            let mut facade = MockFacade::new();
            facade.expect_dependencies_ready().returning(|| true);
            facade.expect_list_worker_pods().never();
            facade.expect_create_pod().never();
            let scheduler = fx.scheduler(facade);

            assert_eq!(scheduler.schedule().await.unwrap(), 0);
        }

        #[tokio::test]
        async fn terminated_pods_do_not_count_against_capacity() {
            let fx = Fixture::new(settings(1, 5));
            fx.queue("U1", 0).await;

            let mut facade = MockFacade::new();
            facade.expect_dependencies_ready().returning(|| true);
            facade.expect_list_worker_pods().returning(|_| {
                Ok(vec![
                    pod_with_phase("old-a", Some("Succeeded"), Some("U0")),
                    pod_with_phase("old-b", Some("Failed"), Some("U9")),
                ])
            });
            facade
                .expect_create_pod()
                .times(1)
                .returning(|pod| Ok(pod.clone()));
            let scheduler = fx.scheduler(facade);

            assert_eq!(scheduler.schedule().await.unwrap(), 1);
            assert!(fx.clock.sleeps().is_empty());
        }

        #[tokio::test]
        async fn store_failure_on_one_run_does_not_stop_the_pass() {
            let fx = Fixture::new(settings(5, 5));
            fx.queue("U1", 0).await;
            fx.queue("U2", 1).await;
            fx.faults.fail_cas_on("run.U1.status");
            let created = CreatedPods::default();

            let mut facade = MockFacade::new();
            facade.expect_dependencies_ready().returning(|| true);
            facade.expect_list_worker_pods().returning(|_| Ok(Vec::new()));
            let log = created.clone();
            facade.expect_create_pod().returning(move |pod| {
                log.push(pod);
                Ok(pod.clone())
            });
            let scheduler = fx.scheduler(facade);

            assert_eq!(scheduler.schedule().await.unwrap(), 1);
            assert_eq!(created.names(), vec!["k8s-standard-engine-u2"]);
            assert_eq!(fx.run("U1").await.status, RunStatus::Queued);
            assert_eq!(fx.run("U2").await.status, RunStatus::Allocated);
        }

        #[tokio::test]
        async fn list_failure_abandons_pass() {
            let fx = Fixture::new(settings(1, 5));
            fx.queue("U1", 0).await;

            let mut facade = MockFacade::new();
            facade.expect_dependencies_ready().returning(|| true);
            facade.expect_list_worker_pods().returning(|_| {
                Err(ClusterError::NotFound {
                    kind: "Namespace".to_string(),
                    name: "galasa".to_string(),
                })
            });
            facade.expect_create_pod().never();
            let scheduler = fx.scheduler(facade);

            assert!(scheduler.schedule().await.is_err());
            scheduler.tick().await;
            assert_eq!(fx.run("U1").await.status, RunStatus::Queued);
        }
    }
}
