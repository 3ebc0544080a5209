//! Applies interrupt events: stops workers, replays archive updates and moves
//! each run to its final or requeued state

use std::sync::Arc;

use engine_common::{
    metrics, Error, InterruptReason, ResultArchive, Run, RunRepository, RunStatus,
};
use engine_kube::ClusterFacade;
use tracing::{debug, error, info, warn};

use crate::error::Result;

use super::event::RunInterruptEvent;

/// Processes a batch of interrupt events
pub struct InterruptProcessor {
    facade: Arc<dyn ClusterFacade>,
    runs: Arc<dyn RunRepository>,
    archive: Arc<dyn ResultArchive>,
}

impl InterruptProcessor {
    /// Create a processor
    pub fn new(
        facade: Arc<dyn ClusterFacade>,
        runs: Arc<dyn RunRepository>,
        archive: Arc<dyn ResultArchive>,
    ) -> Self {
        Self {
            facade,
            runs,
            archive,
        }
    }

    /// Process events in order. Returns how many runs were moved to their
    /// final or requeued state.
    ///
    /// A queued run is first moved to `cancelling`; if that conditional write
    /// loses (the scheduler allocated the run in between), the rest of the
    /// batch is left for the next pass. Any other per-event failure is logged
    /// and the batch continues.
    pub async fn process(&self, events: &[RunInterruptEvent]) -> usize {
        if events.is_empty() {
            return 0;
        }
        if !self.facade.dependencies_ready().await {
            warn!("Store or archive not ready, not processing interrupts");
            return 0;
        }

        let mut handled = 0;
        for event in events {
            if event.status == RunStatus::Queued {
                match self
                    .runs
                    .mark_cancelling(&event.run_name, RunStatus::Queued)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(
                            run = %event.run_name,
                            "Run left the queue before it could be cancelled, retrying next pass"
                        );
                        break;
                    }
                    Err(e) => {
                        error!(run = %event.run_name, error = %e, "Failed to mark run cancelling");
                        break;
                    }
                }
            }

            match self.process_event(event).await {
                Ok(true) => {
                    metrics::record_interrupt(event.reason.as_str());
                    handled += 1;
                }
                Ok(false) => {}
                Err(e) => error!(
                    run = %event.run_name,
                    reason = %event.reason.as_str(),
                    error = %e,
                    "Failed to process interrupt"
                ),
            }
        }
        handled
    }

    /// Returns whether the run was transitioned
    async fn process_event(&self, event: &RunInterruptEvent) -> Result<bool> {
        let name = &event.run_name;
        info!(
            run = %name,
            reason = %event.reason.as_str(),
            status = %event.status,
            past_grace_period = event.past_grace_period,
            "Processing interrupt"
        );

        if event.status.may_have_worker() {
            self.delete_worker(name).await;
        }

        for action in &event.deferred_actions {
            self.archive.replay_deferred_action(name, action).await?;
        }

        match &event.reason {
            InterruptReason::Cancelled | InterruptReason::Hung => {
                let finished = self.runs.mark_finished(name, event.reason.as_str()).await?;
                if !finished {
                    debug!(run = %name, "Run disappeared before it could be finished");
                }
                Ok(finished)
            }
            InterruptReason::Requeued => self.requeue(name).await,
            InterruptReason::Other(reason) => {
                warn!(run = %name, reason = %reason, "Unknown interrupt reason, leaving run as is");
                Ok(false)
            }
        }
    }

    async fn delete_worker(&self, name: &str) {
        let pod = match self.facade.get_worker_pod(name).await {
            Ok(Some(pod)) => pod,
            Ok(None) => {
                debug!(run = %name, "No worker pod to delete");
                return;
            }
            Err(e) => {
                warn!(run = %name, error = %e, "Failed to look up worker pod");
                return;
            }
        };
        let Some(pod_name) = pod.metadata.name.as_deref() else {
            return;
        };
        match self.facade.delete_pod(pod_name).await {
            Ok(()) => info!(run = %name, pod = %pod_name, "Deleted worker pod"),
            Err(e) => warn!(
                run = %name,
                pod = %pod_name,
                error = %e,
                "Failed to delete worker pod"
            ),
        }
    }

    /// Return the run to the queue under a fresh archive record.
    ///
    /// The record is created before the run is touched, and the new id is
    /// written in the same store write that requeues the run. If either step
    /// fails the run keeps its interrupt reason and is retried next pass.
    async fn requeue(&self, name: &str) -> Result<bool> {
        let run = self
            .runs
            .get_run(name)
            .await?
            .ok_or_else(|| Error::RunNotFound(name.to_string()))?;
        if run.local {
            info!(run = %name, "Local run is not requeued");
            return Ok(false);
        }

        let record = match run.archive_id.as_deref() {
            Some(previous) => {
                let requeued = Run {
                    status: RunStatus::Queued,
                    heartbeat: None,
                    interrupt_reason: None,
                    interrupted_at: None,
                    ..run.clone()
                };
                Some(
                    self.archive
                        .create_record(previous, &requeued.to_test_structure())
                        .await?,
                )
            }
            None => None,
        };

        if !self.runs.reset(name, record.as_deref()).await? {
            return Ok(false);
        }
        info!(
            run = %name,
            previous = ?run.archive_id,
            record = ?record,
            "Requeued run"
        );
        Ok(true)
    }
}
