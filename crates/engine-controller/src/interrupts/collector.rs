//! Finds interrupted runs that are ready to be processed

use std::sync::Arc;

use chrono::{DateTime, Utc};
use engine_common::{Clock, Run, RunRepository, RunStatus};
use engine_kube::ClusterFacade;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::Result;
use crate::settings::Settings;

use super::event::RunInterruptEvent;

/// Scans the run store for interrupt requests
pub struct InterruptCollector {
    facade: Arc<dyn ClusterFacade>,
    runs: Arc<dyn RunRepository>,
    clock: Arc<dyn Clock>,
    settings: watch::Receiver<Arc<Settings>>,
}

impl InterruptCollector {
    /// Create a collector
    pub fn new(
        facade: Arc<dyn ClusterFacade>,
        runs: Arc<dyn RunRepository>,
        clock: Arc<dyn Clock>,
        settings: watch::Receiver<Arc<Settings>>,
    ) -> Self {
        Self {
            facade,
            runs,
            clock,
            settings,
        }
    }

    /// Events for every unfinished interrupted run that may be processed
    /// now. Calling this repeatedly without processing yields the same set.
    pub async fn collect(&self) -> Result<Vec<RunInterruptEvent>> {
        if !self.facade.dependencies_ready().await {
            warn!("Store or archive not ready, not collecting interrupts");
            return Ok(Vec::new());
        }

        let grace = self.settings.borrow().interrupt_grace_period;
        // Out of range means the grace period never ends
        let grace = chrono::Duration::from_std(grace).ok();
        let now = self.clock.now();

        let events = self
            .runs
            .all_runs()
            .await?
            .iter()
            .filter(|run| run.status != RunStatus::Finished)
            .filter_map(|run| eligible_event(run, now, grace))
            .collect::<Vec<_>>();

        debug!(count = events.len(), "Collected interrupt events");
        Ok(events)
    }
}

fn eligible_event(
    run: &Run,
    now: DateTime<Utc>,
    grace: Option<chrono::Duration>,
) -> Option<RunInterruptEvent> {
    run.interrupt_reason.as_ref()?;

    let past_grace_period = run
        .interrupted_at
        .zip(grace)
        .and_then(|(at, grace)| at.checked_add_signed(grace))
        .is_some_and(|deadline| now > deadline);
    let eligible = run.status == RunStatus::Queued
        || run.interrupted_at.is_none()
        || past_grace_period;

    if !eligible {
        debug!(run = %run.name, "Interrupted run still within grace period");
        return None;
    }
    RunInterruptEvent::from_run(run, past_grace_period)
}
