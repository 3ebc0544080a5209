//! Interrupt event built fresh from the run store on every pass

use chrono::{DateTime, Utc};
use engine_common::{DeferredArchiveAction, InterruptReason, Run, RunStatus};

/// A run that was asked to stop, as seen at collection time
#[derive(Debug, Clone, PartialEq)]
pub struct RunInterruptEvent {
    /// Run name
    pub run_name: String,
    /// Why the run was interrupted
    pub reason: InterruptReason,
    /// When the interrupt was requested, if recorded
    pub interrupted_at: Option<DateTime<Utc>>,
    /// Archive updates to apply while processing
    pub deferred_actions: Vec<DeferredArchiveAction>,
    /// Lifecycle status when collected
    pub status: RunStatus,
    /// The grace period after `interrupted_at` has elapsed
    pub past_grace_period: bool,
}

impl RunInterruptEvent {
    /// Build an event for an interrupted run; `None` if the run has no
    /// interrupt reason
    pub fn from_run(run: &Run, past_grace_period: bool) -> Option<Self> {
        let reason = run.interrupt_reason.clone()?;
        Some(Self {
            run_name: run.name.clone(),
            reason,
            interrupted_at: run.interrupted_at,
            deferred_actions: run.deferred_actions.clone(),
            status: run.status,
            past_grace_period,
        })
    }
}
