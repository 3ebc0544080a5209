//! Periodic task runner
//!
//! Every replica runs five independent loops: settings refresh, heartbeat,
//! scheduling, interrupt handling and pod cleanup. Scheduling and cleanup follow the
//! `run_poll` setting and are rescheduled when it changes. All loops stop at
//! the next tick boundary once the shared cancellation token fires; a pass
//! that is already running is allowed to finish.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cleanup::PodCleanup;
use crate::heartbeat::{Heartbeat, HEARTBEAT_PERIOD};
use crate::interrupts::InterruptHandler;
use crate::scheduler::Scheduler;
use crate::settings::{Settings, SettingsManager};

/// Time between settings reloads
pub const SETTINGS_REFRESH_PERIOD: Duration = Duration::from_secs(20);

/// Time between interrupt passes
pub const INTERRUPT_PERIOD: Duration = Duration::from_secs(5);

/// Delay before the first scheduling pass, and after every reschedule
pub const SCHEDULER_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// A zero period would make the interval spin
const MIN_POLL_PERIOD: Duration = Duration::from_secs(1);

/// Effective period for the poll-driven tasks
pub fn poll_period(settings: &Settings) -> Duration {
    settings.run_poll.max(MIN_POLL_PERIOD)
}

fn fixed_delay_interval(initial_delay: Duration, period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + initial_delay, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Run `task` after `initial_delay` and then every `period` until `cancel`
/// fires
pub async fn run_every<F, Fut>(
    name: &'static str,
    initial_delay: Duration,
    period: Duration,
    cancel: CancellationToken,
    mut task: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    info!(task = name, period_secs = period.as_secs(), "Starting periodic task");
    let mut interval = fixed_delay_interval(initial_delay, period);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => task().await,
        }
    }
    info!(task = name, "Periodic task stopped");
}

/// Like [`run_every`], with the period taken from the `run_poll` setting.
/// When the setting changes the schedule restarts with the new period.
pub async fn run_on_poll<F, Fut>(
    name: &'static str,
    initial_delay: Duration,
    mut settings: watch::Receiver<Arc<Settings>>,
    cancel: CancellationToken,
    mut task: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut period = poll_period(&settings.borrow_and_update());
    info!(task = name, period_secs = period.as_secs(), "Starting periodic task");
    let mut interval = fixed_delay_interval(initial_delay, period);
    let mut watching = true;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = settings.changed(), if watching => {
                if changed.is_err() {
                    // Settings publisher is gone; keep the current period
                    watching = false;
                } else {
                    let next = poll_period(&settings.borrow_and_update());
                    if next != period {
                        info!(
                            task = name,
                            old_secs = period.as_secs(),
                            new_secs = next.as_secs(),
                            "Rescheduling periodic task"
                        );
                        period = next;
                        interval = fixed_delay_interval(initial_delay, period);
                    }
                }
            }
            _ = interval.tick() => task().await,
        }
    }
    info!(task = name, "Periodic task stopped");
}

/// The controller's periodic tasks, wired together
pub struct Controller {
    settings: Arc<SettingsManager>,
    heartbeat: Heartbeat,
    scheduler: Scheduler,
    interrupts: InterruptHandler,
    cleanup: PodCleanup,
}

impl Controller {
    /// Bundle the tasks; `settings` must be the manager the other tasks
    /// subscribed to
    pub fn new(
        settings: Arc<SettingsManager>,
        heartbeat: Heartbeat,
        scheduler: Scheduler,
        interrupts: InterruptHandler,
        cleanup: PodCleanup,
    ) -> Self {
        Self {
            settings,
            heartbeat,
            scheduler,
            interrupts,
            cleanup,
        }
    }

    /// Run every task until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        let settings = &*self.settings;
        let heartbeat = &self.heartbeat;
        let scheduler = &self.scheduler;
        let interrupts = &self.interrupts;
        let cleanup = &self.cleanup;

        tokio::join!(
            run_every(
                "settings-refresh",
                SETTINGS_REFRESH_PERIOD,
                SETTINGS_REFRESH_PERIOD,
                cancel.clone(),
                move || settings.refresh(),
            ),
            run_every(
                "heartbeat",
                Duration::ZERO,
                HEARTBEAT_PERIOD,
                cancel.clone(),
                move || heartbeat.tick(),
            ),
            run_on_poll(
                "scheduler",
                SCHEDULER_INITIAL_DELAY,
                settings.subscribe(),
                cancel.clone(),
                move || scheduler.tick(),
            ),
            run_every(
                "interrupt-handler",
                Duration::ZERO,
                INTERRUPT_PERIOD,
                cancel.clone(),
                move || async move {
                    interrupts.tick().await;
                },
            ),
            run_on_poll(
                "pod-cleanup",
                Duration::ZERO,
                settings.subscribe(),
                cancel.clone(),
                move || cleanup.tick(),
            ),
        );
        info!("All controller tasks stopped");
    }
}
