//! Injectable time source
//!
//! Wall-clock time (for grace periods and timestamps) and deliberate sleeps
//! (launch interval, pod-create backoff) both go through [`Clock`] so tests
//! can run without real delays.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Source of wall-clock time and delays
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;

    /// Wait for the given duration
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by the system time and tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock: sleeping advances time instantly and is recorded
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    now: DateTime<Utc>,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now,
                sleeps: Vec::new(),
            }),
        }
    }

    /// Move time forward without recording a sleep
    pub fn advance(&self, by: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        }
    }

    /// Every sleep requested so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state
            .lock()
            .map(|s| s.sleeps.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.state.lock() {
            Ok(state) => state.now,
            Err(poisoned) => poisoned.into_inner().now,
        }
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.sleeps.push(duration);
            state.now += chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        }
    }
}
