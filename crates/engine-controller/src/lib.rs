//! Engine controller: assigns queued test runs to worker pods, processes run
//! interrupts and cleans up after terminated workers
//!
//! Several replicas may run against the same run store. They coordinate only
//! through the store's compare-and-swap, so each task here is safe to run
//! concurrently with the same task in another replica.

#![deny(missing_docs)]

pub mod cleanup;
pub mod error;
pub mod heartbeat;
pub mod interrupts;
pub mod runner;
pub mod scheduler;
pub mod settings;

#[cfg(test)]
mod test_support;

pub use cleanup::PodCleanup;
pub use error::{ControllerError, Result};
pub use heartbeat::Heartbeat;
pub use interrupts::{InterruptCollector, InterruptHandler, InterruptProcessor};
pub use runner::Controller;
pub use scheduler::{Scheduler, WorkerEnvironment};
pub use settings::{Settings, SettingsManager};
