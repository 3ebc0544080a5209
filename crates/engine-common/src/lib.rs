//! Shared types for the engine controller: run model, store and archive
//! ports, time source, telemetry and metrics

#![deny(missing_docs)]

pub mod archive;
pub mod clock;
pub mod error;
pub mod etcd;
pub mod metrics;
pub mod run;
pub mod runs;
pub mod store;
pub mod telemetry;

pub use archive::{CouchArchive, MemoryArchive, ResultArchive, UpdateOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ArchiveError, Error, StoreError};
pub use etcd::EtcdStatusStore;
pub use run::{DeferredArchiveAction, InterruptReason, Run, RunStatus, TestStructure};
pub use runs::{RunRepository, StoreRunRepository};
pub use store::{MemoryStatusStore, StatusStore};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
