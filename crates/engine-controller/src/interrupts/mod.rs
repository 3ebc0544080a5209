//! Interrupt handling
//!
//! A run is interrupted by writing an interrupt reason (and usually a
//! timestamp) to the run store. Each pass the collector builds an event for
//! every unfinished interrupted run whose worker has had the grace period to
//! stop by itself, and the processor acts on those events. Events are never
//! cached between passes, so a pass that fails part way is simply repeated.

mod collector;
mod event;
mod handler;
mod processor;

pub use collector::InterruptCollector;
pub use event::RunInterruptEvent;
pub use handler::InterruptHandler;
pub use processor::InterruptProcessor;
