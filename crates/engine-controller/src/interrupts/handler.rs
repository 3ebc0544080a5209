//! Periodic collect-then-process pass over interrupted runs

use tracing::{debug, error};

use super::collector::InterruptCollector;
use super::processor::InterruptProcessor;

/// Runs one collector pass and feeds the result to the processor
pub struct InterruptHandler {
    collector: InterruptCollector,
    processor: InterruptProcessor,
}

impl InterruptHandler {
    /// Pair a collector with a processor
    pub fn new(collector: InterruptCollector, processor: InterruptProcessor) -> Self {
        Self {
            collector,
            processor,
        }
    }

    /// One pass. Returns the number of interrupts handled.
    pub async fn tick(&self) -> usize {
        let events = match self.collector.collect().await {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "Failed to collect interrupted runs");
                return 0;
            }
        };
        if events.is_empty() {
            return 0;
        }
        let handled = self.processor.process(&events).await;
        debug!(collected = events.len(), handled, "Interrupt pass complete");
        handled
    }
}
