//! Resource handler
//!
//! Bounded dispatcher between the readers and the delivery strategy.
//! A single weighted semaphore caps total in-flight delivery cost
//! across every reader; admission blocks (async backpressure) until the
//! record's cost fits under the ceiling, so large bundles cannot flood
//! the pool and starve single-resource submissions.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::error;

use crate::delivery::{ProcessOutcome, RecordProcessor};
use crate::lifecycle::Stoppable;
use crate::records::RecordEntry;

pub struct ResourceHandler {
    permits: Arc<Semaphore>,
    capacity: u32,
    cost_factor: f64,
    processor: Arc<dyn RecordProcessor>,
    stoppable: Stoppable,
}

impl ResourceHandler {
    pub fn new(max_in_flight: u32, cost_factor: f64, processor: Arc<dyn RecordProcessor>) -> Self {
        let capacity = max_in_flight.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
            cost_factor,
            processor,
            stoppable: Stoppable::new("resource-handler"),
        }
    }

    /// Submit one record for asynchronous delivery. Blocks only while
    /// the in-flight ceiling has no room for the record's cost.
    ///
    /// Returns false when the handler is stopping and no longer accepts
    /// work; the caller should treat the record as not attempted.
    pub async fn process(&self, record: RecordEntry) -> bool {
        if self.stoppable.is_stopping() {
            return false;
        }

        let cost = record.cost(self.cost_factor, self.capacity);
        let token = self.stoppable.stop_token();

        let permit = tokio::select! {
            _ = token.cancelled() => return false,
            acquired = self.permits.clone().acquire_many_owned(cost) => {
                match acquired {
                    Ok(permit) => permit,
                    Err(_) => return false,
                }
            },
        };

        record.progress.record_dispatch();

        let processor = self.processor.clone();
        self.stoppable.spawn(async move {
            let outcome = processor.process(&record).await;
            match outcome {
                ProcessOutcome::Success => record.progress.record_success(),
                ProcessOutcome::PermanentFailure => record.progress.record_permanent_failure(),
                ProcessOutcome::TransientFailure => record.progress.record_transient_failure(),
            }
            drop(permit);
        });

        true
    }

    /// Stop accepting new records. Non-blocking; in-flight deliveries
    /// continue until [`wait_for_stop`](Self::wait_for_stop).
    pub fn signal_stop(&self) {
        self.stoppable.signal_stop();
    }

    /// Wait for every outstanding delivery to resolve, then flush the
    /// strategy's buffered state. Waiting first means no outcome is
    /// recorded as lost just because shutdown raced the response.
    pub async fn wait_for_stop(&self, timeout: Duration) -> bool {
        let drained = self.stoppable.wait_for_stop(timeout).await;

        if self.processor.flush().await != ProcessOutcome::Success {
            error!("Delivery strategy failed to flush buffered records at shutdown");
        }

        drained
    }
}
