//! Reindex driver
//!
//! Optional loop that repeatedly invokes the downstream reindex
//! operation with a fixed timestamp parameter and per-call resource
//! count, across N concurrent callers, until the server reports there
//! is nothing left to reindex.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::api::{IngestClient, ReindexProgress};
use crate::lifecycle::Stoppable;

pub struct ReindexDriver {
    client: Arc<IngestClient>,
    concurrent_requests: usize,
    tstamp: String,
    resource_count: u32,
    stoppable: Stoppable,
}

impl ReindexDriver {
    pub fn new(
        client: Arc<IngestClient>,
        concurrent_requests: usize,
        tstamp: String,
        resource_count: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            concurrent_requests: concurrent_requests.max(1),
            tstamp,
            resource_count,
            stoppable: Stoppable::new("reindex-driver"),
        })
    }

    pub fn init(self: &Arc<Self>) {
        info!(
            concurrent_requests = self.concurrent_requests,
            tstamp = %self.tstamp,
            resource_count = self.resource_count,
            "Reindex driver started"
        );

        for worker in 0..self.concurrent_requests {
            let driver = self.clone();
            self.stoppable.spawn(async move { driver.run(worker).await });
        }
    }

    async fn run(&self, worker: usize) {
        let token = self.stoppable.stop_token();

        loop {
            if token.is_cancelled() {
                break;
            }

            match self
                .client
                .trigger_reindex(&self.tstamp, self.resource_count)
                .await
            {
                Ok(ReindexProgress::MoreWork) => continue,
                Ok(ReindexProgress::Done) => {
                    info!(worker, "Reindex reported no work remaining");
                    break;
                },
                Err(e) => {
                    warn!(worker, error = %e, "Reindex call failed, backing off");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {},
                    }
                },
            }
        }
    }

    pub fn signal_stop(&self) {
        self.stoppable.signal_stop();
    }

    pub async fn wait_for_stop(&self, timeout: Duration) -> bool {
        self.stoppable.wait_for_stop(timeout).await
    }
}
