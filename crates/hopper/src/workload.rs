//! Synthetic read workload
//!
//! Optional soak-testing loop that samples previously recorded logical
//! ids from the tracking store and issues concurrent reads against the
//! downstream API, adding read pressure alongside the ingest load.

use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::api::IngestClient;
use crate::db::tracking::TrackingStore;
use crate::lifecycle::Stoppable;

/// How many ids to hold in the sample buffer between refreshes.
const SAMPLE_BUFFER_SIZE: i64 = 100_000;

/// Refresh the sample buffer after this many requests so newly loaded
/// resources join the rotation.
const REFRESH_EVERY: u64 = 50_000;

pub struct ReadWorkload {
    store: Arc<TrackingStore>,
    client: Arc<IngestClient>,
    concurrent_requests: usize,
    requests: AtomicU64,
    failures: AtomicU64,
    stoppable: Stoppable,
}

impl ReadWorkload {
    pub fn new(
        store: Arc<TrackingStore>,
        client: Arc<IngestClient>,
        concurrent_requests: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            client,
            concurrent_requests: concurrent_requests.max(1),
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            stoppable: Stoppable::new("read-workload"),
        })
    }

    pub fn init(self: &Arc<Self>) {
        let workload = self.clone();
        self.stoppable.spawn(async move { workload.run().await });
    }

    async fn run(self: Arc<Self>) {
        let token = self.stoppable.stop_token();
        let permits = Arc::new(Semaphore::new(self.concurrent_requests));
        let mut buffer: Vec<(String, String)> = Vec::new();
        let mut last_refresh: u64 = 0;

        info!(
            concurrent_requests = self.concurrent_requests,
            "Read workload started"
        );

        loop {
            if token.is_cancelled() {
                break;
            }

            let issued = self.requests.load(Ordering::Relaxed);
            if buffer.is_empty() || issued - last_refresh >= REFRESH_EVERY {
                match self.store.sample_assigned_ids(SAMPLE_BUFFER_SIZE).await {
                    Ok(ids) if !ids.is_empty() => {
                        info!(sampled = ids.len(), "Refreshed read-workload sample");
                        buffer = ids;
                        last_refresh = issued;
                    },
                    Ok(_) => {
                        // Nothing loaded yet; check back shortly.
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(10)) => {},
                        }
                        continue;
                    },
                    Err(e) => {
                        warn!(error = %e, "Failed to sample ids for read workload");
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(10)) => {},
                        }
                        continue;
                    },
                }
            }

            let (resource_type, id) = {
                let mut rng = rand::thread_rng();
                match buffer.choose(&mut rng) {
                    Some(pair) => pair.clone(),
                    None => continue,
                }
            };

            let permit = tokio::select! {
                _ = token.cancelled() => break,
                acquired = permits.clone().acquire_owned() => match acquired {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let workload = self.clone();
            self.stoppable.spawn(async move {
                let outcome = workload.client.read(&resource_type, &id).await;
                let total = workload.requests.fetch_add(1, Ordering::Relaxed) + 1;
                if !outcome.is_success() {
                    workload.failures.fetch_add(1, Ordering::Relaxed);
                }
                if total % 10_000 == 0 {
                    info!(
                        requests = total,
                        failures = workload.failures.load(Ordering::Relaxed),
                        "Read workload progress"
                    );
                }
                drop(permit);
            });
        }

        info!(
            requests = self.requests.load(Ordering::Relaxed),
            failures = self.failures.load(Ordering::Relaxed),
            "Read workload stopped"
        );
    }

    pub fn signal_stop(&self) {
        self.stoppable.signal_stop();
    }

    pub async fn wait_for_stop(&self, timeout: Duration) -> bool {
        self.stoppable.wait_for_stop(timeout).await
    }
}
