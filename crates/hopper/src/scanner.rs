//! Bucket scanner
//!
//! Periodically lists the configured buckets, filters the listing to
//! the selected file types, and registers newly discovered objects in
//! the tracking store. Registration is idempotent under concurrent
//! scanners: the store's unique constraint makes the losing insert a
//! no-op, so two instances racing over the same bucket produce exactly
//! one entry per object key.
//!
//! The scan cycle also carries this instance's housekeeping: heartbeat,
//! reclaim of allocations held by dead peers, and the opt-in recycle
//! policy used for sustained load generation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::db::tracking::TrackingStore;
use crate::lifecycle::Stoppable;
use crate::records::FileType;
use crate::storage::ObjectStore;

/// One bucket/prefix pair to scan.
#[derive(Debug, Clone)]
pub struct ScanTarget {
    pub bucket: String,
    pub prefix: String,
}

pub struct BucketScanner {
    store: Arc<TrackingStore>,
    objects: ObjectStore,
    targets: Vec<ScanTarget>,
    file_types: HashSet<FileType>,
    scan_interval: Duration,
    recycle_after: Option<Duration>,
    stale_allocation_after: Duration,
    instance_id: i64,
    stoppable: Stoppable,
}

impl BucketScanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TrackingStore>,
        objects: ObjectStore,
        targets: Vec<ScanTarget>,
        file_types: HashSet<FileType>,
        scan_interval: Duration,
        recycle_after: Option<Duration>,
        stale_allocation_after: Duration,
        instance_id: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            objects,
            targets,
            file_types,
            scan_interval,
            recycle_after,
            stale_allocation_after,
            instance_id,
            stoppable: Stoppable::new("bucket-scanner"),
        })
    }

    /// Start the background scan loop; returns immediately.
    pub fn init(self: &Arc<Self>) {
        let scanner = self.clone();
        self.stoppable.spawn(async move { scanner.run().await });
    }

    async fn run(&self) {
        let token = self.stoppable.stop_token();

        loop {
            if let Err(e) = self.cycle().await {
                // Transient listing or database trouble: log and try
                // again next cycle.
                warn!(error = %e, "Scan cycle failed, will retry");
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.scan_interval) => {},
            }
        }

        info!("Bucket scanner stopped");
    }

    async fn cycle(&self) -> anyhow::Result<()> {
        self.store.heartbeat(self.instance_id).await?;

        let reclaimed = self
            .store
            .reclaim_stale_allocations(self.stale_allocation_after)
            .await?;
        if reclaimed > 0 {
            info!(reclaimed, "Reclaimed allocations from stale loader instances");
        }

        for target in &self.targets {
            let bucket_id = self.store.register_bucket(&target.bucket).await?;
            let listing = self.objects.list(&target.bucket, &target.prefix).await?;

            let mut registered = 0u32;
            for object in listing {
                let Some(file_type) = FileType::from_key(&object.key) else {
                    continue;
                };
                if !self.file_types.contains(&file_type) {
                    continue;
                }

                let created = self
                    .store
                    .register_entry(
                        bucket_id,
                        &object.key,
                        file_type,
                        object.size,
                        object.last_modified,
                    )
                    .await?;
                if created {
                    registered += 1;
                }
            }

            if registered > 0 {
                info!(
                    bucket = %target.bucket,
                    prefix = %target.prefix,
                    registered,
                    "Registered newly discovered objects"
                );
            } else {
                debug!(
                    bucket = %target.bucket,
                    prefix = %target.prefix,
                    "Scan found nothing new"
                );
            }
        }

        if let Some(age) = self.recycle_after {
            let recycled = self.store.recycle_completed(age).await?;
            if recycled > 0 {
                info!(recycled, "Recycled completed entries for reload");
            }
        }

        Ok(())
    }

    pub fn signal_stop(&self) {
        self.stoppable.signal_stop();
    }

    pub async fn wait_for_stop(&self, timeout: Duration) -> bool {
        self.stoppable.wait_for_stop(timeout).await
    }
}
