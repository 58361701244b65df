//! Object reader
//!
//! One reader instance runs per file-type class, each with its own
//! concurrency budget: JSON files are small and processed several at a
//! time, NDJSON files are often huge single objects and default to one
//! at a time.
//!
//! The scheduling loop claims unprocessed entries through the tracking
//! store's conditional update, so a claim is exclusive across every
//! reader in every pipeline instance. Claimed NDJSON files are parsed
//! line by line off the object byte stream and dispatched into the
//! resource handler as they are read; the whole file is never held in
//! memory.

use hopper_common::HopperError;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use crate::db::tracking::{CandidateEntry, TrackingStore};
use crate::handler::ResourceHandler;
use crate::lifecycle::Stoppable;
use crate::records::{parse_records, BucketPath, EntryProgress, FileType, RecordEntry};
use crate::storage::ObjectStore;

/// How many claim candidates to fetch per scheduling pass. Losing a
/// claim race just moves us to the next candidate in the batch.
const CLAIM_CANDIDATE_BATCH: i64 = 10;

/// Resume behavior for partially-loaded NDJSON files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementalMode {
    /// Redeliver every line.
    Off,
    /// Skip lines at or below the highest recorded line number. Cheap,
    /// but best-effort: completion order can diverge from file order,
    /// so lines that were never attempted may be skipped.
    HighWaterMark,
    /// Point lookup per line; never skips an unrecorded line.
    Exact,
}

/// Whether a line is skipped under the high-water-mark heuristic.
pub(crate) fn below_high_water_mark(line_number: i32, high_water_mark: Option<i32>) -> bool {
    match high_water_mark {
        Some(mark) => line_number <= mark,
        None => false,
    }
}

pub struct ReaderConfig {
    pub file_type: FileType,
    pub max_concurrent_files: usize,
    pub poll_interval: Duration,
    pub incremental: IncrementalMode,
    pub bucket_paths: Vec<BucketPath>,
    pub max_entry_retries: i32,
}

pub struct ObjectReader {
    store: Arc<TrackingStore>,
    objects: ObjectStore,
    handler: Arc<ResourceHandler>,
    config: ReaderConfig,
    instance_id: i64,
    slots: Arc<tokio::sync::Semaphore>,
    stoppable: Stoppable,
}

impl ObjectReader {
    pub fn new(
        store: Arc<TrackingStore>,
        objects: ObjectStore,
        handler: Arc<ResourceHandler>,
        config: ReaderConfig,
        instance_id: i64,
    ) -> Arc<Self> {
        let slots = Arc::new(tokio::sync::Semaphore::new(config.max_concurrent_files.max(1)));
        let name = match config.file_type {
            FileType::Json => "json-reader",
            FileType::Ndjson => "ndjson-reader",
        };
        Arc::new(Self {
            store,
            objects,
            handler,
            config,
            instance_id,
            slots,
            stoppable: Stoppable::new(name),
        })
    }

    /// Start the scheduling loop; returns immediately.
    pub fn init(self: &Arc<Self>) {
        let reader = self.clone();
        self.stoppable.spawn(async move { reader.run().await });
    }

    async fn run(self: Arc<Self>) {
        let token = self.stoppable.stop_token();

        loop {
            // Take a file slot before claiming so we never allocate
            // more entries than we can actively process.
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                acquired = self.slots.clone().acquire_owned() => match acquired {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.claim_next().await {
                Ok(Some(candidate)) => {
                    let reader = self.clone();
                    self.stoppable.spawn(async move {
                        reader.process_entry(candidate).await;
                        drop(permit);
                    });
                },
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {},
                    }
                },
                Err(e) => {
                    drop(permit);
                    warn!(
                        file_type = %self.config.file_type,
                        error = %e,
                        "Claim pass failed, will retry"
                    );
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {},
                    }
                },
            }
        }

        info!(file_type = %self.config.file_type, "Object reader stopped");
    }

    /// Fetch a batch of candidates and race for the first claim.
    async fn claim_next(&self) -> anyhow::Result<Option<CandidateEntry>> {
        let candidates = self
            .store
            .next_candidates(self.config.file_type, CLAIM_CANDIDATE_BATCH)
            .await?;

        for candidate in candidates {
            if !self.matches_paths(&candidate) {
                continue;
            }
            if self
                .store
                .try_allocate(candidate.entry_id, self.instance_id)
                .await?
            {
                return Ok(Some(candidate));
            }
            // Another claimer won; try the next candidate.
        }

        Ok(None)
    }

    fn matches_paths(&self, candidate: &CandidateEntry) -> bool {
        self.config.bucket_paths.is_empty()
            || self
                .config
                .bucket_paths
                .iter()
                .any(|p| p.matches(&candidate.bucket, &candidate.object_key))
    }

    async fn process_entry(&self, candidate: CandidateEntry) {
        info!(
            entry_id = candidate.entry_id,
            bucket = %candidate.bucket,
            object_key = %candidate.object_key,
            "Processing entry"
        );

        let progress = EntryProgress::new();
        let parsed = match self.config.file_type {
            FileType::Json => self.process_json(&candidate, &progress).await,
            FileType::Ndjson => self.process_ndjson(&candidate, &progress).await,
        };

        // Every dispatched record must resolve before we decide the
        // entry's fate; completions arrive out of order.
        progress.seal();
        progress.wait_until_drained().await;

        match parsed {
            Ok(line_count) => self.finalize(&candidate, line_count, &progress).await,
            Err(e) if e.is_transient() => {
                warn!(
                    entry_id = candidate.entry_id,
                    object_key = %candidate.object_key,
                    error = %e,
                    "Entry hit transient trouble, releasing for retry"
                );
                self.retry_or_fail(&candidate).await;
            },
            Err(e) => {
                error!(
                    entry_id = candidate.entry_id,
                    object_key = %candidate.object_key,
                    error = %e,
                    "Entry is unreadable, marking failed"
                );
                if let Err(e) = self.store.mark_failed(candidate.entry_id).await {
                    error!(entry_id = candidate.entry_id, error = %e, "Failed to mark entry failed");
                }
            },
        }
    }

    /// A JSON file is one entry holding a single document or an array
    /// of documents, discovered in one parse pass.
    async fn process_json(
        &self,
        candidate: &CandidateEntry,
        progress: &Arc<EntryProgress>,
    ) -> Result<i32, HopperError> {
        let body = self
            .objects
            .fetch(&candidate.bucket, &candidate.object_key)
            .await
            .map_err(|e| HopperError::Storage(e.to_string()))?;

        let text = String::from_utf8(body)
            .map_err(|e| HopperError::Parse(format!("object is not UTF-8: {}", e)))?;
        let documents = parse_records(&text)
            .map_err(|e| HopperError::Parse(format!("object is not JSON: {}", e)))?;

        let count = documents.len() as i32;
        for (index, payload) in documents.into_iter().enumerate() {
            let record = RecordEntry::new(
                candidate.entry_id,
                candidate.object_key.clone(),
                index as i32,
                payload,
                progress.clone(),
            );
            if !self.handler.process(record).await {
                progress.record_transient_failure();
            }
        }

        Ok(count)
    }

    /// An NDJSON file is parsed and dispatched line by line off the
    /// byte stream. Incremental resume consults the logical-id ledger
    /// before dispatching a line.
    async fn process_ndjson(
        &self,
        candidate: &CandidateEntry,
        progress: &Arc<EntryProgress>,
    ) -> Result<i32, HopperError> {
        let high_water_mark = match self.config.incremental {
            IncrementalMode::HighWaterMark => self
                .store
                .max_recorded_line(candidate.entry_id)
                .await
                .map_err(|e| HopperError::Database(e.to_string()))?,
            _ => None,
        };

        let stream = self
            .objects
            .open(&candidate.bucket, &candidate.object_key)
            .await
            .map_err(|e| HopperError::Storage(e.to_string()))?;

        let mut lines = BufReader::new(stream.into_async_read()).lines();
        let mut line_number: i32 = 0;

        loop {
            let line = lines.next_line().await?;
            let Some(line) = line else { break };

            if line.trim().is_empty() {
                line_number += 1;
                continue;
            }

            let skip = match self.config.incremental {
                IncrementalMode::Off => false,
                IncrementalMode::HighWaterMark => {
                    below_high_water_mark(line_number, high_water_mark)
                },
                IncrementalMode::Exact => self
                    .store
                    .logical_id_exists(candidate.entry_id, line_number)
                    .await
                    .map_err(|e| HopperError::Database(e.to_string()))?,
            };
            if skip {
                progress.record_skip();
                line_number += 1;
                continue;
            }

            match serde_json::from_str(&line) {
                Ok(payload) => {
                    let record = RecordEntry::new(
                        candidate.entry_id,
                        candidate.object_key.clone(),
                        line_number,
                        payload,
                        progress.clone(),
                    );
                    if !self.handler.process(record).await {
                        progress.record_transient_failure();
                    }
                },
                Err(e) => {
                    // Bad line; the rest of the file still loads.
                    warn!(
                        entry_id = candidate.entry_id,
                        object_key = %candidate.object_key,
                        line = line_number,
                        error = %e,
                        "Unparseable line"
                    );
                    progress.record_permanent_failure();
                },
            }

            line_number += 1;
        }

        Ok(line_number)
    }

    /// Decide the entry's fate once everything has resolved: any
    /// transient failure releases the claim for a later retry, else the
    /// entry is complete (possibly with some lines failed for good).
    async fn finalize(
        &self,
        candidate: &CandidateEntry,
        line_count: i32,
        progress: &Arc<EntryProgress>,
    ) {
        let transient = progress.transient_failures();
        if transient > 0 {
            warn!(
                entry_id = candidate.entry_id,
                object_key = %candidate.object_key,
                transient,
                "Entry had transient delivery failures, releasing for retry"
            );
            if self.stoppable.is_stopping() {
                // Interrupted by shutdown, not by real trouble; do not
                // charge the retry budget.
                self.release(candidate).await;
            } else {
                self.retry_or_fail(candidate).await;
            }
            return;
        }

        let errors = progress.permanent_failures();
        info!(
            entry_id = candidate.entry_id,
            object_key = %candidate.object_key,
            delivered = progress.succeeded(),
            skipped = progress.skipped(),
            errors,
            "Entry completed"
        );

        if let Err(e) = self
            .store
            .mark_completed(candidate.entry_id, line_count, errors as i32)
            .await
        {
            error!(
                entry_id = candidate.entry_id,
                error = %e,
                "Failed to mark entry completed, releasing instead"
            );
            self.release(candidate).await;
        }
    }

    async fn release(&self, candidate: &CandidateEntry) {
        if let Err(e) = self.store.release_allocation(candidate.entry_id).await {
            error!(
                entry_id = candidate.entry_id,
                error = %e,
                "Failed to release allocation"
            );
        }
    }

    async fn retry_or_fail(&self, candidate: &CandidateEntry) {
        match self
            .store
            .release_for_retry(candidate.entry_id, self.config.max_entry_retries)
            .await
        {
            Ok(true) => error!(
                entry_id = candidate.entry_id,
                object_key = %candidate.object_key,
                max_retries = self.config.max_entry_retries,
                "Entry failed after exhausting its retry budget"
            ),
            Ok(false) => {},
            Err(e) => error!(
                entry_id = candidate.entry_id,
                error = %e,
                "Failed to release allocation for retry"
            ),
        }
    }

    /// Stop claiming new entries immediately. In-flight entries drain
    /// to completion in [`wait_for_stop`](Self::wait_for_stop) so NDJSON
    /// resume state is left without gaps.
    pub fn signal_stop(&self) {
        self.stoppable.signal_stop();
    }

    pub async fn wait_for_stop(&self, timeout: Duration) -> bool {
        self.stoppable.wait_for_stop(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_water_mark_skip_decision() {
        // No recorded lines: nothing is skipped
        assert!(!below_high_water_mark(0, None));

        // Lines at or below the mark are skipped, later lines are not.
        // This is the documented best-effort trade-off: line 1 is
        // skipped even if only lines 0 and 2 were actually recorded.
        assert!(below_high_water_mark(0, Some(2)));
        assert!(below_high_water_mark(1, Some(2)));
        assert!(below_high_water_mark(2, Some(2)));
        assert!(!below_high_water_mark(3, Some(2)));
    }
}
