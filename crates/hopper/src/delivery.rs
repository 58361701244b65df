//! Delivery strategies
//!
//! The resource handler is constructed with one [`RecordProcessor`] and
//! never knows which: API delivery sends each record to the downstream
//! ingest service and records the assigned id; re-bundling delivery
//! repacks records into fixed-size bundles written back to object
//! storage, with no network calls.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::{IngestClient, Outcome};
use crate::db::tracking::TrackingStore;
use crate::records::RecordEntry;
use crate::storage::ObjectStore;

/// How a delivery attempt resolved. Transient failures release the
/// entry's allocation for a later retry; permanent failures are logged
/// against the line and processing continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Success,
    PermanentFailure,
    TransientFailure,
}

#[async_trait]
pub trait RecordProcessor: Send + Sync {
    async fn process(&self, record: &RecordEntry) -> ProcessOutcome;

    /// Push out any buffered state at shutdown. Most strategies have
    /// none.
    async fn flush(&self) -> ProcessOutcome {
        ProcessOutcome::Success
    }
}

// ----------------------------------------------------------------------
// API delivery
// ----------------------------------------------------------------------

pub struct ApiDelivery {
    client: Arc<IngestClient>,
    store: Arc<TrackingStore>,
}

impl ApiDelivery {
    pub fn new(client: Arc<IngestClient>, store: Arc<TrackingStore>) -> Self {
        Self { client, store }
    }
}

#[async_trait]
impl RecordProcessor for ApiDelivery {
    async fn process(&self, record: &RecordEntry) -> ProcessOutcome {
        let resource_type = record.resource_type().to_string();
        let result = self.client.send(&resource_type, &record.payload).await;

        match result.outcome {
            outcome if outcome.is_success() => {
                let Some(assigned_id) = result.assigned_id else {
                    // Bundle responses carry no single identifier; the
                    // delivery succeeded but there is nothing to ledger.
                    debug!(
                        entry_id = record.entry_id,
                        line = record.line_number,
                        "Delivered without an assigned id"
                    );
                    return ProcessOutcome::Success;
                };

                match self
                    .store
                    .record_logical_id(
                        record.entry_id,
                        record.line_number,
                        &resource_type,
                        &assigned_id,
                    )
                    .await
                {
                    Ok(()) => {
                        debug!(
                            entry_id = record.entry_id,
                            line = record.line_number,
                            assigned_id = %assigned_id,
                            "Recorded logical id"
                        );
                        ProcessOutcome::Success
                    },
                    Err(e) => {
                        // Delivered but not ledgered: treat as transient
                        // so the entry is released and the line can be
                        // reconciled on a later attempt.
                        warn!(
                            entry_id = record.entry_id,
                            line = record.line_number,
                            error = %e,
                            "Failed to record logical id"
                        );
                        ProcessOutcome::TransientFailure
                    },
                }
            },
            Outcome::ClientError => {
                warn!(
                    entry_id = record.entry_id,
                    object_key = %record.object_key,
                    line = record.line_number,
                    "Record rejected by the downstream API"
                );
                ProcessOutcome::PermanentFailure
            },
            outcome => {
                warn!(
                    entry_id = record.entry_id,
                    object_key = %record.object_key,
                    line = record.line_number,
                    ?outcome,
                    "Delivery failed, will be retried"
                );
                ProcessOutcome::TransientFailure
            },
        }
    }
}

// ----------------------------------------------------------------------
// Re-bundling delivery
// ----------------------------------------------------------------------

/// Accumulates records into fixed-size chunks. Pure bookkeeping so the
/// chunk arithmetic is testable without storage.
pub struct Rebundler {
    max_records: usize,
    buffer: Vec<Value>,
}

impl Rebundler {
    pub fn new(max_records: usize) -> Self {
        Self {
            max_records: max_records.max(1),
            buffer: Vec::new(),
        }
    }

    /// Add one record, unpacking bundle entries into their individual
    /// resources. Returns every chunk that filled up.
    pub fn push(&mut self, record: &Value) -> Vec<Vec<Value>> {
        match record.get("entry").and_then(Value::as_array) {
            Some(entries) if !entries.is_empty() => {
                for entry in entries {
                    let resource = entry.get("resource").unwrap_or(entry);
                    self.buffer.push(resource.clone());
                }
            },
            _ => self.buffer.push(record.clone()),
        }

        let mut chunks = Vec::new();
        while self.buffer.len() >= self.max_records {
            let rest = self.buffer.split_off(self.max_records);
            chunks.push(std::mem::replace(&mut self.buffer, rest));
        }
        chunks
    }

    /// Hand back the final partial chunk, if any.
    pub fn flush(&mut self) -> Option<Vec<Value>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

/// Breaks oversized inputs into transaction-safe bundles written to a
/// target bucket/prefix instead of calling the downstream API.
pub struct RebundleDelivery {
    objects: ObjectStore,
    target_bucket: String,
    target_prefix: String,
    run_id: Uuid,
    rebundler: Mutex<Rebundler>,
    sequence: AtomicU64,
}

impl RebundleDelivery {
    pub fn new(
        objects: ObjectStore,
        target_bucket: String,
        target_prefix: String,
        max_records: usize,
    ) -> Self {
        Self {
            objects,
            target_bucket,
            target_prefix,
            run_id: Uuid::new_v4(),
            rebundler: Mutex::new(Rebundler::new(max_records)),
            sequence: AtomicU64::new(0),
        }
    }

    async fn write_bundle(&self, records: Vec<Value>) -> ProcessOutcome {
        let count = records.len();
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let key = format!(
            "{}/{}-{:06}.json",
            self.target_prefix.trim_matches('/'),
            self.run_id,
            seq
        );

        let bundle = json!({
            "resourceType": "Bundle",
            "type": "collection",
            "entry": records,
        });

        let body = match serde_json::to_vec(&bundle) {
            Ok(body) => body,
            Err(e) => {
                warn!(key, error = %e, "Failed to serialize output bundle");
                return ProcessOutcome::PermanentFailure;
            },
        };

        match self.objects.put(&self.target_bucket, &key, body).await {
            Ok(()) => {
                debug!(
                    bucket = %self.target_bucket,
                    key,
                    records = count,
                    "Wrote output bundle"
                );
                ProcessOutcome::Success
            },
            Err(e) => {
                warn!(key, error = %e, "Failed to write output bundle");
                ProcessOutcome::TransientFailure
            },
        }
    }
}

#[async_trait]
impl RecordProcessor for RebundleDelivery {
    async fn process(&self, record: &RecordEntry) -> ProcessOutcome {
        let chunks = {
            let mut rebundler = self.rebundler.lock().await;
            rebundler.push(&record.payload)
        };

        for chunk in chunks {
            let outcome = self.write_bundle(chunk).await;
            if outcome != ProcessOutcome::Success {
                return outcome;
            }
        }

        ProcessOutcome::Success
    }

    async fn flush(&self) -> ProcessOutcome {
        let remainder = {
            let mut rebundler = self.rebundler.lock().await;
            rebundler.flush()
        };

        match remainder {
            Some(chunk) => self.write_bundle(chunk).await,
            None => ProcessOutcome::Success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebundler_chunks_at_capacity() {
        let mut rebundler = Rebundler::new(100);

        // A bundle of 150 resources yields one full chunk immediately
        let entries: Vec<Value> = (0..150).map(|i| json!({"resource": {"id": i}})).collect();
        let bundle = json!({"resourceType": "Bundle", "entry": entries});

        let chunks = rebundler.push(&bundle);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 100);

        // The remaining 50 come out on flush: exactly two output bundles
        let rest = rebundler.flush().unwrap();
        assert_eq!(rest.len(), 50);
        assert!(rebundler.flush().is_none());
    }

    #[test]
    fn test_rebundler_accumulates_singles() {
        let mut rebundler = Rebundler::new(3);

        assert!(rebundler.push(&json!({"id": 1})).is_empty());
        assert!(rebundler.push(&json!({"id": 2})).is_empty());
        let chunks = rebundler.push(&json!({"id": 3}));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 3);
        assert!(rebundler.flush().is_none());
    }

    #[test]
    fn test_rebundler_unwraps_bundle_entries() {
        let mut rebundler = Rebundler::new(10);
        let bundle = json!({
            "entry": [
                {"resource": {"id": "a"}},
                {"resource": {"id": "b"}},
            ]
        });

        rebundler.push(&bundle);
        let chunk = rebundler.flush().unwrap();
        assert_eq!(chunk, vec![json!({"id": "a"}), json!({"id": "b"})]);
    }
}
