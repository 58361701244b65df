//! Record model shared by the reader, handler, and delivery strategies.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// File-type classes the pipeline understands. JSON files hold a single
/// document (one resource, one bundle, or an array of either); NDJSON
/// files hold one document per line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Json,
    Ndjson,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Json => "json",
            FileType::Ndjson => "ndjson",
        }
    }

    /// Detect the file type from an object key suffix. Keys with other
    /// suffixes are not scanned.
    pub fn from_key(key: &str) -> Option<FileType> {
        let lower = key.to_ascii_lowercase();
        if lower.ends_with(".ndjson") {
            Some(FileType::Ndjson)
        } else if lower.ends_with(".json") {
            Some(FileType::Json)
        } else {
            None
        }
    }
}

impl std::str::FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(FileType::Json),
            "ndjson" => Ok(FileType::Ndjson),
            other => Err(format!("unknown file type: {}", other)),
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bucket name paired with a key prefix, restricting which objects
/// are read. Multiple paths may be configured; an object matches if any
/// path matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketPath {
    pub bucket: String,
    pub prefix: String,
}

impl BucketPath {
    pub fn matches(&self, bucket: &str, key: &str) -> bool {
        self.bucket == bucket && key.starts_with(&self.prefix)
    }
}

impl std::str::FromStr for BucketPath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((bucket, prefix)) if !bucket.is_empty() => Ok(BucketPath {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            }),
            _ => Err(format!(
                "bad bucket path '{}': expected <bucket-name>:<path-prefix>",
                s
            )),
        }
    }
}

/// One record pulled out of a tracked file, on its way to delivery.
pub struct RecordEntry {
    pub entry_id: i64,
    pub object_key: String,
    pub line_number: i32,
    pub payload: Value,
    pub resource_count: u32,
    pub progress: Arc<EntryProgress>,
}

impl RecordEntry {
    pub fn new(
        entry_id: i64,
        object_key: String,
        line_number: i32,
        payload: Value,
        progress: Arc<EntryProgress>,
    ) -> Self {
        let resource_count = resource_count(&payload);
        Self {
            entry_id,
            object_key,
            line_number,
            payload,
            resource_count,
            progress,
        }
    }

    /// Admission cost of this record: embedded resource count weighted
    /// by the bundle cost factor, clamped so even an oversized bundle
    /// can be admitted (at full-ceiling cost, i.e. it runs alone).
    pub fn cost(&self, cost_factor: f64, ceiling: u32) -> u32 {
        let weighted = (self.resource_count as f64 * cost_factor).ceil() as u32;
        weighted.clamp(1, ceiling.max(1))
    }

    pub fn resource_type(&self) -> &str {
        self.payload
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or("Resource")
    }
}

/// Number of resources a document represents: bundles count their
/// entries, anything else counts as one.
pub fn resource_count(payload: &Value) -> u32 {
    match payload.get("entry").and_then(Value::as_array) {
        Some(entries) if !entries.is_empty() => entries.len() as u32,
        _ => 1,
    }
}

/// Parse a whole JSON file body into its records: a top-level array
/// yields one record per element, anything else is a single record.
pub fn parse_records(body: &str) -> Result<Vec<Value>, serde_json::Error> {
    let value: Value = serde_json::from_str(body)?;
    Ok(match value {
        Value::Array(items) => items,
        other => vec![other],
    })
}

/// Per-entry completion tracking.
///
/// Deliveries complete out of order, so the reader counts dispatches as
/// it parses, seals the progress when the file is exhausted, and then
/// waits until every dispatched record has resolved before deciding the
/// entry's fate.
#[derive(Default)]
pub struct EntryProgress {
    dispatched: AtomicU32,
    succeeded: AtomicU32,
    failed_permanent: AtomicU32,
    failed_transient: AtomicU32,
    skipped: AtomicU32,
    sealed: AtomicBool,
    notify: Notify,
}

impl EntryProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn record_permanent_failure(&self) {
        self.failed_permanent.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn record_transient_failure(&self) {
        self.failed_transient.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }

    /// All records have been dispatched; the dispatch count is final.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn succeeded(&self) -> u32 {
        self.succeeded.load(Ordering::SeqCst)
    }

    pub fn permanent_failures(&self) -> u32 {
        self.failed_permanent.load(Ordering::SeqCst)
    }

    pub fn transient_failures(&self) -> u32 {
        self.failed_transient.load(Ordering::SeqCst)
    }

    pub fn skipped(&self) -> u32 {
        self.skipped.load(Ordering::SeqCst)
    }

    fn resolved(&self) -> u32 {
        self.succeeded.load(Ordering::SeqCst)
            + self.failed_permanent.load(Ordering::SeqCst)
            + self.failed_transient.load(Ordering::SeqCst)
    }

    fn drained(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
            && self.resolved() >= self.dispatched.load(Ordering::SeqCst)
    }

    /// Wait until the entry is sealed and every dispatched record has
    /// resolved. Tolerates out-of-order completion.
    pub async fn wait_until_drained(&self) {
        loop {
            let notified = self.notify.notified();
            if self.drained() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_file_type_from_key() {
        assert_eq!(FileType::from_key("load/patients.ndjson"), Some(FileType::Ndjson));
        assert_eq!(FileType::from_key("load/bundle.JSON"), Some(FileType::Json));
        assert_eq!(FileType::from_key("load/readme.txt"), None);
        assert_eq!(FileType::from_key("load/data.csv"), None);
    }

    #[test]
    fn test_bucket_path_parse_and_match() {
        let path: BucketPath = "bucket1:load/2026".parse().unwrap();
        assert!(path.matches("bucket1", "load/2026/patients.ndjson"));
        assert!(!path.matches("bucket1", "archive/patients.ndjson"));
        assert!(!path.matches("bucket2", "load/2026/patients.ndjson"));

        assert!("no-separator".parse::<BucketPath>().is_err());
        assert!(":prefix-only".parse::<BucketPath>().is_err());

        // An empty prefix matches every key in the bucket
        let whole: BucketPath = "bucket1:".parse().unwrap();
        assert!(whole.matches("bucket1", "anything"));
    }

    #[test]
    fn test_resource_count_for_bundle() {
        let bundle = json!({"resourceType": "Bundle", "entry": [{}, {}, {}]});
        assert_eq!(resource_count(&bundle), 3);

        let single = json!({"resourceType": "Patient", "id": "p1"});
        assert_eq!(resource_count(&single), 1);

        let empty_bundle = json!({"resourceType": "Bundle", "entry": []});
        assert_eq!(resource_count(&empty_bundle), 1);
    }

    #[test]
    fn test_parse_records_array_vs_single() {
        let records = parse_records(r#"[{"a":1},{"b":2}]"#).unwrap();
        assert_eq!(records.len(), 2);

        let records = parse_records(r#"{"resourceType":"Patient"}"#).unwrap();
        assert_eq!(records.len(), 1);

        assert!(parse_records("not json").is_err());
    }

    #[test]
    fn test_cost_is_weighted_and_clamped() {
        let progress = EntryProgress::new();
        let bundle = json!({"entry": [{}, {}, {}, {}]});
        let record = RecordEntry::new(1, "k".into(), 0, bundle, progress.clone());

        assert_eq!(record.cost(1.0, 40), 4);
        assert_eq!(record.cost(2.5, 40), 10);
        // Never exceeds the ceiling
        assert_eq!(record.cost(100.0, 40), 40);
        // Never below one permit
        let single = RecordEntry::new(1, "k".into(), 0, json!({}), progress);
        assert_eq!(single.cost(0.0, 40), 1);
    }

    #[tokio::test]
    async fn test_progress_drains_out_of_order() {
        let progress = EntryProgress::new();
        progress.record_dispatch();
        progress.record_dispatch();
        progress.record_dispatch();

        let waiter = {
            let progress = progress.clone();
            tokio::spawn(async move { progress.wait_until_drained().await })
        };

        // Resolutions arrive out of dispatch order
        progress.record_permanent_failure();
        progress.record_success();
        progress.seal();
        assert!(!waiter.is_finished());

        progress.record_success();
        waiter.await.unwrap();

        assert_eq!(progress.succeeded(), 2);
        assert_eq!(progress.permanent_failures(), 1);
    }
}
