//! Command-line configuration
//!
//! Collaborator credentials (database, object store, ingest API) come
//! from the environment; everything about what to load and how hard to
//! push comes from the command line. Configuration problems fail fast
//! here, before any scanning begins.

use anyhow::Result;
use clap::Parser;
use std::collections::HashSet;

use crate::reader::IncrementalMode;
use crate::records::{BucketPath, FileType};

#[derive(Parser, Debug)]
#[command(name = "hopper")]
#[command(author, version, about = "Bulk object-storage ingestion pipeline")]
pub struct Cli {
    /// Create or update the tracking schema, then exit
    #[arg(long)]
    pub create_schema: bool,

    /// Bucket to scan for loadable objects (repeatable)
    #[arg(long = "bucket")]
    pub buckets: Vec<String>,

    /// Restrict reading to <bucket-name>:<path-prefix> (repeatable)
    #[arg(long = "bucket-path", value_parser = parse_bucket_path)]
    pub bucket_paths: Vec<BucketPath>,

    /// Key prefix applied when scanning every bucket
    #[arg(long, default_value = "")]
    pub path_prefix: String,

    /// File types to load: json or ndjson (repeatable; default ndjson)
    #[arg(long = "file-type", value_parser = parse_file_type)]
    pub file_types: Vec<FileType>,

    /// Milliseconds between bucket scans
    #[arg(long, default_value_t = 300_000)]
    pub scan_interval_ms: u64,

    /// Disable the bucket scanner (load already-registered entries only)
    #[arg(long)]
    pub no_scan: bool,

    /// How many JSON files to process concurrently
    #[arg(long, default_value_t = 10)]
    pub max_concurrent_json_files: usize,

    /// How many NDJSON files to process concurrently
    #[arg(long, default_value_t = 1)]
    pub max_concurrent_ndjson_files: usize,

    /// Global ceiling on concurrent in-flight delivery cost
    #[arg(long, default_value_t = 40)]
    pub max_concurrent_requests: u32,

    /// Cost multiplier applied to bundles so large bundles admit at a
    /// higher weight and cannot flood the pool
    #[arg(long, default_value_t = 1.0)]
    pub bundle_cost_factor: f64,

    /// Skip NDJSON lines below the recorded high-water mark (coarse,
    /// best-effort resume)
    #[arg(long)]
    pub incremental: bool,

    /// Skip NDJSON lines with a recorded logical id (lookup per line)
    #[arg(long)]
    pub incremental_exact: bool,

    /// Reload completed entries older than this many seconds (soak
    /// testing only; off by default)
    #[arg(long)]
    pub recycle_seconds: Option<u64>,

    /// Re-bundle records into this bucket instead of calling the API
    #[arg(long)]
    pub target_bucket: Option<String>,

    /// Key prefix for re-bundled output objects
    #[arg(long, default_value = "rebundled")]
    pub target_prefix: String,

    /// Records per re-bundled output object
    #[arg(long, default_value_t = 100)]
    pub max_resources_per_bundle: usize,

    /// Concurrent synthetic read requests (0 disables the workload)
    #[arg(long, default_value_t = 0)]
    pub concurrent_read_requests: usize,

    /// Drive the downstream reindex operation with this timestamp
    #[arg(long)]
    pub reindex_tstamp: Option<String>,

    /// Resources per reindex call
    #[arg(long, default_value_t = 10)]
    pub reindex_resource_count: u32,

    /// Concurrent reindex callers
    #[arg(long, default_value_t = 1)]
    pub reindex_concurrent_requests: usize,

    /// Drain timeout at shutdown; keep this slightly longer than the
    /// downstream transaction timeout so in-flight responses are not
    /// lost before their outcome is recorded
    #[arg(long, default_value_t = 130)]
    pub pool_shutdown_timeout_seconds: u64,

    /// Milliseconds a reader sleeps when no entry is claimable
    #[arg(long, default_value_t = 5_000)]
    pub reader_poll_interval_ms: u64,

    /// Transient-failure retry budget per entry before it is marked
    /// failed for good
    #[arg(long, default_value_t = 5)]
    pub max_entry_retries: i32,

    /// Reclaim allocations from instances silent for this many seconds
    #[arg(long, default_value_t = 300)]
    pub stale_allocation_seconds: u64,

    /// Capacity of the shared token-value cache
    #[arg(long, default_value_t = 10_000)]
    pub token_cache_size: usize,
}

fn parse_file_type(s: &str) -> Result<FileType, String> {
    s.parse()
}

fn parse_bucket_path(s: &str) -> Result<BucketPath, String> {
    s.parse()
}

impl Cli {
    /// Rudimentary configuration check: everything here is fatal at
    /// startup, never recoverable at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            anyhow::bail!("--max-concurrent-requests must be greater than 0");
        }

        if self.bundle_cost_factor < 0.0 {
            anyhow::bail!("--bundle-cost-factor must not be negative");
        }

        if self.max_resources_per_bundle == 0 {
            anyhow::bail!("--max-resources-per-bundle must be greater than 0");
        }

        if self.max_entry_retries <= 0 {
            anyhow::bail!("--max-entry-retries must be greater than 0");
        }

        if !self.create_schema
            && self.buckets.is_empty()
            && self.concurrent_read_requests == 0
            && self.reindex_tstamp.is_none()
        {
            anyhow::bail!(
                "nothing to do: give at least one --bucket, \
                 --concurrent-read-requests, or --reindex-tstamp"
            );
        }

        for path in &self.bucket_paths {
            if !self.buckets.contains(&path.bucket) {
                anyhow::bail!(
                    "--bucket-path references bucket '{}' which is not in the --bucket list",
                    path.bucket
                );
            }
        }

        if self.target_bucket.is_some() && self.concurrent_read_requests > 0 {
            anyhow::bail!(
                "--concurrent-read-requests needs the ingest API, \
                 which re-bundling mode does not use"
            );
        }

        Ok(())
    }

    /// Selected file types, defaulting to NDJSON when none are given.
    pub fn selected_file_types(&self) -> HashSet<FileType> {
        if self.file_types.is_empty() {
            HashSet::from([FileType::Ndjson])
        } else {
            self.file_types.iter().copied().collect()
        }
    }

    pub fn incremental_mode(&self) -> IncrementalMode {
        if self.incremental_exact {
            IncrementalMode::Exact
        } else if self.incremental {
            IncrementalMode::HighWaterMark
        } else {
            IncrementalMode::Off
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("hopper").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["--bucket", "b1"]);
        assert_eq!(cli.scan_interval_ms, 300_000);
        assert_eq!(cli.max_concurrent_json_files, 10);
        assert_eq!(cli.max_concurrent_ndjson_files, 1);
        assert_eq!(cli.max_concurrent_requests, 40);
        assert_eq!(cli.pool_shutdown_timeout_seconds, 130);
        assert!(cli.recycle_seconds.is_none());
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_file_types_default_to_ndjson() {
        let cli = parse(&["--bucket", "b1"]);
        assert_eq!(cli.selected_file_types(), HashSet::from([FileType::Ndjson]));

        let cli = parse(&["--bucket", "b1", "--file-type", "json", "--file-type", "ndjson"]);
        assert_eq!(
            cli.selected_file_types(),
            HashSet::from([FileType::Json, FileType::Ndjson])
        );
    }

    #[test]
    fn test_incremental_mode_mapping() {
        let cli = parse(&["--bucket", "b1"]);
        assert_eq!(cli.incremental_mode(), IncrementalMode::Off);

        let cli = parse(&["--bucket", "b1", "--incremental"]);
        assert_eq!(cli.incremental_mode(), IncrementalMode::HighWaterMark);

        let cli = parse(&["--bucket", "b1", "--incremental-exact"]);
        assert_eq!(cli.incremental_mode(), IncrementalMode::Exact);
    }

    #[test]
    fn test_validate_rejects_nothing_to_do() {
        let cli = parse(&[]);
        assert!(cli.validate().is_err());

        let cli = parse(&["--create-schema"]);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_bucket_path() {
        let cli = parse(&["--bucket", "b1", "--bucket-path", "other:load/"]);
        assert!(cli.validate().is_err());

        let cli = parse(&["--bucket", "b1", "--bucket-path", "b1:load/"]);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_ceiling() {
        let cli = parse(&["--bucket", "b1", "--max-concurrent-requests", "0"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_bad_file_type_rejected_at_parse() {
        let result =
            Cli::try_parse_from(["hopper", "--bucket", "b1", "--file-type", "xml"]);
        assert!(result.is_err());
    }
}
