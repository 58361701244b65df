//! hopper — bulk object-storage ingestion pipeline
//!
//! Scans buckets for files of records, tracks per-file and per-line
//! state in Postgres, and delivers each record to a downstream HTTP
//! ingest API under a global cost-weighted concurrency ceiling. The
//! tracking store is the single source of truth; any number of hopper
//! instances can cooperate against the same buckets and database.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod delivery;
pub mod handler;
pub mod lifecycle;
pub mod reader;
pub mod records;
pub mod reindex;
pub mod scanner;
pub mod storage;
pub mod workload;
