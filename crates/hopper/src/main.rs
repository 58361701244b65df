//! hopper - main entry point

use anyhow::{Context, Result};
use clap::Parser;
use hopper_common::logging::{init_logging, LogConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use hopper::{
    api::{ApiConfig, IngestClient},
    config::Cli,
    db::{self, tracking::TrackingStore, DbConfig},
    delivery::{ApiDelivery, RebundleDelivery, RecordProcessor},
    handler::ResourceHandler,
    reader::{ObjectReader, ReaderConfig},
    records::FileType,
    scanner::{BucketScanner, ScanTarget},
    reindex::ReindexDriver,
    storage::{config::StorageConfig, ObjectStore},
    workload::ReadWorkload,
};

/// Drain window for the housekeeping loops, which hold no in-flight
/// deliveries.
const AUX_STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_log = LogConfig {
        filter_directives: Some("hopper=info,sqlx=warn,aws_sdk_s3=warn,hyper=warn".to_string()),
        ..LogConfig::default()
    };
    let log_config = LogConfig::from_env().unwrap_or(default_log);
    init_logging(&log_config)?;

    cli.validate()?;

    info!("Starting hopper");

    // The tracking database is always needed, and the schema must be
    // current before anything scans or claims. Migration failure here
    // is fatal.
    let db_config = DbConfig::from_env()?;
    let pool = db::create_pool(&db_config).await?;
    db::run_migrations(&pool).await?;

    if cli.create_schema {
        info!("Schema bootstrap complete");
        return Ok(());
    }

    let store = Arc::new(TrackingStore::new(pool, cli.token_cache_size));
    let instance_id = store
        .register_instance(&local_hostname(), std::process::id() as i32)
        .await?;

    // The ingest API client is needed unless we are only re-bundling.
    let client: Option<Arc<IngestClient>> = if cli.target_bucket.is_none() {
        Some(Arc::new(IngestClient::new(ApiConfig::from_env()?)?))
    } else {
        None
    };

    let drain_timeout = Duration::from_secs(cli.pool_shutdown_timeout_seconds);
    let mut scanner = None;
    let mut readers = Vec::new();
    let mut handler = None;
    let mut workload = None;
    let mut reindexer = None;

    if !cli.buckets.is_empty() {
        let storage = ObjectStore::new(StorageConfig::from_env()?).await?;

        // Pick the delivery strategy once; the handler never knows
        // which one it drives.
        let processor: Arc<dyn RecordProcessor> = if let Some(bucket) = &cli.target_bucket {
            info!(
                target_bucket = %bucket,
                target_prefix = %cli.target_prefix,
                max_resources_per_bundle = cli.max_resources_per_bundle,
                "Re-bundling mode: records are repacked, not sent"
            );
            Arc::new(RebundleDelivery::new(
                storage.clone(),
                bucket.clone(),
                cli.target_prefix.clone(),
                cli.max_resources_per_bundle,
            ))
        } else {
            let client = client
                .clone()
                .context("ingest API client required for API delivery")?;
            Arc::new(ApiDelivery::new(client, store.clone()))
        };

        let resource_handler = Arc::new(ResourceHandler::new(
            cli.max_concurrent_requests,
            cli.bundle_cost_factor,
            processor,
        ));

        if !cli.no_scan {
            let targets = cli
                .buckets
                .iter()
                .map(|bucket| ScanTarget {
                    bucket: bucket.clone(),
                    prefix: cli.path_prefix.clone(),
                })
                .collect();

            let bucket_scanner = BucketScanner::new(
                store.clone(),
                storage.clone(),
                targets,
                cli.selected_file_types(),
                Duration::from_millis(cli.scan_interval_ms),
                cli.recycle_seconds.map(Duration::from_secs),
                Duration::from_secs(cli.stale_allocation_seconds),
                instance_id,
            );
            bucket_scanner.init();
            scanner = Some(bucket_scanner);
        }

        for file_type in cli.selected_file_types() {
            let max_concurrent_files = match file_type {
                FileType::Json => cli.max_concurrent_json_files,
                FileType::Ndjson => cli.max_concurrent_ndjson_files,
            };

            let reader = ObjectReader::new(
                store.clone(),
                storage.clone(),
                resource_handler.clone(),
                ReaderConfig {
                    file_type,
                    max_concurrent_files,
                    poll_interval: Duration::from_millis(cli.reader_poll_interval_ms),
                    incremental: cli.incremental_mode(),
                    bucket_paths: cli.bucket_paths.clone(),
                    max_entry_retries: cli.max_entry_retries,
                },
                instance_id,
            );
            reader.init();
            readers.push(reader);
        }

        handler = Some(resource_handler);
    }

    if cli.concurrent_read_requests > 0 {
        if let Some(client) = &client {
            let read_workload = ReadWorkload::new(
                store.clone(),
                client.clone(),
                cli.concurrent_read_requests,
            );
            read_workload.init();
            workload = Some(read_workload);
        }
    }

    if let Some(tstamp) = &cli.reindex_tstamp {
        if let Some(client) = &client {
            let driver = ReindexDriver::new(
                client.clone(),
                cli.reindex_concurrent_requests,
                tstamp.clone(),
                cli.reindex_resource_count,
            );
            driver.init();
            reindexer = Some(driver);
        }
    }

    info!("All services started");

    shutdown_signal().await;

    // Two-phase shutdown: first stop the generation of new work, then
    // let what is already moving drain. Readers finish before the
    // handler closes its intake, so an in-flight NDJSON file can drain
    // to completion and leave no gaps in its resume state.
    info!("Stopping all services");

    if let Some(scanner) = &scanner {
        scanner.signal_stop();
    }
    if let Some(workload) = &workload {
        workload.signal_stop();
    }
    if let Some(reindexer) = &reindexer {
        reindexer.signal_stop();
    }
    for reader in &readers {
        reader.signal_stop();
    }

    if let Some(scanner) = &scanner {
        scanner.wait_for_stop(AUX_STOP_TIMEOUT).await;
    }
    if let Some(workload) = &workload {
        workload.wait_for_stop(AUX_STOP_TIMEOUT).await;
    }
    if let Some(reindexer) = &reindexer {
        reindexer.wait_for_stop(AUX_STOP_TIMEOUT).await;
    }
    for reader in &readers {
        reader.wait_for_stop(drain_timeout).await;
    }

    if let Some(handler) = &handler {
        handler.signal_stop();
        handler.wait_for_stop(drain_timeout).await;
    }

    info!("All services stopped");

    Ok(())
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Block until SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
