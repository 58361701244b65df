//! Object-storage collaborator
//!
//! Thin wrapper over the S3 API exposing the three operations the
//! pipeline needs: paginated listing, streamed reads, and writes (used
//! only by the re-bundling delivery strategy).

use anyhow::{Context, Result};
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

pub mod config;

/// Descriptor for one listed object.
#[derive(Debug, Clone)]
pub struct ObjectSummary {
    pub key: String,
    pub size: i64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
}

impl ObjectStore {
    pub async fn new(config: config::StorageConfig) -> Result<Self> {
        debug!("Initializing object store client");

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "hopper-storage",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        Ok(Self { client })
    }

    /// List every object under the prefix, following pagination to the
    /// end of the listing.
    #[instrument(skip(self))]
    pub async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let mut summaries = Vec::new();

        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.context(format!("Failed to list s3://{}/{}", bucket, prefix))?;
            for obj in page.contents() {
                let Some(key) = obj.key() else { continue };
                summaries.push(ObjectSummary {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0),
                    last_modified: obj
                        .last_modified()
                        .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())),
                });
            }
        }

        debug!(
            bucket,
            prefix,
            count = summaries.len(),
            "Listed objects"
        );

        Ok(summaries)
    }

    /// Fetch an object as a byte stream. NDJSON readers consume this
    /// incrementally; they must never need the whole object in memory.
    #[instrument(skip(self))]
    pub async fn open(&self, bucket: &str, key: &str) -> Result<ByteStream> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .context(format!("Failed to get s3://{}/{}", bucket, key))?;

        Ok(response.body)
    }

    /// Fetch an object fully into memory (JSON files, which are
    /// bounded in size).
    #[instrument(skip(self))]
    pub async fn fetch(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let body = self.open(bucket, key).await?;
        let data = body
            .collect()
            .await
            .context("Failed to read object body")?
            .into_bytes()
            .to_vec();

        debug!(bucket, key, bytes = data.len(), "Fetched object");

        Ok(data)
    }

    #[instrument(skip(self, data))]
    pub async fn put(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        let size = data.len();

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(data))
            .send()
            .await
            .context(format!("Failed to put s3://{}/{}", bucket, key))?;

        debug!(bucket, key, bytes = size, "Wrote object");

        Ok(())
    }
}
