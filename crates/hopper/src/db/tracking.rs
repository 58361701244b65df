//! Tracking store access layer
//!
//! This is not a passive DAO: the tracking tables are the serialization
//! point for every piece of cross-instance coordination in the
//! pipeline. All state changes run inside scoped transactions, and the
//! claim protocol is a conditional update so exactly one claimer wins
//! under concurrent access.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{DbError, DbResult};
use crate::cache::{TokenKey, TokenValueCache, UnitOfWorkCache};
use crate::records::FileType;

/// An entry a reader may try to claim.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CandidateEntry {
    pub entry_id: i64,
    pub bucket: String,
    pub object_key: String,
}

pub struct TrackingStore {
    pool: PgPool,
    token_cache: TokenValueCache,
}

impl TrackingStore {
    pub fn new(pool: PgPool, token_cache_size: usize) -> Self {
        Self {
            pool,
            token_cache: TokenValueCache::new(token_cache_size),
        }
    }

    pub fn token_cache(&self) -> &TokenValueCache {
        &self.token_cache
    }

    // ------------------------------------------------------------------
    // Loader instance bookkeeping
    // ------------------------------------------------------------------

    /// Register this process as a loader instance and return its id.
    pub async fn register_instance(&self, hostname: &str, pid: i32) -> DbResult<i64> {
        let instance_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO loader_instances (instance_uuid, hostname, pid)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(hostname)
        .bind(pid)
        .fetch_one(&self.pool)
        .await?;

        info!(instance_id, hostname, pid, "Registered loader instance");

        Ok(instance_id)
    }

    pub async fn heartbeat(&self, instance_id: i64) -> DbResult<()> {
        sqlx::query("UPDATE loader_instances SET heartbeat_at = now() WHERE id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Release allocations held by instances whose heartbeat has gone
    /// stale, so another instance can pick up their incomplete entries.
    pub async fn reclaim_stale_allocations(&self, older_than: Duration) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE entries
            SET allocated_by = NULL, allocated_at = NULL
            WHERE completed_at IS NULL
              AND allocated_by IS NOT NULL
              AND allocated_by IN (
                  SELECT id FROM loader_instances
                  WHERE heartbeat_at < now() - make_interval(secs => $1)
              )
            "#,
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Scan registration
    // ------------------------------------------------------------------

    /// Insert the bucket row if needed and return its id.
    pub async fn register_bucket(&self, bucket_name: &str) -> DbResult<i64> {
        let bucket_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO buckets (bucket_name)
            VALUES ($1)
            ON CONFLICT (bucket_name) DO UPDATE SET bucket_name = EXCLUDED.bucket_name
            RETURNING id
            "#,
        )
        .bind(bucket_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(bucket_id)
    }

    /// Register a newly sighted object. Idempotent under concurrent
    /// scanners: the unique (bucket, key) constraint makes the second
    /// insert a no-op. Returns true when this call created the row.
    pub async fn register_entry(
        &self,
        bucket_id: i64,
        object_key: &str,
        file_type: FileType,
        object_size: i64,
        last_modified: Option<DateTime<Utc>>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO entries (bucket_id, object_key, file_type, object_size, last_modified)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (bucket_id, object_key) DO NOTHING
            "#,
        )
        .bind(bucket_id)
        .bind(object_key)
        .bind(file_type.as_str())
        .bind(object_size)
        .bind(last_modified)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Reset completed entries older than the threshold so they are
    /// loaded again. Opt-in, for sustained load generation only.
    pub async fn recycle_completed(&self, older_than: Duration) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE entries
            SET completed_at = NULL, allocated_by = NULL, allocated_at = NULL,
                failed = FALSE, retry_count = 0, error_count = 0, line_count = NULL
            WHERE completed_at IS NOT NULL
              AND completed_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Claim protocol
    // ------------------------------------------------------------------

    /// Fetch unallocated, incomplete entries of the given type, oldest
    /// first. Claiming is a separate conditional update; a candidate
    /// returned here may be gone by the time we try.
    pub async fn next_candidates(
        &self,
        file_type: FileType,
        limit: i64,
    ) -> DbResult<Vec<CandidateEntry>> {
        let candidates = sqlx::query_as::<_, CandidateEntry>(
            r#"
            SELECT e.id AS entry_id, b.bucket_name AS bucket, e.object_key
            FROM entries e
            JOIN buckets b ON b.id = e.bucket_id
            WHERE e.file_type = $1
              AND e.allocated_by IS NULL
              AND e.completed_at IS NULL
              AND e.failed = FALSE
            ORDER BY e.id
            LIMIT $2
            "#,
        )
        .bind(file_type.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(candidates)
    }

    /// Allocate-if-unallocated. Exactly one concurrent claimer sees
    /// `true`; the rest move on to the next candidate.
    pub async fn try_allocate(&self, entry_id: i64, instance_id: i64) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE entries
            SET allocated_by = $1, allocated_at = now()
            WHERE id = $2 AND allocated_by IS NULL AND completed_at IS NULL
            "#,
        )
        .bind(instance_id)
        .bind(entry_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Give the entry back without completing it (e.g. shutdown before
    /// the file drained). Another claimer may pick it up; the attempt
    /// does not count against the retry budget.
    pub async fn release_allocation(&self, entry_id: i64) -> DbResult<()> {
        sqlx::query(
            "UPDATE entries SET allocated_by = NULL, allocated_at = NULL WHERE id = $1",
        )
        .bind(entry_id)
        .execute(&self.pool)
        .await?;

        debug!(entry_id, "Released allocation");

        Ok(())
    }

    /// Release after a transient failure, counting the attempt. Once
    /// the retry budget is exhausted the entry is marked failed so it
    /// is not retried indefinitely. Returns true when that happened.
    pub async fn release_for_retry(&self, entry_id: i64, max_retries: i32) -> DbResult<bool> {
        let failed: bool = sqlx::query_scalar(
            r#"
            UPDATE entries
            SET allocated_by = NULL,
                allocated_at = NULL,
                retry_count = retry_count + 1,
                failed = retry_count + 1 >= $2,
                completed_at = CASE WHEN retry_count + 1 >= $2 THEN now() ELSE NULL END
            WHERE id = $1
            RETURNING failed
            "#,
        )
        .bind(entry_id)
        .bind(max_retries)
        .fetch_one(&self.pool)
        .await?;

        Ok(failed)
    }

    /// Mark the entry done: every record was delivered, permanently
    /// failed, or skipped by incremental resume.
    pub async fn mark_completed(
        &self,
        entry_id: i64,
        line_count: i32,
        error_count: i32,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE entries
            SET completed_at = now(), line_count = $2, error_count = $3
            WHERE id = $1
            "#,
        )
        .bind(entry_id)
        .bind(line_count)
        .bind(error_count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Permanent whole-entry failure (unreadable or unparseable
    /// object). The entry will not be claimed again.
    pub async fn mark_failed(&self, entry_id: i64) -> DbResult<()> {
        sqlx::query("UPDATE entries SET failed = TRUE, completed_at = now() WHERE id = $1")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Logical-id ledger
    // ------------------------------------------------------------------

    /// Record the downstream-assigned identifier for one delivered
    /// line, and stage the token-value surrogate in the same unit of
    /// work. The shared token cache sees the staged value only after
    /// the transaction commits.
    pub async fn record_logical_id(
        &self,
        entry_id: i64,
        line_number: i32,
        resource_type: &str,
        assigned_id: &str,
    ) -> DbResult<()> {
        let mut uow = self.token_cache.begin();
        let mut tx = self.pool.begin().await?;

        match self
            .record_logical_id_tx(&mut tx, &mut uow, entry_id, line_number, resource_type, assigned_id)
            .await
        {
            Ok(()) => {
                tx.commit().await?;
                self.token_cache.publish(&mut uow);
                Ok(())
            },
            Err(e) => {
                self.token_cache.discard(&mut uow);
                tx.rollback().await.ok();
                Err(DbError::from(e))
            },
        }
    }

    async fn record_logical_id_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        uow: &mut UnitOfWorkCache,
        entry_id: i64,
        line_number: i32,
        resource_type: &str,
        assigned_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO logical_ids (entry_id, line_number, assigned_id, resource_type)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (entry_id, line_number) DO NOTHING
            "#,
        )
        .bind(entry_id)
        .bind(line_number)
        .bind(assigned_id)
        .bind(resource_type)
        .execute(&mut **tx)
        .await?;

        let key = TokenKey::new(resource_type, assigned_id);
        if self.token_cache.get(uow, &key).is_none() {
            let token_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO token_values (code_system, token_value)
                VALUES ($1, $2)
                ON CONFLICT (code_system, token_value)
                    DO UPDATE SET code_system = EXCLUDED.code_system
                RETURNING token_id
                "#,
            )
            .bind(resource_type)
            .bind(assigned_id)
            .fetch_one(&mut **tx)
            .await?;

            uow.put(key, token_id);
        }

        Ok(())
    }

    /// Point lookup used by incremental-exact resume.
    pub async fn logical_id_exists(&self, entry_id: i64, line_number: i32) -> DbResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM logical_ids WHERE entry_id = $1 AND line_number = $2)",
        )
        .bind(entry_id)
        .bind(line_number)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    /// High-water mark used by approximate incremental resume: the
    /// largest line number with a recorded id, if any.
    pub async fn max_recorded_line(&self, entry_id: i64) -> DbResult<Option<i32>> {
        let max: Option<i32> = sqlx::query_scalar(
            "SELECT MAX(line_number) FROM logical_ids WHERE entry_id = $1",
        )
        .bind(entry_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(max)
    }

    /// Random sample of recorded (resource_type, assigned_id) pairs,
    /// used by the synthetic read workload.
    pub async fn sample_assigned_ids(&self, limit: i64) -> DbResult<Vec<(String, String)>> {
        let ids = sqlx::query_as::<_, (String, String)>(
            "SELECT resource_type, assigned_id FROM logical_ids ORDER BY random() LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}
