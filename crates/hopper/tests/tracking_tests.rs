//! Tracking store integration tests.
//!
//! These exercise the store-mediated coordination properties against a
//! real Postgres: exclusive claims, idempotent registration, and the
//! crash/resume ledger. They are ignored by default; run them with a
//! database available via DATABASE_URL:
//!
//!   cargo test -p hopper -- --ignored

use std::sync::Arc;
use std::time::Duration;

use hopper::db::tracking::TrackingStore;
use hopper::records::FileType;
use sqlx::PgPool;

async fn seeded_entry(store: &TrackingStore) -> i64 {
    let bucket_id = store.register_bucket("bucket1").await.unwrap();
    assert!(store
        .register_entry(bucket_id, "load/patients.ndjson", FileType::Ndjson, 1024, None)
        .await
        .unwrap());

    let candidates = store.next_candidates(FileType::Ndjson, 10).await.unwrap();
    assert_eq!(candidates.len(), 1);
    candidates[0].entry_id
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a running Postgres (DATABASE_URL)"]
async fn test_at_most_one_claimer(pool: PgPool) {
    let store = Arc::new(TrackingStore::new(pool, 16));
    let instance_id = store.register_instance("test-host", 1).await.unwrap();
    let entry_id = seeded_entry(&store).await;

    // N concurrent claim attempts; exactly one may win
    let mut attempts = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        attempts.push(tokio::spawn(async move {
            store.try_allocate(entry_id, instance_id).await.unwrap()
        }));
    }

    let mut wins = 0;
    for attempt in attempts {
        if attempt.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);

    // The claimed entry no longer shows up as a candidate
    let candidates = store.next_candidates(FileType::Ndjson, 10).await.unwrap();
    assert!(candidates.is_empty());

    // Releasing makes it claimable again, once
    store.release_allocation(entry_id).await.unwrap();
    assert!(store.try_allocate(entry_id, instance_id).await.unwrap());
    assert!(!store.try_allocate(entry_id, instance_id).await.unwrap());
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a running Postgres (DATABASE_URL)"]
async fn test_scan_registration_is_idempotent(pool: PgPool) {
    let store = TrackingStore::new(pool, 16);

    // Two scanner instances race over the same listing
    let first = store.register_bucket("bucket1").await.unwrap();
    let second = store.register_bucket("bucket1").await.unwrap();
    assert_eq!(first, second);

    assert!(store
        .register_entry(first, "load/a.ndjson", FileType::Ndjson, 10, None)
        .await
        .unwrap());
    // Second sighting registers nothing
    assert!(!store
        .register_entry(second, "load/a.ndjson", FileType::Ndjson, 10, None)
        .await
        .unwrap());

    let candidates = store.next_candidates(FileType::Ndjson, 10).await.unwrap();
    assert_eq!(candidates.len(), 1);
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a running Postgres (DATABASE_URL)"]
async fn test_crash_resume_ledger(pool: PgPool) {
    let store = TrackingStore::new(pool, 16);
    let instance_id = store.register_instance("test-host", 1).await.unwrap();
    let entry_id = seeded_entry(&store).await;

    // First run: claim, deliver lines 0 and 1, then "crash" (the entry
    // stays allocated and incomplete)
    assert!(store.try_allocate(entry_id, instance_id).await.unwrap());
    store
        .record_logical_id(entry_id, 0, "Patient", "P1")
        .await
        .unwrap();
    store
        .record_logical_id(entry_id, 1, "Patient", "P2")
        .await
        .unwrap();

    // Restart with incremental-exact: recorded lines are skipped, the
    // unrecorded one is not
    assert!(store.logical_id_exists(entry_id, 0).await.unwrap());
    assert!(store.logical_id_exists(entry_id, 1).await.unwrap());
    assert!(!store.logical_id_exists(entry_id, 2).await.unwrap());
    assert_eq!(store.max_recorded_line(entry_id).await.unwrap(), Some(1));

    // Recording a line twice is a no-op, never a duplicate
    store
        .record_logical_id(entry_id, 1, "Patient", "P2")
        .await
        .unwrap();

    store.mark_completed(entry_id, 3, 0).await.unwrap();
    let candidates = store.next_candidates(FileType::Ndjson, 10).await.unwrap();
    assert!(candidates.is_empty());
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a running Postgres (DATABASE_URL)"]
async fn test_retry_budget_exhaustion(pool: PgPool) {
    let store = TrackingStore::new(pool, 16);
    let instance_id = store.register_instance("test-host", 1).await.unwrap();
    let entry_id = seeded_entry(&store).await;

    // Two transient failures within a budget of three leave the entry
    // claimable; the third marks it failed for good
    for attempt in 0..3 {
        assert!(store.try_allocate(entry_id, instance_id).await.unwrap());
        let failed = store.release_for_retry(entry_id, 3).await.unwrap();
        assert_eq!(failed, attempt == 2);
    }

    assert!(store.next_candidates(FileType::Ndjson, 10).await.unwrap().is_empty());

    // A plain release never charges the budget
    let entry2 = {
        let bucket_id = store.register_bucket("bucket1").await.unwrap();
        store
            .register_entry(bucket_id, "load/more.ndjson", FileType::Ndjson, 1, None)
            .await
            .unwrap();
        store.next_candidates(FileType::Ndjson, 10).await.unwrap()[0].entry_id
    };
    for _ in 0..10 {
        assert!(store.try_allocate(entry2, instance_id).await.unwrap());
        store.release_allocation(entry2).await.unwrap();
    }
    assert_eq!(store.next_candidates(FileType::Ndjson, 10).await.unwrap().len(), 1);
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a running Postgres (DATABASE_URL)"]
async fn test_recycle_and_stale_reclaim(pool: PgPool) {
    let store = TrackingStore::new(pool.clone(), 16);
    let instance_id = store.register_instance("test-host", 1).await.unwrap();
    let entry_id = seeded_entry(&store).await;

    // Completed entries come back once they are older than the recycle
    // threshold
    assert!(store.try_allocate(entry_id, instance_id).await.unwrap());
    store.mark_completed(entry_id, 3, 0).await.unwrap();
    assert_eq!(
        store.recycle_completed(Duration::from_secs(0)).await.unwrap(),
        1
    );
    assert_eq!(store.next_candidates(FileType::Ndjson, 10).await.unwrap().len(), 1);

    // A claim held by a silent instance is reclaimed
    assert!(store.try_allocate(entry_id, instance_id).await.unwrap());
    sqlx::query("UPDATE loader_instances SET heartbeat_at = now() - interval '1 hour' WHERE id = $1")
        .bind(instance_id)
        .execute(&pool)
        .await
        .unwrap();
    assert_eq!(
        store
            .reclaim_stale_allocations(Duration::from_secs(600))
            .await
            .unwrap(),
        1
    );
    assert_eq!(store.next_candidates(FileType::Ndjson, 10).await.unwrap().len(), 1);

    // A live heartbeat protects the claim
    assert!(store.try_allocate(entry_id, instance_id).await.unwrap());
    store.heartbeat(instance_id).await.unwrap();
    assert_eq!(
        store
            .reclaim_stale_allocations(Duration::from_secs(600))
            .await
            .unwrap(),
        0
    );
}
