mod common;

use std::{collections::HashMap, sync::Arc, sync::atomic::Ordering};

use chrono::{TimeZone, Utc};
use server::{
    cache::{CacheStore, MemoryCache},
    error::StoreError,
    events::EventStore,
    models::{FootprintRecord, UserId},
    recovery::RecoveryMode,
    updater::WriteThrough,
};

use common::{FlakyCache, Harness, SlowCache, at, footprints, record, visit};

#[tokio::test]
async fn test_example_visits() {
    let harness = Harness::with_records(&[record(1, 10, 100), record(1, 10, 50), record(1, 20, 80)]);
    let footprints = harness.boot(RecoveryMode::Rebuild).await.unwrap();

    assert_eq!(
        footprints.query_recent_visitors(1, 10).await,
        vec![visit(10, 100), visit(20, 80)]
    );
}

#[tokio::test]
async fn test_rebuild_keeps_true_maximum() {
    let records = footprints(400, 7);
    let harness = Harness::with_records(&records);
    let footprints = harness.boot(RecoveryMode::Rebuild).await.unwrap();

    let mut expected: HashMap<(UserId, UserId), i64> = HashMap::new();
    for record in &records {
        let latest = expected
            .entry((record.profile_id, record.visitor_id))
            .or_insert(i64::MIN);
        *latest = (*latest).max(record.occurred_at.timestamp());
    }

    for profile_id in 0..5 {
        let visits = footprints.query_recent_visitors(profile_id, usize::MAX).await;
        let distinct = expected.keys().filter(|(p, _)| *p == profile_id).count();
        assert_eq!(visits.len(), distinct);

        for cached in visits {
            assert_eq!(
                cached.last_visit_at.timestamp(),
                expected[&(profile_id, cached.visitor_id)]
            );
        }
    }
}

#[tokio::test]
async fn test_query_is_ranked_and_bounded() {
    let harness = Harness::with_records(&footprints(300, 11));
    let footprints = harness.boot(RecoveryMode::Rebuild).await.unwrap();

    for profile_id in 0..5 {
        let everything = footprints.query_recent_visitors(profile_id, usize::MAX).await;

        for limit in [0, 1, 3, 100] {
            let page = footprints.query_recent_visitors(profile_id, limit).await;
            assert!(page.len() <= limit);
            assert!(page.len() <= everything.len());
            assert_eq!(page[..], everything[..page.len()]);

            for pair in page.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                assert!(
                    a.last_visit_at > b.last_visit_at
                        || (a.last_visit_at == b.last_visit_at && a.visitor_id < b.visitor_id)
                );
            }
        }
    }
}

#[tokio::test]
async fn test_write_through_converges_with_rebuild() {
    let records = footprints(250, 3);

    let mut reversed = records.clone();
    reversed.reverse();
    let mut rotated = records.clone();
    rotated.rotate_left(records.len() / 3);
    let mut by_time = records.clone();
    by_time.sort_by_key(|r| (r.occurred_at, r.visitor_id));

    for order in [records.clone(), reversed, rotated, by_time] {
        let live = Harness::new();
        let footprints = live.boot(RecoveryMode::Rebuild).await.unwrap();
        for record in &order {
            footprints
                .record_visit(record.profile_id, record.visitor_id, record.occurred_at)
                .await
                .unwrap();
        }

        let rebuilt = Arc::new(MemoryCache::new());
        live.boot_with(RecoveryMode::Rebuild, rebuilt.clone())
            .await
            .unwrap();

        assert_eq!(live.cache.dump(), rebuilt.dump());
    }
}

#[tokio::test]
async fn test_rebuild_is_idempotent() {
    let harness = Harness::with_records(&footprints(200, 5));

    harness.boot(RecoveryMode::Rebuild).await.unwrap();
    let first = harness.cache.dump();
    let first_log = std::fs::read(harness.log.path()).unwrap();

    harness.boot(RecoveryMode::Rebuild).await.unwrap();
    assert_eq!(harness.cache.dump(), first);
    assert_eq!(std::fs::read(harness.log.path()).unwrap(), first_log);
}

#[tokio::test]
async fn test_rebuild_drops_stale_views() {
    let harness = Harness::with_records(&[record(1, 10, 100)]);
    harness.cache.upsert(99, visit(5, 5)).await.unwrap();
    harness.cache.upsert(1, visit(77, 500)).await.unwrap();

    harness.boot(RecoveryMode::Rebuild).await.unwrap();

    assert_eq!(harness.cache.dump().len(), 1);
    assert_eq!(harness.cache.view(1).await.unwrap(), vec![visit(10, 100)]);
}

#[tokio::test]
async fn test_self_visits_are_ignored() {
    let harness = Harness::new();
    let footprints = harness.boot(RecoveryMode::Rebuild).await.unwrap();

    footprints.record_visit(1, 1, at(10)).await.unwrap();

    assert_eq!(harness.events.scan(&mut |_| {}).unwrap(), 0);
    assert!(footprints.query_recent_visitors(1, 10).await.is_empty());
}

#[tokio::test]
async fn test_out_of_range_visit_is_refused() {
    let harness = Harness::new();
    let footprints = harness.boot(RecoveryMode::Rebuild).await.unwrap();

    let ancient = Utc.with_ymd_and_hms(1650, 1, 1, 0, 0, 0).unwrap();
    let result = footprints.record_visit(1, 10, ancient).await;

    assert!(matches!(result, Err(StoreError::OutOfRange(_))));
    assert_eq!(harness.events.scan(&mut |_| {}).unwrap(), 0);
    assert!(footprints.query_recent_visitors(1, 10).await.is_empty());
}

#[tokio::test]
async fn test_record_visit_survives_cache_outage() {
    let harness = Harness::new();
    let cache = Arc::new(FlakyCache::default());
    let footprints = harness
        .boot_with(RecoveryMode::Rebuild, cache.clone())
        .await
        .unwrap();

    footprints.record_visit(1, 10, at(100)).await.unwrap();
    cache.down.store(true, Ordering::SeqCst);
    footprints.record_visit(1, 20, at(200)).await.unwrap();

    // The event store holds both visits, the cache only the first.
    let mut stored = Vec::new();
    harness.events.scan(&mut |r| stored.push(r)).unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(cache.inner.view(1).await.unwrap(), vec![visit(10, 100)]);

    // Reads fall back to the event store while the cache is down.
    assert_eq!(
        footprints.query_recent_visitors(1, 10).await,
        vec![visit(20, 200), visit(10, 100)]
    );

    cache.down.store(false, Ordering::SeqCst);
    assert_eq!(
        footprints.query_recent_visitors(1, 10).await,
        vec![visit(10, 100)]
    );
}

#[tokio::test]
async fn test_corrupt_entry_does_not_break_reads() {
    let harness = Harness::with_records(&[record(1, 10, 100), record(1, 20, 80)]);
    let footprints = harness.boot(RecoveryMode::Rebuild).await.unwrap();

    harness.cache.insert_raw(1, i64::MIN, "\u{0}garbage");

    assert_eq!(
        footprints.query_recent_visitors(1, 10).await,
        vec![visit(10, 100), visit(20, 80)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_visits_keep_latest() {
    let cache = Arc::new(SlowCache {
        inner: MemoryCache::new(),
    });
    let updater = Arc::new(WriteThrough::new(cache.clone()));

    let mut tasks = Vec::new();
    for profile_id in 0..64 {
        let order = if profile_id % 2 == 0 { [10, 20] } else { [20, 10] };
        for secs in order {
            let updater = updater.clone();
            tasks.push(tokio::spawn(async move {
                updater.apply_visit(profile_id, 1, at(secs)).await
            }));
        }
    }

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    for profile_id in 0..64 {
        assert_eq!(
            cache.inner.view(profile_id).await.unwrap(),
            vec![visit(1, 20)],
            "profile {profile_id}"
        );
    }
}

#[tokio::test]
async fn test_interleaved_visits_on_one_profile() {
    let cache = Arc::new(SlowCache {
        inner: MemoryCache::new(),
    });
    let updater = WriteThrough::new(cache.clone());

    let (low, high) = tokio::join!(
        updater.apply_visit(1, 1, at(10)),
        updater.apply_visit(1, 1, at(20)),
    );
    low.unwrap();
    high.unwrap();

    let (high, low) = tokio::join!(
        updater.apply_visit(2, 1, at(20)),
        updater.apply_visit(2, 1, at(10)),
    );
    low.unwrap();
    high.unwrap();

    assert_eq!(cache.inner.view(1).await.unwrap(), vec![visit(1, 20)]);
    assert_eq!(cache.inner.view(2).await.unwrap(), vec![visit(1, 20)]);
}

#[test]
fn test_generated_footprints_have_duplicates() {
    let records: Vec<FootprintRecord> = footprints(200, 1);
    let distinct: std::collections::HashSet<_> = records.iter().map(|r| r.key()).collect();

    assert!(distinct.len() < records.len());
    assert!(records.iter().all(|r| r.profile_id != r.visitor_id));
}
