#![allow(dead_code)]

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use server::{
    cache::{CacheStore, MemoryCache},
    error::{StartupError, StoreError},
    events::{EventStore, SqliteEventStore},
    footprints::Footprints,
    journal::{JournaledCache, MutationLog},
    models::{CanonicalVisit, FootprintRecord, UserId},
    recovery::{RecoveryManager, RecoveryMode},
};
use tempfile::TempDir;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn visit(visitor_id: UserId, secs: i64) -> CanonicalVisit {
    CanonicalVisit::new(visitor_id, at(secs))
}

pub fn record(profile_id: UserId, visitor_id: UserId, secs: i64) -> FootprintRecord {
    FootprintRecord::new(profile_id, visitor_id, at(secs))
}

/// Deterministic pseudo-random footprints, duplicates included.
pub fn footprints(count: usize, seed: u64) -> Vec<FootprintRecord> {
    let mut state = seed;
    let mut next = move |bound: u64| {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (state >> 33) % bound
    };

    (0..count)
        .filter_map(|_| {
            let profile_id = next(5) as UserId;
            let visitor_id = next(8) as UserId;
            let secs = 1_000 + next(500) as i64;
            (profile_id != visitor_id).then(|| record(profile_id, visitor_id, secs))
        })
        .collect()
}

/// Event store, cache and mutation log in a scratch directory.
pub struct Harness {
    pub events: Arc<SqliteEventStore>,
    pub cache: Arc<MemoryCache>,
    pub log: Arc<MutationLog>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self {
            events: Arc::new(SqliteEventStore::open_in_memory().unwrap()),
            cache: Arc::new(MemoryCache::new()),
            log: Arc::new(MutationLog::new(dir.path().join("footprints.journal"), false)),
            dir,
        }
    }

    pub fn with_records(records: &[FootprintRecord]) -> Self {
        let harness = Self::new();
        for record in records {
            harness.events.insert(record).unwrap();
        }
        harness
    }

    pub async fn boot(&self, mode: RecoveryMode) -> Result<Footprints, StartupError> {
        self.boot_with(mode, self.cache.clone()).await
    }

    pub async fn boot_with(
        &self,
        mode: RecoveryMode,
        cache: Arc<dyn CacheStore>,
    ) -> Result<Footprints, StartupError> {
        let cache = Arc::new(JournaledCache::new(cache, self.log.clone()));
        RecoveryManager::new(mode, self.events.clone(), cache).run().await
    }
}

/// Widens the window between reading a view and writing it back.
pub struct SlowCache {
    pub inner: MemoryCache,
}

#[async_trait]
impl CacheStore for SlowCache {
    async fn upsert(&self, profile_id: UserId, visit: CanonicalVisit) -> Result<(), StoreError> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.inner.upsert(profile_id, visit).await
    }

    async fn query(
        &self,
        profile_id: UserId,
        limit: usize,
    ) -> Result<Vec<CanonicalVisit>, StoreError> {
        let visits = self.inner.query(profile_id, limit).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        visits
    }

    async fn replace(
        &self,
        profile_id: UserId,
        visits: &[CanonicalVisit],
    ) -> Result<(), StoreError> {
        self.inner.replace(profile_id, visits).await
    }

    async fn flush(&self, profile_id: UserId) -> Result<(), StoreError> {
        self.inner.flush(profile_id).await
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.inner.flush_all().await
    }

    async fn profiles(&self) -> Result<Vec<UserId>, StoreError> {
        self.inner.profiles().await
    }
}

/// Cache that can be switched off, every call then fails like a dropped connection.
#[derive(Default)]
pub struct FlakyCache {
    pub inner: MemoryCache,
    pub down: AtomicBool,
}

impl FlakyCache {
    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for FlakyCache {
    async fn upsert(&self, profile_id: UserId, visit: CanonicalVisit) -> Result<(), StoreError> {
        self.check()?;
        self.inner.upsert(profile_id, visit).await
    }

    async fn query(
        &self,
        profile_id: UserId,
        limit: usize,
    ) -> Result<Vec<CanonicalVisit>, StoreError> {
        self.check()?;
        self.inner.query(profile_id, limit).await
    }

    async fn replace(
        &self,
        profile_id: UserId,
        visits: &[CanonicalVisit],
    ) -> Result<(), StoreError> {
        self.check()?;
        self.inner.replace(profile_id, visits).await
    }

    async fn flush(&self, profile_id: UserId) -> Result<(), StoreError> {
        self.check()?;
        self.inner.flush(profile_id).await
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.check()?;
        self.inner.flush_all().await
    }

    async fn profiles(&self) -> Result<Vec<UserId>, StoreError> {
        self.check()?;
        self.inner.profiles().await
    }
}
