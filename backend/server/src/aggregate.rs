//! # Aggregation Engine
//!
//! Bulk construction of every footprint view from the event store.
//!
//! 1. Scan every record once, keeping the max timestamp per (profile, visitor)
//! 2. Group the max map by profile, sorted latest first
//! 3. Replace each profile's view in one step
//!
//! Only the max map is held in memory, never the records themselves.
//! Runs at boot with no traffic against the cache.
use std::{
    collections::{BTreeMap, HashMap, hash_map::Entry},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use tokio::task::spawn_blocking;
use tracing::info;

use crate::{
    cache::CacheStore,
    error::StoreError,
    events::EventStore,
    models::{CanonicalVisit, FootprintRecord, UserId, VisitKey, recency},
};

/// Latest visit per (profile, visitor).
#[derive(Debug, Default, Clone)]
pub struct Aggregate {
    latest: HashMap<VisitKey, DateTime<Utc>>,
}

impl Aggregate {
    pub fn observe(&mut self, record: FootprintRecord) {
        match self.latest.entry(record.key()) {
            Entry::Vacant(entry) => {
                entry.insert(record.occurred_at);
            }
            Entry::Occupied(mut entry) => {
                if record.occurred_at > *entry.get() {
                    entry.insert(record.occurred_at);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    /// One sorted view per profile.
    pub fn into_views(self) -> BTreeMap<UserId, Vec<CanonicalVisit>> {
        let mut views: BTreeMap<UserId, Vec<CanonicalVisit>> = BTreeMap::new();
        for (key, last_visit_at) in self.latest {
            views
                .entry(key.profile_id)
                .or_default()
                .push(CanonicalVisit::new(key.visitor_id, last_visit_at));
        }

        for visits in views.values_mut() {
            visits.sort_by(recency);
        }

        views
    }
}

impl FromIterator<FootprintRecord> for Aggregate {
    fn from_iter<T: IntoIterator<Item = FootprintRecord>>(records: T) -> Self {
        let mut aggregate = Aggregate::default();
        for record in records {
            aggregate.observe(record);
        }
        aggregate
    }
}

#[derive(Debug, Default)]
pub struct Rebuild {
    pub records: u64,
    pub views: BTreeMap<UserId, Vec<CanonicalVisit>>,
}

impl Rebuild {
    pub fn visits(&self) -> usize {
        self.views.values().map(Vec::len).sum()
    }
}

pub struct AggregationEngine {
    events: Arc<dyn EventStore>,
    cache: Arc<dyn CacheStore>,
}

impl AggregationEngine {
    pub fn new(events: Arc<dyn EventStore>, cache: Arc<dyn CacheStore>) -> Self {
        Self { events, cache }
    }

    pub async fn scan(&self) -> Result<(u64, Aggregate), StoreError> {
        let events = self.events.clone();

        spawn_blocking(move || {
            let mut aggregate = Aggregate::default();
            let records = events.scan(&mut |record| aggregate.observe(record))?;
            Ok::<_, StoreError>((records, aggregate))
        })
        .await?
    }

    /// Rebuild every view from the event store. Views of profiles without any
    /// record are left alone, callers flush first.
    pub async fn rebuild_all(&self) -> Result<Rebuild, StoreError> {
        let (records, aggregate) = self.scan().await?;
        info!(
            "Scanned {records} footprints into {} canonical visits",
            aggregate.len()
        );

        let views = aggregate.into_views();
        for (profile_id, visits) in &views {
            self.cache.replace(*profile_id, visits).await?;
        }

        info!("Rebuilt {} footprint views", views.len());

        Ok(Rebuild { records, views })
    }
}
