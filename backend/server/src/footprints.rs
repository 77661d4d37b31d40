use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::spawn_blocking;
use tracing::{error, warn};

use crate::{
    cache::CacheStore,
    error::StoreError,
    events::EventStore,
    models::{CanonicalVisit, FootprintRecord, UserId},
    updater::WriteThrough,
};

/// Entry point for the rest of the site. Only handed out once recovery has
/// brought the cache to a consistent state.
pub struct Footprints {
    events: Arc<dyn EventStore>,
    cache: Arc<dyn CacheStore>,
    updater: WriteThrough,
}

impl Footprints {
    pub(crate) fn new(events: Arc<dyn EventStore>, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            events,
            updater: WriteThrough::new(cache.clone()),
            cache,
        }
    }

    /// Store the visit, then fold it into the cached view.
    ///
    /// Only the event store write can fail the call. The record is authoritative
    /// once stored, so a failed cache update is logged and left for the next rebuild.
    pub async fn record_visit(
        &self,
        profile_id: UserId,
        visitor_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if profile_id == visitor_id {
            return Ok(());
        }

        let record = FootprintRecord::new(profile_id, visitor_id, now);
        let events = self.events.clone();
        spawn_blocking(move || events.insert(&record)).await??;

        if let Err(e) = self.updater.apply_visit(profile_id, visitor_id, now).await {
            error!("Failed to cache footprint {visitor_id} -> {profile_id}: {e}");
        }

        Ok(())
    }

    /// Latest visitors first. Never fails: a broken cache falls back to the
    /// event store, and a broken event store yields nothing.
    pub async fn query_recent_visitors(
        &self,
        profile_id: UserId,
        limit: usize,
    ) -> Vec<CanonicalVisit> {
        let e = match self.cache.query(profile_id, limit).await {
            Ok(visits) => return visits,
            Err(e) => e,
        };

        warn!("Footprint cache unavailable for {profile_id}, reading event store: {e}");

        let events = self.events.clone();
        match spawn_blocking(move || events.recent_visitors(profile_id, limit)).await {
            Ok(Ok(visits)) => visits,
            Ok(Err(e)) => {
                error!("Failed to read footprints of {profile_id}: {e}");
                Vec::new()
            }
            Err(e) => {
                error!("Failed to read footprints of {profile_id}: {e}");
                Vec::new()
            }
        }
    }
}
