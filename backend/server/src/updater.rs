//! # Write-Through Updater
//!
//! Folds one new footprint into its profile's view, right after the record is stored.
//!
//! Read the view, take the max of the cached and new timestamps, write the single entry back.
//! Two visits by the same visitor racing on a profile would otherwise both read the old entry,
//! and the later write could land the lower timestamp. The sequence therefore runs under a lock
//! chosen by profile id.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    cache::CacheStore,
    error::StoreError,
    models::{CanonicalVisit, UserId},
};

const LOCK_STRIPES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Advanced,
    /// The cached entry was already as recent.
    Unchanged,
}

pub struct WriteThrough {
    cache: Arc<dyn CacheStore>,
    locks: Vec<Mutex<()>>,
}

impl WriteThrough {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self {
            cache,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock_for(&self, profile_id: UserId) -> &Mutex<()> {
        let stripe = profile_id.rem_euclid(LOCK_STRIPES as i64) as usize;
        &self.locks[stripe]
    }

    pub async fn apply_visit(
        &self,
        profile_id: UserId,
        visitor_id: UserId,
        occurred_at: DateTime<Utc>,
    ) -> Result<Applied, StoreError> {
        let _guard = self.lock_for(profile_id).lock().await;

        let view = self.cache.view(profile_id).await?;
        let current = view
            .iter()
            .find(|visit| visit.visitor_id == visitor_id)
            .map(|visit| visit.last_visit_at);

        let applied = match current {
            Some(last_visit_at) if last_visit_at >= occurred_at => return Ok(Applied::Unchanged),
            Some(_) => Applied::Advanced,
            None => Applied::Inserted,
        };

        self.cache
            .upsert(profile_id, CanonicalVisit::new(visitor_id, occurred_at))
            .await?;

        debug!("Footprint {visitor_id} -> {profile_id}: {applied:?}");

        Ok(applied)
    }
}
