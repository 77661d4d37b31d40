//! # Derived Cache Store
//!
//! Ranked view of footprints, one per profile, serving every read.
//!
//! ## Contract
//!
//! - `upsert`: insert or replace the single entry for a visitor
//! - `query`: up to `limit` entries, latest first
//! - `replace`: swap a whole view in one step
//! - `flush` / `flush_all`: drop one or every view
//! - `profiles`: every profile with a view
//!
//! Deduplication is kept by writers. Readers only skip members that fail to decode.
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use crate::{
    error::StoreError,
    models::{CanonicalVisit, UserId, cache_key, nanos, recency},
};

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Insert or replace the entry for `visit.visitor_id`, whatever its current timestamp.
    async fn upsert(&self, profile_id: UserId, visit: CanonicalVisit) -> Result<(), StoreError>;

    async fn query(&self, profile_id: UserId, limit: usize)
    -> Result<Vec<CanonicalVisit>, StoreError>;

    /// The whole view for `profile_id`.
    async fn view(&self, profile_id: UserId) -> Result<Vec<CanonicalVisit>, StoreError> {
        self.query(profile_id, usize::MAX).await
    }

    /// Atomically swap the view for `profile_id` with `visits`.
    async fn replace(
        &self,
        profile_id: UserId,
        visits: &[CanonicalVisit],
    ) -> Result<(), StoreError>;

    async fn flush(&self, profile_id: UserId) -> Result<(), StoreError>;

    async fn flush_all(&self) -> Result<(), StoreError>;

    /// Profiles that currently hold a view, in no particular order.
    async fn profiles(&self) -> Result<Vec<UserId>, StoreError>;
}

/// Decode raw members, logging and skipping the ones that are corrupt.
pub fn decode_members<I>(profile_id: UserId, members: I) -> Vec<CanonicalVisit>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    members
        .into_iter()
        .filter_map(|member| match CanonicalVisit::decode(member.as_ref()) {
            Ok(visit) => Some(visit),
            Err(e) => {
                warn!("Skipping entry in {}: {e}", cache_key(profile_id));
                None
            }
        })
        .collect()
}

/// Sorted sets in process memory. Same encoding and ordering as the Redis store.
#[derive(Default)]
pub struct MemoryCache {
    views: Mutex<HashMap<UserId, BTreeMap<Rank, String>>>,
}

/// Ascending rank: most recent first, then ascending visitor. Members stored
/// with `insert_raw` carry no visitor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Rank {
    recency: i64,
    visitor_id: Option<UserId>,
    member: String,
}

impl Rank {
    fn of(visit: &CanonicalVisit, member: String) -> Result<Self, StoreError> {
        Ok(Self {
            recency: -nanos(visit.last_visit_at)?,
            visitor_id: Some(visit.visitor_id),
            member,
        })
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw members of a view in rank order, exactly as stored.
    pub fn members(&self, profile_id: UserId) -> Vec<String> {
        self.views
            .lock()
            .get(&profile_id)
            .map(|view| view.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every non-empty view's raw members, keyed by profile.
    pub fn dump(&self) -> BTreeMap<UserId, Vec<String>> {
        self.views
            .lock()
            .iter()
            .filter(|(_, view)| !view.is_empty())
            .map(|(profile_id, view)| (*profile_id, view.values().cloned().collect()))
            .collect()
    }

    /// Store a member verbatim, bypassing the codec.
    pub fn insert_raw(&self, profile_id: UserId, recency: i64, member: &str) {
        let rank = Rank {
            recency,
            visitor_id: None,
            member: member.to_string(),
        };
        self.views
            .lock()
            .entry(profile_id)
            .or_default()
            .insert(rank, member.to_string());
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn upsert(&self, profile_id: UserId, visit: CanonicalVisit) -> Result<(), StoreError> {
        let member = visit.encode()?;
        let rank = Rank::of(&visit, member.clone())?;

        let mut views = self.views.lock();
        let view = views.entry(profile_id).or_default();
        view.retain(|rank, _| rank.visitor_id != Some(visit.visitor_id));
        view.insert(rank, member);

        Ok(())
    }

    async fn query(
        &self,
        profile_id: UserId,
        limit: usize,
    ) -> Result<Vec<CanonicalVisit>, StoreError> {
        let members: Vec<String> = {
            let views = self.views.lock();
            match views.get(&profile_id) {
                Some(view) => view.values().take(limit).cloned().collect(),
                None => return Ok(Vec::new()),
            }
        };

        let mut visits = decode_members(profile_id, members);
        visits.sort_by(recency);

        Ok(visits)
    }

    async fn replace(
        &self,
        profile_id: UserId,
        visits: &[CanonicalVisit],
    ) -> Result<(), StoreError> {
        let mut view = BTreeMap::new();
        for visit in visits {
            let member = visit.encode()?;
            view.insert(Rank::of(visit, member.clone())?, member);
        }

        self.views.lock().insert(profile_id, view);

        Ok(())
    }

    async fn flush(&self, profile_id: UserId) -> Result<(), StoreError> {
        self.views.lock().remove(&profile_id);

        Ok(())
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.views.lock().clear();

        Ok(())
    }

    async fn profiles(&self) -> Result<Vec<UserId>, StoreError> {
        Ok(self
            .views
            .lock()
            .iter()
            .filter(|(_, view)| !view.is_empty())
            .map(|(profile_id, _)| *profile_id)
            .collect())
    }
}
