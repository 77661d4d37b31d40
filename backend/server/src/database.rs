//! # Redis
//!
//! RAM database.
//!
//! Core purpose is to serve the footprint views without touching the relational store on every page.
//!
//! ## Requirements
//!
//! - Latest N visitors of a profile in one round trip
//! - One entry per visitor, always holding their latest visit
//! - Whole views replaced atomically during a rebuild
//!
//! ## Implementation
//!
//! - Redis sorted set per profile: `footprints:<profile_id>`
//! - Member: JSON `{"visitor_id":..,"last_visit_at":..}`
//! - Score: negated microseconds, so `ZRANGE key 0 N-1` is the latest N
//! - Replacing a visitor's entry is `ZREM` + `ZADD` inside `MULTI`
//! - Equal scores come back in member byte order. The adapter re-reads the score band at the
//!   page boundary and orders it by visitor
use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use redis::{
    AsyncCommands, Client,
    aio::{ConnectionManager, ConnectionManagerConfig},
};

use crate::{
    cache::{CacheStore, decode_members},
    error::StoreError,
    models::{CanonicalVisit, KEY_PREFIX, UserId, cache_key, recency},
};
use tracing::warn;

const SCAN_BATCH: usize = 500;

pub async fn init_redis(redis_url: &str) -> Result<ConnectionManager, StoreError> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = Client::open(redis_url)?;
    let connection_manager = client.get_connection_manager_with_config(config).await?;

    Ok(connection_manager)
}

#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(init_redis(redis_url).await?))
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{KEY_PREFIX}:*");

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn upsert(&self, profile_id: UserId, visit: CanonicalVisit) -> Result<(), StoreError> {
        let key = cache_key(profile_id);
        let member = visit.encode()?;
        let mut conn = self.connection.clone();

        let members: Vec<String> = conn.zrange(&key, 0, -1).await?;
        let stale = stale_members(members, &visit, &member);

        let mut pipe = redis::pipe();
        pipe.atomic();
        for existing in stale {
            pipe.zrem(&key, existing).ignore();
        }
        pipe.zadd(&key, &member, visit.score()).ignore();
        pipe.query_async::<()>(&mut conn).await?;

        Ok(())
    }

    async fn query(
        &self,
        profile_id: UserId,
        limit: usize,
    ) -> Result<Vec<CanonicalVisit>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let key = cache_key(profile_id);
        let mut conn = self.connection.clone();

        let stop = isize::try_from(limit - 1).unwrap_or(-1);
        let page: Vec<(String, f64)> = conn.zrange_withscores(&key, 0, stop).await?;

        let band = match boundary_score(&page, limit) {
            Some(boundary) => {
                let members: Vec<String> = conn.zrangebyscore(&key, boundary, boundary).await?;
                Some((boundary, members))
            }
            None => None,
        };

        Ok(merge_page(profile_id, page, band, limit))
    }

    async fn replace(
        &self,
        profile_id: UserId,
        visits: &[CanonicalVisit],
    ) -> Result<(), StoreError> {
        let key = cache_key(profile_id);
        let items = visits
            .iter()
            .map(|visit| Ok((visit.score(), visit.encode()?)))
            .collect::<Result<Vec<(f64, String)>, StoreError>>()?;

        let mut pipe = redis::pipe();
        pipe.atomic().del(&key).ignore();
        if !items.is_empty() {
            pipe.zadd_multiple(&key, items.as_slice()).ignore();
        }

        let mut conn = self.connection.clone();
        pipe.query_async::<()>(&mut conn).await?;

        Ok(())
    }

    async fn flush(&self, profile_id: UserId) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(cache_key(profile_id)).await?;

        Ok(())
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        let keys = self.keys().await?;

        let mut conn = self.connection.clone();
        for chunk in keys.chunks(SCAN_BATCH) {
            let _: () = conn.del(chunk).await?;
        }

        Ok(())
    }

    async fn profiles(&self) -> Result<Vec<UserId>, StoreError> {
        let prefix = format!("{KEY_PREFIX}:");
        let profiles: Vec<UserId> = self
            .keys()
            .await?
            .into_iter()
            .filter_map(|key| match key.strip_prefix(&prefix).map(str::parse::<UserId>) {
                Some(Ok(profile_id)) => Some(profile_id),
                _ => {
                    warn!("Ignoring foreign key {key}");
                    None
                }
            })
            .collect();

        Ok(profiles)
    }
}

/// Members of a view that hold an older entry for `visit`'s visitor.
fn stale_members(members: Vec<String>, visit: &CanonicalVisit, member: &str) -> Vec<String> {
    members
        .into_iter()
        .filter(|existing| {
            existing != member
                && CanonicalVisit::decode(existing)
                    .is_ok_and(|current| current.visitor_id == visit.visitor_id)
        })
        .collect()
}

/// Score of the last entry of a full page. Entries sharing it may continue past the page.
fn boundary_score(page: &[(String, f64)], limit: usize) -> Option<f64> {
    match page.last() {
        Some((_, score)) if page.len() == limit => Some(*score),
        _ => None,
    }
}

/// Combine a ranked page with the full band of entries at its boundary score, then order by
/// recency. Redis orders equal scores by member bytes, which is not the visitor order.
fn merge_page(
    profile_id: UserId,
    page: Vec<(String, f64)>,
    band: Option<(f64, Vec<String>)>,
    limit: usize,
) -> Vec<CanonicalVisit> {
    let members: Vec<String> = match band {
        Some((boundary, band)) => {
            let mut seen = HashSet::new();
            page.into_iter()
                .filter(|(_, score)| *score != boundary)
                .map(|(member, _)| member)
                .chain(band)
                .filter(|member| seen.insert(member.clone()))
                .collect()
        }
        None => page.into_iter().map(|(member, _)| member).collect(),
    };

    let mut visits = decode_members(profile_id, members);
    visits.sort_by(recency);
    visits.truncate(limit);

    visits
}
