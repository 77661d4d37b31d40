//! # Footprints
//!
//! Who visited a profile, and when.
//!
//! ## Records
//!
//! - `FootprintRecord` (profile **int**, visitor **int**, occurred at **timestamp**): one immutable visit event.
//!   Lives in the relational event store, never updated or deleted by this layer.
//!
//! - `CanonicalVisit` (visitor **int**, last visit **timestamp**): the most recent visit by a visitor to a profile.
//!   Exactly one per (profile, visitor), derived from the records.
//!
//! ## Redis
//!
//! - Sorted set per profile under `footprints:<profile_id>`
//! - Member: JSON encoded `CanonicalVisit`
//! - Score: negated microseconds since the epoch, so rank 0 is the latest visit
//! - Microseconds instead of nanoseconds since Redis scores are `f64`, exact only up to 2^53
use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub type UserId = i64;

pub const KEY_PREFIX: &str = "footprints";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FootprintRecord {
    pub profile_id: UserId,
    pub visitor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

impl FootprintRecord {
    pub fn new(profile_id: UserId, visitor_id: UserId, occurred_at: DateTime<Utc>) -> Self {
        Self {
            profile_id,
            visitor_id,
            occurred_at,
        }
    }

    pub fn key(&self) -> VisitKey {
        VisitKey {
            profile_id: self.profile_id,
            visitor_id: self.visitor_id,
        }
    }
}

/// Composite (profile, visitor) key used to group records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VisitKey {
    pub profile_id: UserId,
    pub visitor_id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalVisit {
    pub visitor_id: UserId,
    pub last_visit_at: DateTime<Utc>,
}

impl CanonicalVisit {
    pub fn new(visitor_id: UserId, last_visit_at: DateTime<Utc>) -> Self {
        Self {
            visitor_id,
            last_visit_at,
        }
    }

    pub fn score(&self) -> f64 {
        score(self.last_visit_at)
    }

    pub fn encode(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(member: &str) -> Result<Self, StoreError> {
        serde_json::from_str(member).map_err(|e| StoreError::Integrity(format!("{member:?}: {e}")))
    }
}

/// Most recent first, ties broken by ascending visitor.
pub fn recency(a: &CanonicalVisit, b: &CanonicalVisit) -> Ordering {
    b.last_visit_at
        .cmp(&a.last_visit_at)
        .then(a.visitor_id.cmp(&b.visitor_id))
}

pub fn score(at: DateTime<Utc>) -> f64 {
    -(at.timestamp_micros() as f64)
}

/// Nanoseconds since the epoch, for timestamps between 1677 and 2262.
pub fn nanos(at: DateTime<Utc>) -> Result<i64, StoreError> {
    at.timestamp_nanos_opt().ok_or(StoreError::OutOfRange(at))
}

pub fn cache_key(profile_id: UserId) -> String {
    format!("{KEY_PREFIX}:{profile_id}")
}
