//! # Recovery
//!
//! Brings the cache to a known state before any traffic is served.
//!
//! ```text
//! Init --rebuild--> Rebuilding --> Ready
//!   \                    \
//!    \--replay--> Replaying --> Ready
//!                        \
//!                         +-----> Fatal
//! ```
//!
//! - Rebuild (default): flush everything, aggregate the event store, then compact the mutation
//!   log down to the rebuilt views.
//! - Replay: flush everything, apply the mutation log in order, then compact the log down to the
//!   replayed views. A missing log is fatal.
//!
//! The mutation log is suspended throughout and resumed only once Ready.
//! `Footprints` can only be obtained from a successful run.
use std::{collections::BTreeMap, fmt, iter, str::FromStr, sync::Arc};

use tokio::task::spawn_blocking;
use tracing::{error, info};

use crate::{
    aggregate::AggregationEngine,
    cache::CacheStore,
    error::{StartupError, StoreError},
    events::EventStore,
    footprints::Footprints,
    journal::{JournaledCache, Mutation},
    models::{CanonicalVisit, UserId},
};

type Views = BTreeMap<UserId, Vec<CanonicalVisit>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryMode {
    #[default]
    Rebuild,
    Replay,
}

impl FromStr for RecoveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rebuild" => Ok(RecoveryMode::Rebuild),
            "replay" => Ok(RecoveryMode::Replay),
            other => Err(format!("unknown recovery mode {other:?}")),
        }
    }
}

impl fmt::Display for RecoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryMode::Rebuild => f.write_str("rebuild"),
            RecoveryMode::Replay => f.write_str("replay"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Init,
    Rebuilding,
    Replaying,
    Ready,
    Fatal,
}

pub struct RecoveryManager {
    mode: RecoveryMode,
    state: RecoveryState,
    events: Arc<dyn EventStore>,
    cache: Arc<JournaledCache>,
}

impl RecoveryManager {
    pub fn new(mode: RecoveryMode, events: Arc<dyn EventStore>, cache: Arc<JournaledCache>) -> Self {
        Self {
            mode,
            state: RecoveryState::Init,
            events,
            cache,
        }
    }

    fn transition(&mut self, next: RecoveryState) {
        info!("Recovery {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub async fn run(mut self) -> Result<Footprints, StartupError> {
        self.cache.log().suspend();

        let outcome = match self.mode {
            RecoveryMode::Rebuild => self.rebuild().await,
            RecoveryMode::Replay => self.replay().await,
        };

        if let Err(e) = outcome {
            self.transition(RecoveryState::Fatal);
            error!("Footprint cache recovery failed: {e}");
            return Err(e);
        }

        self.cache.log().resume();
        self.transition(RecoveryState::Ready);

        let cache: Arc<dyn CacheStore> = self.cache;
        Ok(Footprints::new(self.events, cache))
    }

    async fn rebuild(&mut self) -> Result<(), StartupError> {
        self.transition(RecoveryState::Rebuilding);

        self.cache.flush_all().await?;

        let cache: Arc<dyn CacheStore> = self.cache.clone();
        let rebuild = AggregationEngine::new(self.events.clone(), cache)
            .rebuild_all()
            .await?;

        let written = self.compact(&rebuild.views).await?;
        info!(
            "Rebuilt {} visits from {} footprints, mutation log compacted to {written} entries",
            rebuild.visits(),
            rebuild.records
        );

        Ok(())
    }

    async fn replay(&mut self) -> Result<(), StartupError> {
        self.transition(RecoveryState::Replaying);

        let log = self.cache.log().clone();
        let exists = tokio::fs::try_exists(log.path())
            .await
            .map_err(StoreError::Io)?;
        if !exists {
            return Err(StartupError::MissingLog(log.path().to_path_buf()));
        }

        self.cache.flush_all().await?;

        let applied = log.replay(&*self.cache).await?;

        let views = self.views().await?;
        let written = self.compact(&views).await?;
        info!(
            "Replayed {applied} mutations from {}, compacted to {written} entries",
            log.path().display()
        );

        Ok(())
    }

    /// Every view currently held by the cache.
    async fn views(&self) -> Result<Views, StoreError> {
        let mut views = Views::new();
        for profile_id in self.cache.profiles().await? {
            let visits = self.cache.view(profile_id).await?;
            if !visits.is_empty() {
                views.insert(profile_id, visits);
            }
        }

        Ok(views)
    }

    /// Rewrite the mutation log to exactly `views`.
    async fn compact(&self, views: &Views) -> Result<usize, StoreError> {
        let log = self.cache.log().clone();
        let mutations = compacted(views);

        spawn_blocking(move || log.rewrite(mutations)).await?
    }
}

/// The log equivalent of a set of views: wipe, then one upsert per canonical visit.
fn compacted(views: &Views) -> Vec<Mutation> {
    iter::once(Mutation::FlushAll)
        .chain(views.iter().flat_map(|(profile_id, visits)| {
            visits.iter().map(move |visit| Mutation::Upsert {
                profile_id: *profile_id,
                visit: *visit,
            })
        }))
        .collect()
}
