//! # Footprint Seeding
//!
//! Offline counterpart of the server's rebuild.
//!
//! 1. Flush every footprint view in Redis
//! 2. Aggregate the event store into one entry per (profile, visitor)
//! 3. Write the views to Redis
//! 4. Rewrite the mutation log to exactly those views
//!
//! Servers started afterwards with `FOOTPRINTS_RECOVERY=replay` skip the event store scan entirely.
//!
//! ## Notes
//! - Run it with no server serving traffic against the same Redis, the flush in step 1 is global
//! - The log is written aside and renamed, an interrupted seed leaves the previous log intact
use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use server::{
    cache::CacheStore,
    config::Config,
    database::RedisCache,
    events::{EventStore, SqliteEventStore},
    journal::{JournaledCache, MutationLog},
    recovery::{RecoveryManager, RecoveryMode},
};
use tracing::info;

#[derive(Debug, Default)]
pub struct Overrides {
    pub database: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub journal: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(database) = self.database {
            config.database_path = database;
        }
        if let Some(redis_url) = self.redis_url {
            config.redis_url = redis_url;
        }
        if let Some(journal) = self.journal {
            config.journal_path = journal;
        }
    }
}

pub async fn load_footprints(overrides: Overrides) -> Result<()> {
    let mut config = Config::load()?;
    overrides.apply(&mut config);

    println!("Event store: {}", config.database_path.display());
    println!("Mutation log: {}\n", config.journal_path.display());

    info!("Opening event store...");
    let events = SqliteEventStore::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    info!("Connecting to Redis...");
    let redis = RedisCache::connect(&config.redis_url)
        .await
        .context("failed to connect to Redis")?;
    let log = Arc::new(MutationLog::new(&config.journal_path, true));

    let entries = seed(Arc::new(events), Arc::new(redis), log).await?;

    println!("Mutation log entries: {entries}");

    Ok(())
}

/// Rebuild `cache` from `events`, returning the number of entries in the compacted log.
pub async fn seed(
    events: Arc<dyn EventStore>,
    cache: Arc<dyn CacheStore>,
    log: Arc<MutationLog>,
) -> Result<usize> {
    let cache = Arc::new(JournaledCache::new(cache, log.clone()));

    RecoveryManager::new(RecoveryMode::Rebuild, events, cache)
        .run()
        .await
        .context("rebuild failed")?;

    let entries = fs::read_to_string(log.path())
        .with_context(|| format!("failed to read back {}", log.path().display()))?
        .lines()
        .count();

    Ok(entries)
}
