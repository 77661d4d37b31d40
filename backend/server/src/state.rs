use std::sync::Arc;

use crate::{
    cache::CacheStore,
    config::Config,
    database::RedisCache,
    error::{StartupError, StoreError},
    events::{EventStore, SqliteEventStore},
    footprints::Footprints,
    journal::{JournaledCache, MutationLog},
    recovery::RecoveryManager,
};

pub struct AppState {
    pub config: Config,
    pub footprints: Footprints,
}

impl AppState {
    pub async fn new() -> Result<Arc<Self>, StartupError> {
        let config = Config::load()?;
        let footprints = init_footprints(&config).await?;

        Ok(Arc::new(Self { config, footprints }))
    }
}

/// Open both stores and run recovery in the configured mode.
pub async fn init_footprints(config: &Config) -> Result<Footprints, StartupError> {
    let database_path = config.database_path.clone();
    let events = tokio::task::spawn_blocking(move || SqliteEventStore::open(&database_path))
        .await
        .map_err(StoreError::from)??;
    let events: Arc<dyn EventStore> = Arc::new(events);

    let redis: Arc<dyn CacheStore> = Arc::new(RedisCache::connect(&config.redis_url).await?);
    let log = Arc::new(MutationLog::new(&config.journal_path, config.journal_fsync));
    let cache = Arc::new(JournaledCache::new(redis, log));

    RecoveryManager::new(config.recovery, events, cache).run().await
}
