//! Footprint cache for the social site: who visited a profile, and when.
//!
//!
//!
//! # General Infrastructure
//! - Visits are stored as immutable rows in the relational event store
//! - Redis holds one sorted set per profile with each visitor's latest visit
//! - Page rendering only ever reads Redis
//! - Every write to Redis is also appended to a mutation log on disk
//!
//!
//!
//! # Keeping Redis Honest
//!
//! **Goal**: Redis never serves a view that disagrees with the event store in anything but freshness.
//!
//! - A visit is written to the event store first, then folded into Redis
//! - The fold runs under a per-profile lock, two racing visits cannot lose the later timestamp
//! - At boot nothing is served until the cache is either rebuilt or replayed
//! - A rebuild aggregates the whole event store, then compacts the mutation log to the result
//! - A replay wipes Redis and reapplies the mutation log, a missing log aborts startup
//!
//!
//!
//! # Notes
//!
//! ## Redis + SQL
//! The event store alone could answer "latest visitors" with a `GROUP BY`. But, it is on the hot path of
//! every profile page and the aggregate has to touch every footprint of the profile. Redis gives us the
//! latest N visitors in one range read.
//!
//! We do run into an issue of syncing. Write-through is not transactional across both stores, a visit can be
//! durable before its view is updated. Readers see a slightly stale page, never a corrupted one. If Redis is
//! unreachable reads fall back to the `GROUP BY`.
//!
//!
//!
//! # Setup
//!
//! View current docs.
//! ```sh
//! cargo doc --open
//! ```
//!
//!
//!
//! # Environment
//!
//! Boot from the event store (default).
//! ```sh
//! FOOTPRINTS_RECOVERY=rebuild cargo run -p footprints
//! ```
//!
//! Boot from the mutation log left by a previous run or by `seed`.
//! ```sh
//! FOOTPRINTS_RECOVERY=replay cargo run -p footprints
//! ```
//!
//! Redis over a unix socket.
//! ```sh
//! REDIS_URL=redis+unix:///var/run/redis/redis.sock cargo run -p footprints
//! ```
use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    http::{Method, header::CONTENT_TYPE},
    routing::{get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod footprints;
pub mod journal;
pub mod models;
pub mod recovery;
pub mod routes;
pub mod state;
pub mod updater;

use error::StartupError;
use routes::{footprints_handler, visits_handler};
use state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/profiles/{profile_id}/visits", post(visits_handler))
        .route("/profiles/{profile_id}/footprints", get(footprints_handler))
        .with_state(state)
}

pub async fn start_server() -> Result<(), StartupError> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Initializing state...");
    let state = AppState::new().await?;

    info!("Starting server...");

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    let app = router(state.clone()).layer(cors);

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address)
        .await
        .map_err(StartupError::Listener)?;
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(StartupError::Listener)?;

    info!("Server shutting down...");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
