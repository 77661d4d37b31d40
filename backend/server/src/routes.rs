use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
};
use chrono::Utc;
use serde::Deserialize;

use crate::{
    error::AppError,
    models::{CanonicalVisit, UserId},
    state::AppState,
};

#[derive(Deserialize)]
pub struct Visit {
    visitor_id: UserId,
}

#[derive(Deserialize)]
pub struct Page {
    limit: Option<usize>,
}

pub async fn visits_handler(
    State(state): State<Arc<AppState>>,
    Path(profile_id): Path<UserId>,
    payload: Result<Json<Visit>, JsonRejection>,
) -> Result<StatusCode, AppError> {
    let Json(visit) = payload.map_err(|_| AppError::MalformedPayload)?;

    state
        .footprints
        .record_visit(profile_id, visit.visitor_id, Utc::now())
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn footprints_handler(
    State(state): State<Arc<AppState>>,
    Path(profile_id): Path<UserId>,
    Query(page): Query<Page>,
) -> Json<Vec<CanonicalVisit>> {
    let limit = state.config.limit(page.limit);

    Json(
        state
            .footprints
            .query_recent_visitors(profile_id, limit)
            .await,
    )
}
