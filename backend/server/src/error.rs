use std::{io, path::PathBuf};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinError;

/// Failures talking to either store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] JoinError),

    #[error("Corrupt cache entry: {0}")]
    Integrity(String),

    #[error("Timestamp {0} outside the storable range")]
    OutOfRange(DateTime<Utc>),
}

/// Anything that keeps the process from reaching a ready cache.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Environment misconfigured: {0}")]
    Config(String),

    #[error("Mutation log {} does not exist", .0.display())]
    MissingLog(PathBuf),

    #[error("Mutation log corrupt at line {line}: {reason}")]
    CorruptLog { line: usize, reason: String },

    #[error("Store failure during recovery: {0}")]
    Store(#[from] StoreError),

    #[error("Listener failed: {0}")]
    Listener(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Malformed payload")]
    MalformedPayload,

    #[error("Internal error: {0}")]
    InternalError(#[from] StoreError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::MalformedPayload => StatusCode::BAD_REQUEST,
            AppError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}
