use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid SQL identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model service request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("model service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("no model registered for variable {0:?}")]
    UnknownVariable(String),
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid model service URL {0}")]
    InvalidUrl(String),
    #[error("model failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("no trained models available; nothing to score")]
    NoModels,
    #[error("model registry unavailable: {0}")]
    Registry(#[source] ModelError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type StoreResult<T> = Result<T, StoreError>;
