use std::io;
use std::time::Duration;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("geocoding quota exhausted for current key")]
    QuotaExhausted,
    #[error("geocoding provider returned unrecognized status: {0}")]
    Provider(String),
    #[error("geocoding retry budget of {0:?} exhausted")]
    RetryBudgetExceeded(Duration),
    #[error("worker task failed: {0}")]
    Task(String),
}

impl AppError {
    /// Quota exhaustion and transport failures are transient; everything
    /// else aborts the resolution attempt immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::QuotaExhausted | AppError::Http(_))
    }
}
