use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("weather request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected weather response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("fleet request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("fleet session expired: {0}")]
    SessionExpired(String),
    #[error("fleet API error [{method}]: {message}")]
    Api { method: String, message: String },
    #[error("fleet authentication failed: {0}")]
    Auth(String),
    #[error("unexpected fleet response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl FleetError {
    pub fn is_session_expired(&self) -> bool {
        matches!(self, FleetError::SessionExpired(_))
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Fleet(#[from] FleetError),
    #[error("SMS request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("SMS provider returned HTTP {0}")]
    HttpStatus(u16),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored JSON is invalid: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stored value is invalid: {0}")]
    Corrupt(String),
    #[error("open hold {0} not found")]
    HoldNotFound(uuid::Uuid),
    #[error("site {0} already has an open hold")]
    HoldAlreadyOpen(uuid::Uuid),
    #[error("database worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Anything that aborts a single site's pipeline for the current cycle.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Weather(#[from] WeatherError),
    #[error(transparent)]
    Fleet(#[from] FleetError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
