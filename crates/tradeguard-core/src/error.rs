//! Error types for the risk control engine.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No risk assessment on file for user {user}")]
    MissingRiskAssessment { user: String },

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("Override required to lift halt {halt_id}")]
    OverrideRequired { halt_id: Uuid },

    #[error("Halt {0} not found")]
    HaltNotFound(Uuid),

    #[error("Circuit breaker {0} not found")]
    BreakerNotFound(Uuid),

    #[error("User {0} has no risk limits initialized")]
    UserNotInitialized(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
