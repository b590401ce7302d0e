//! Error types for Eternal Sentinel.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the sentinel core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// State-store errors. The tagged variants (`NotFound`, `AlreadyResolved`,
/// `Expired`, `Conflict`) are part of the confirmation contract and must stay
/// matchable at the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Entity not found: {entity} {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Check-in is already resolved")]
    AlreadyResolved,

    #[error("Artifact used after its deadline")]
    Expired,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether the caller should retry (queue backoff / HTTP 503).
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Job-queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue backend unavailable: {0}")]
    Unavailable(String),

    #[error("Queue query failed: {0}")]
    Query(String),

    #[error("Job {id} not found")]
    JobNotFound { id: Uuid },

    #[error("Malformed job payload for {id}: {reason}")]
    MalformedPayload { id: Uuid, reason: String },
}

/// Outbound transport errors. All variants are retriable by the queue.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{channel} send failed: {reason}")]
    SendFailed { channel: &'static str, reason: String },

    #[error("{channel} recipient could not be resolved")]
    NoRecipient { channel: &'static str },

    #[error("{channel} transport is not configured")]
    NotConfigured { channel: &'static str },
}

/// Worker-execution errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} exceeded its wall-clock budget of {budget:?}")]
    Timeout { id: Uuid, budget: Duration },

    #[error("Job {id} failed: {reason}")]
    Failed { id: Uuid, reason: String },

    #[error("Invariant violation in job {id}: {reason}")]
    Invariant { id: Uuid, reason: String },
}

/// Result type alias for the sentinel core.
pub type Result<T> = std::result::Result<T, Error>;
