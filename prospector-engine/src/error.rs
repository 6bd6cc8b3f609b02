//! Engine error types
//!
//! Command-level errors surface to the caller; probe-level failures are
//! recorded as result rows and never appear here (see [`crate::clients`]).

use std::fmt;
use thiserror::Error;

/// Result type alias using the engine error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Input violates a declared constraint; returned to the caller, never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller does not own the entity
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Optimistic concurrency check failed
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Command not legal in the campaign's current phase/status
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Store reported a retryable fault; surfaced only after the retry bound
    #[error("Transient store error: {0}")]
    TransientStore(String),

    /// Phase cannot start because the eligible proxy set is empty
    #[error("No healthy proxy available")]
    NoProxyAvailable,

    /// Queue watermark exceeded; the operator must retry
    #[error("Overloaded: {0}")]
    Overloaded(String),

    /// Unrecoverable worker error; moves the phase to `failed`
    #[error("Worker fatal: {0}")]
    WorkerFatal(String),

    /// Payload could not be serialized or deserialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal engine error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Validation error from anything displayable
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Not-found error naming the missing entity
    pub fn not_found(entity: impl fmt::Display) -> Self {
        Self::NotFound(entity.to_string())
    }

    /// Invalid-state error naming the rejected command and observed state
    pub fn invalid_state(command: impl fmt::Display, state: impl fmt::Display) -> Self {
        Self::InvalidState(format!("{command} not permitted in {state}"))
    }

    /// Whether a retry at the same level may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::TransientStore(_) | Self::Overloaded(_))
    }

    /// Stable machine-readable kind, used in events and audit details
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::InvalidState(_) => "invalid_state",
            Self::TransientStore(_) => "transient_store",
            Self::NoProxyAvailable => "no_proxy_available",
            Self::Overloaded(_) => "overloaded",
            Self::WorkerFatal(_) => "worker_fatal",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error as E;
        match &err {
            E::RowNotFound => Error::NotFound("row not found".to_string()),
            E::PoolTimedOut | E::PoolClosed | E::WorkerCrashed => {
                Error::TransientStore(err.to_string())
            }
            E::Io(_) | E::Tls(_) => Error::TransientStore(err.to_string()),
            E::Database(db_err) => {
                if db_err.is_unique_violation() {
                    Error::Conflict(db_err.to_string())
                } else if db_err.is_foreign_key_violation() || db_err.is_check_violation() {
                    Error::Validation(db_err.to_string())
                } else {
                    Error::Internal(err.to_string())
                }
            }
            _ => Error::Internal(err.to_string()),
        }
    }
}
