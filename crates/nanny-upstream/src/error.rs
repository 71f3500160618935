//! Adapter errors and their mapping onto engine errors.

use nanny_core::error::NannyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("HTTP error calling {url}: {msg}")]
    Http { url: String, msg: String },

    #[error("{url} answered {status}")]
    Status { url: String, status: u16 },

    #[error("cannot decode {what}: {msg}")]
    Decode { what: String, msg: String },

    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    #[error("no {0} endpoint in the service catalog")]
    NoEndpoint(String),

    #[error("update on {table} affected no rows for key {key}")]
    NoRows { table: String, key: String },
}

pub type Result<T> = std::result::Result<T, UpstreamError>;

impl UpstreamError {
    pub fn http(url: &str, e: reqwest::Error) -> Self {
        UpstreamError::Http {
            url: url.to_string(),
            msg: e.to_string(),
        }
    }

    pub fn decode(what: impl Into<String>, msg: impl ToString) -> Self {
        UpstreamError::Decode {
            what: what.into(),
            msg: msg.to_string(),
        }
    }

    /// Worth retrying: connection problems and 5xx/429 answers.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Http { .. } => true,
            UpstreamError::Status { status, .. } => *status >= 500 || *status == 429,
            UpstreamError::Sql(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// Error raised while reading an upstream inventory.
    pub fn observing(self, upstream: &str) -> NannyError {
        match self {
            UpstreamError::Decode { what, msg } => NannyError::Structural {
                msg: format!("{} returned malformed {}: {}", upstream, what, msg),
            },
            other => NannyError::unavailable(upstream, other),
        }
    }

    /// Error raised while applying a mutation.
    pub fn repairing(self) -> NannyError {
        match self {
            UpstreamError::NoRows { table, key } => NannyError::NoRowsAffected { table, key },
            other => NannyError::repair(other),
        }
    }
}
