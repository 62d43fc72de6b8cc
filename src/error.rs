use std::time::Duration;
use thiserror::Error;
use crate::types::record::EntityKey;

#[derive(Error, Debug)]
pub enum Error {
    // Fetch Errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("HTTP status {status} from {url}")]
    HttpStatus {
        status: u16,
        url: String,
    },

    #[error("Rate limited by {source_name}")]
    RateLimited {
        source_name: String,
    },

    #[error("Feed connection error: {0}")]
    FeedConnection(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Fetch failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: String,
    },

    #[error("Deserialization failed: {0}")]
    DeserializationError(String),

    #[error("CSV error: {0}")]
    Csv(String),

    // Record Validation Errors
    #[error("Validation failed on `{field}`: {reason}")]
    Validation {
        field: &'static str,
        reason: String,
    },

    // Storage Errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Concurrent write conflict on {0}")]
    ConcurrencyConflict(EntityKey),

    // Pipeline Errors
    #[error("CHAOS_MODE_TRIGGERED: simulated failure mid-stream")]
    ChaosTriggered,

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Task {name} failed: {reason}")]
    TaskFailed {
        name: String,
        reason: String,
    },

    // System Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Error::Validation { field, reason: reason.into() }
    }

    pub fn missing(field: &'static str) -> Self {
        Error::Validation { field, reason: "missing".to_string() }
    }

    /// Transient errors may succeed on a later attempt; everything else fails the fetch at once.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_)
            | Error::RateLimited { .. }
            | Error::FeedConnection(_)
            | Error::ConnectionClosed
            | Error::Timeout(_) => true,
            Error::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Error::HttpStatus {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            },
            None if e.is_decode() => Error::DeserializationError(e.to_string()),
            None => Error::Http(e.to_string()),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        Error::Csv(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
