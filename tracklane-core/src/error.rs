//! Error types for tracklane-core

use serde::Deserialize;
use thiserror::Error;

use crate::types::RecordId;

/// Main error type for the tracklane-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Pending record store error
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// No async runtime available for scheduling flushes
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Result type alias for tracklane-core
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the pending record store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A field required to persist the record was not supplied
    #[error("missing required field: {0}")]
    MissingRequiredField(&'static str),

    /// The underlying database rejected a write
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// The underlying database could not be read
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// The record existed once but is gone now
    #[error("record not found: {0}")]
    NotFound(RecordId),
}

impl StorageError {
    pub(crate) fn write(err: impl std::fmt::Display) -> Self {
        Self::WriteFailed(err.to_string())
    }

    pub(crate) fn read(err: impl std::fmt::Display) -> Self {
        Self::ReadFailed(err.to_string())
    }
}

/// Body of a 401 response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Body of 404 and 5xx responses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MultipleErrorResponse {
    #[serde(default)]
    pub errors: Vec<ErrorDetail>,
}

/// Single entry of a [`MultipleErrorResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl std::fmt::Display for MultipleErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<&str> = self
            .errors
            .iter()
            .filter_map(|e| e.description.as_deref().or(e.code.as_deref()))
            .collect();
        if parts.is_empty() {
            write!(f, "no details provided")
        } else {
            write!(f, "{}", parts.join("; "))
        }
    }
}

/// Outcome of a failed delivery, classified from the HTTP exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// No HTTP response was received (transport failure or timeout)
    #[error("no response received from the server: {0}")]
    Connection(String),

    /// HTTP 5xx
    #[error("server error: {}", describe_multi(.0, "please try again later"))]
    Server(Option<MultipleErrorResponse>),

    /// HTTP 400 or 405-499, carrying the response body as text
    #[error("request is missing required data: {0}")]
    BadRequest(String),

    /// HTTP 401
    #[error("missing or invalid authorization: {}", describe_auth(.0))]
    NotAuthorized(Option<ErrorResponse>),

    /// HTTP 404
    #[error("requested URL was not found: {}", describe_multi(.0, "no details provided"))]
    NotFound(Option<MultipleErrorResponse>),
}

impl DeliveryError {
    /// Transient failures leave the record and its retry budget untouched.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Connection(_) | DeliveryError::Server(_))
    }
}

fn describe_auth(response: &Option<ErrorResponse>) -> &str {
    match response {
        Some(r) => r.error.as_str(),
        None => "no details provided",
    }
}

fn describe_multi(response: &Option<MultipleErrorResponse>, fallback: &str) -> String {
    match response {
        Some(r) => r.to_string(),
        None => fallback.to_string(),
    }
}
