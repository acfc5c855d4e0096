//! Error types for interception and rule resolution

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

/// Main error type for request interception
#[derive(Debug, Error)]
pub enum StubError {
    /// More than one vendor claims the same hostname
    #[error("Configuration error: more than one vendor for hostname {hostname} ({count} found)")]
    AmbiguousVendor { hostname: String, count: usize },

    /// More than one rule matches the same (vendor, path, verb)
    #[error("Configuration error: more than one rule for path {path} / verb {verb} / vendor {vendor} ({count} found)")]
    AmbiguousRule {
        vendor: String,
        path: String,
        verb: String,
        count: usize,
    },

    /// The rule store could not be read or written
    #[error("Rule store error: {0}")]
    Store(#[from] StoreError),

    /// The live target could not produce a usable response
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// General I/O errors (binding, serving)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StubError {
    /// Operator misconfiguration that must not be retried
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            StubError::AmbiguousVendor { .. } | StubError::AmbiguousRule { .. }
        )
    }
}

impl IntoResponse for StubError {
    fn into_response(self) -> Response {
        error!("StormCloud failed to handle request: {}", self);
        let status = match &self {
            StubError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Errors reported by a rule store implementation
#[derive(Debug, Error)]
pub enum StoreError {
    /// A rule for the same (vendor, path, verb) already exists
    #[error("A rule for vendor {vendor_id:?} / path {path} / verb {verb} already exists")]
    Conflict {
        vendor_id: Option<i64>,
        path: String,
        verb: String,
    },

    /// The referenced record does not exist
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    /// Backend failure (connection, query, decoding)
    #[error("Backend error: {0}")]
    Backend(String),
}
