//! Error types for metadata source adapters.

use thiserror::Error;

use crate::download::{DownloadError, FailureType, Retryable};

/// Errors raised while searching a catalog.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The catalog could not be reached or kept failing after retries.
    #[error("{catalog} request failed: {error}")]
    Request {
        /// Catalog name.
        catalog: &'static str,
        /// Underlying request failure.
        #[source]
        error: DownloadError,
    },

    /// The catalog answered with a payload that could not be parsed.
    #[error("{catalog} returned an unparseable response: {reason}")]
    Parse {
        /// Catalog name.
        catalog: &'static str,
        /// What went wrong.
        reason: String,
    },

    /// The query or window cannot be sent.
    #[error("invalid search: {reason}")]
    InvalidQuery {
        /// Why the query was rejected.
        reason: String,
    },
}

impl SourceError {
    /// Creates a request error.
    pub fn request(catalog: &'static str, error: DownloadError) -> Self {
        Self::Request { catalog, error }
    }

    /// Creates a parse error.
    pub fn parse(catalog: &'static str, reason: impl Into<String>) -> Self {
        Self::Parse {
            catalog,
            reason: reason.into(),
        }
    }

    /// Creates an invalid-query error.
    pub fn invalid_query(reason: impl Into<String>) -> Self {
        Self::InvalidQuery {
            reason: reason.into(),
        }
    }
}

impl Retryable for SourceError {
    fn failure_type(&self) -> FailureType {
        match self {
            Self::Request { error, .. } => error.failure_type(),
            Self::Parse { .. } | Self::InvalidQuery { .. } => FailureType::Permanent,
        }
    }
}
