//! Error types for full-text retrieval.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::download::{DownloadError, FailureType, Retryable};

/// Errors raised while transferring a package or document.
#[derive(Debug, Error)]
pub enum TransferError {
    /// FTP session failure (connect, login, navigation or `RETR`).
    #[error("FTP transfer of {url} failed: {reason}")]
    Ftp { url: String, reason: String },

    /// HTTP download failure.
    #[error(transparent)]
    Http(#[from] DownloadError),

    /// The link cannot be transferred (unsupported scheme, no file name).
    #[error("unsupported transfer link: {url}")]
    InvalidLink { url: String },

    /// The transfer did not finish in time.
    #[error("transfer of {url} timed out")]
    Timeout { url: String },

    /// Local file-system failure.
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TransferError {
    pub fn ftp(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::Ftp {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_link(url: impl Into<String>) -> Self {
        Self::InvalidLink { url: url.into() }
    }

    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Errors raised while extracting a package archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The archive is truncated or not a gzip-compressed tar.
    #[error("corrupt archive {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The blocking extraction task panicked or was cancelled.
    #[error("extraction task failed: {0}")]
    Task(String),
}

impl ArchiveError {
    pub fn corrupt(path: impl AsRef<Path>, reason: impl ToString) -> Self {
        Self::Corrupt {
            path: path.as_ref().to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Errors raised while fetching a document over HTTP or through a browser.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] DownloadError),

    /// The browser could not be started.
    #[error("browser launch failed: {0}")]
    Launch(String),

    /// A page operation failed inside the browser.
    #[error("browser fetch of {url} failed: {reason}")]
    Browser { url: String, reason: String },

    #[error("fetch of {url} timed out")]
    Timeout { url: String },

    /// Both the HTTP path and the rendered fallback failed.
    #[error("all fetch paths failed for {url}: http: {http}; browser: {browser}")]
    Exhausted {
        url: String,
        http: String,
        browser: String,
    },
}

impl FetchError {
    pub fn browser(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::Browser {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }
}

/// Errors raised while rendering text into a PDF.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("nothing to render")]
    Empty,

    #[error("PDF encoding failed: {0}")]
    Pdf(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("render task failed: {0}")]
    Task(String),
}

impl Retryable for TransferError {
    fn failure_type(&self) -> FailureType {
        match self {
            Self::Http(e) => e.failure_type(),
            Self::Ftp { .. } | Self::Timeout { .. } => FailureType::Transient,
            Self::InvalidLink { .. } | Self::Io { .. } => FailureType::Permanent,
        }
    }

    fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Self::Http(e) => e.retry_after(),
            _ => None,
        }
    }
}

impl Retryable for FetchError {
    fn failure_type(&self) -> FailureType {
        match self {
            Self::Http(e) => e.failure_type(),
            Self::Timeout { .. } | Self::Browser { .. } => FailureType::Transient,
            Self::Launch(_) | Self::Exhausted { .. } => FailureType::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_display() {
        let err = TransferError::ftp("ftp://host/a.tar.gz", "550 not found");
        assert_eq!(
            err.to_string(),
            "FTP transfer of ftp://host/a.tar.gz failed: 550 not found"
        );
    }

    #[test]
    fn test_exhausted_display_names_both_paths() {
        let err = FetchError::Exhausted {
            url: "https://x/a.pdf".into(),
            http: "HTTP 403".into(),
            browser: "launch failed".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("HTTP 403"));
        assert!(msg.contains("launch failed"));
        assert_eq!(err.failure_type(), FailureType::Permanent);
    }

    #[test]
    fn test_transfer_timeout_is_transient() {
        let err = TransferError::Timeout {
            url: "ftp://host/a.tar.gz".into(),
        };
        assert_eq!(err.failure_type(), FailureType::Transient);
        assert_eq!(
            TransferError::invalid_link("gopher://x").failure_type(),
            FailureType::Permanent
        );
    }
}
