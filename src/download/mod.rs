//! Outbound HTTP plumbing shared by every network-facing component.
//!
//! - [`HttpClient`] - pooled client with per-host pacing and retries
//! - [`RetryPolicy`] - exponential backoff with transient/permanent classification
//! - [`RateLimiter`] - per-host spacing and `Retry-After` pauses
//! - [`ConcurrencyBudget`] - process-wide download and browser slots
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use litharvest::download::{ClientOptions, HttpClient, RateLimiter};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = Arc::new(RateLimiter::new(Duration::from_millis(340)));
//! let client = HttpClient::new(ClientOptions::default(), limiter)?;
//! let body = client
//!     .get_text("https://eutils.ncbi.nlm.nih.gov/entrez/eutils/einfo.fcgi", &[])
//!     .await?;
//! println!("{} bytes", body.len());
//! # Ok(())
//! # }
//! ```

mod budget;
mod client;
pub(crate) mod constants;
mod error;
pub mod rate_limiter;
mod retry;

pub use budget::{
    BudgetError, BudgetPermit, ConcurrencyBudget, DEFAULT_BROWSER_CONCURRENCY,
    DEFAULT_CONCURRENCY, MAX_CONCURRENCY, MIN_CONCURRENCY,
};
pub use client::{ClientOptions, HttpClient, HttpResponse, RequestBody, RequestSpec, with_query};
pub use error::DownloadError;
pub use rate_limiter::{RateLimiter, extract_domain, parse_retry_after};
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, Retryable, classify_error,
};

pub(crate) use retry::classify_http_status;
