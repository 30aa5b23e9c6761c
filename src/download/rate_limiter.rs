//! Per-host pacing for catalog APIs and document servers.
//!
//! [`RateLimiter`] keeps a minimum spacing between requests to the same host
//! and honours server-mandated pauses recorded from `Retry-After`. Requests
//! to different hosts never wait on each other.
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use litharvest::download::RateLimiter;
//!
//! # async fn example() {
//! let limiter = Arc::new(RateLimiter::new(Duration::from_millis(340)));
//! limiter.acquire("https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi").await;
//! limiter.acquire("https://api.openalex.org/works").await; // different host, no wait
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::{CUMULATIVE_DELAY_WARNING_THRESHOLD, MAX_RETRY_AFTER};

/// Per-host rate limiter shared across tasks behind an `Arc`.
///
/// The `DashMap` only hands out `Arc<HostState>` clones, so no shard lock is
/// held across an `.await`.
#[derive(Debug)]
pub struct RateLimiter {
    min_spacing: Duration,
    disabled: bool,
    hosts: DashMap<String, Arc<HostState>>,
}

#[derive(Debug, Default)]
struct Pacing {
    /// `None` until the first request; the first request never waits.
    last_request: Option<Instant>,
    /// Set by a server `Retry-After`; no request leaves before this instant.
    resume_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct HostState {
    pacing: Mutex<Pacing>,
    cumulative_delay_ms: AtomicU64,
}

impl HostState {
    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(total)
    }

    fn cumulative_delay(&self) -> Duration {
        Duration::from_millis(self.cumulative_delay_ms.load(Ordering::SeqCst))
    }
}

impl RateLimiter {
    /// Creates a limiter enforcing `min_spacing` between requests to one host.
    #[must_use]
    #[instrument(skip_all, fields(spacing_ms = min_spacing.as_millis()))]
    pub fn new(min_spacing: Duration) -> Self {
        debug!("creating rate limiter");
        Self {
            min_spacing,
            disabled: min_spacing.is_zero(),
            hosts: DashMap::new(),
        }
    }

    /// Creates a limiter that never waits (`--rate-limit 0`).
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            min_spacing: Duration::ZERO,
            disabled: true,
            hosts: DashMap::new(),
        }
    }

    /// Returns whether pacing is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the configured minimum spacing.
    #[must_use]
    pub fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    fn host_state(&self, host: &str) -> Arc<HostState> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostState::default()))
            .clone()
    }

    /// Waits until a request to `url`'s host is allowed, then claims the slot.
    #[instrument(skip(self), fields(host))]
    pub async fn acquire(&self, url: &str) {
        let host = extract_domain(url);
        tracing::Span::current().record("host", host.as_str());
        let state = self.host_state(&host);
        let mut pacing = state.pacing.lock().await;

        let now = Instant::now();
        let mut ready_at = now;
        if !self.disabled
            && let Some(last) = pacing.last_request
        {
            ready_at = ready_at.max(last + self.min_spacing);
        }
        if let Some(resume_at) = pacing.resume_at {
            ready_at = ready_at.max(resume_at);
        }

        if ready_at > now {
            let delay = ready_at - now;
            let cumulative = state.add_cumulative_delay(delay);
            debug!(
                host = %host,
                delay_ms = delay.as_millis(),
                cumulative_ms = cumulative.as_millis(),
                "pacing request"
            );
            if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                warn!(
                    host = %host,
                    cumulative_delay_secs = cumulative.as_secs(),
                    "excessive pacing delay for host"
                );
            }
            tokio::time::sleep_until(ready_at).await;
        }

        pacing.last_request = Some(Instant::now());
        pacing.resume_at = None;
    }

    /// Records a server-mandated pause for `url`'s host.
    #[instrument(skip(self), fields(host))]
    pub async fn record_rate_limit(&self, url: &str, delay: Duration) {
        let host = extract_domain(url);
        tracing::Span::current().record("host", host.as_str());
        let delay = delay.min(MAX_RETRY_AFTER);
        let state = self.host_state(&host);
        let mut pacing = state.pacing.lock().await;
        let resume_at = Instant::now() + delay;
        pacing.resume_at = Some(pacing.resume_at.map_or(resume_at, |r| r.max(resume_at)));
        debug!(host = %host, delay_ms = delay.as_millis(), "recorded server rate limit");
    }

    /// Total pacing delay applied to `url`'s host so far.
    #[must_use]
    pub fn cumulative_delay(&self, url: &str) -> Duration {
        self.hosts
            .get(&extract_domain(url))
            .map_or(Duration::ZERO, |state| state.cumulative_delay())
    }
}

/// Extracts the lowercase host from a URL, or `"unknown"` when it has none.
///
/// ```
/// use litharvest::download::extract_domain;
///
/// assert_eq!(extract_domain("https://API.OpenAlex.org/works"), "api.openalex.org");
/// assert_eq!(extract_domain("ftp://ftp.ncbi.nlm.nih.gov/pub/pmc/x.tar.gz"), "ftp.ncbi.nlm.nih.gov");
/// assert_eq!(extract_domain("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a `Retry-After` value (integer seconds or HTTP-date), capped at one hour.
///
/// ```
/// use std::time::Duration;
/// use litharvest::download::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("soon"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let seconds = u64::try_from(seconds).ok()?;
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    let datetime = httpdate::parse_http_date(header_value).ok()?;
    let delay = datetime
        .duration_since(std::time::SystemTime::now())
        .unwrap_or(Duration::ZERO);
    if delay > MAX_RETRY_AFTER {
        warn!(
            delay_secs = delay.as_secs(),
            "Retry-After date exceeds maximum, capping at 1 hour"
        );
    }
    Some(delay.min(MAX_RETRY_AFTER))
}
