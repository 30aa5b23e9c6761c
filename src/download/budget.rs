//! Process-wide concurrency budgets for document downloads and browser sessions.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Minimum allowed budget.
pub const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed budget.
pub const MAX_CONCURRENCY: usize = 100;

/// Default number of simultaneous document downloads.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default number of simultaneous browser sessions.
pub const DEFAULT_BROWSER_CONCURRENCY: usize = 3;

/// Error type for budget construction.
#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    /// Invalid budget value provided.
    #[error(
        "invalid {kind} concurrency {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// Which budget was rejected.
        kind: &'static str,
        /// The invalid value.
        value: usize,
    },
}

#[derive(Debug)]
struct Pool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Pool {
    fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn acquire(&self, kind: &'static str) -> BudgetPermit {
        // The semaphore is owned by this pool and never closed, so acquisition only waits.
        let permit = loop {
            match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => break permit,
                Err(_) => tokio::task::yield_now().await,
            }
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        debug!(kind, in_flight = now, capacity = self.capacity, "budget slot acquired");
        BudgetPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

/// A held budget slot. Dropping it releases the slot on every exit path.
#[derive(Debug)]
pub struct BudgetPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Fixed-size pools limiting simultaneous downloads and browser sessions.
///
/// Built once per process and shared by `Arc`.
#[derive(Debug)]
pub struct ConcurrencyBudget {
    downloads: Pool,
    browsers: Pool,
}

impl ConcurrencyBudget {
    /// Creates the budgets.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::InvalidConcurrency`] for values outside 1..=100.
    pub fn new(downloads: usize, browsers: usize) -> Result<Self, BudgetError> {
        for (kind, value) in [("download", downloads), ("browser", browsers)] {
            if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&value) {
                return Err(BudgetError::InvalidConcurrency { kind, value });
            }
        }
        debug!(downloads, browsers, "creating concurrency budget");
        Ok(Self {
            downloads: Pool::new(downloads),
            browsers: Pool::new(browsers),
        })
    }

    /// Waits for a download slot.
    pub async fn acquire_download(&self) -> BudgetPermit {
        self.downloads.acquire("download").await
    }

    /// Waits for a browser slot.
    pub async fn acquire_browser(&self) -> BudgetPermit {
        self.browsers.acquire("browser").await
    }

    #[must_use]
    pub fn download_capacity(&self) -> usize {
        self.downloads.capacity
    }

    #[must_use]
    pub fn browser_capacity(&self) -> usize {
        self.browsers.capacity
    }

    /// Downloads currently holding a slot.
    #[must_use]
    pub fn in_flight_downloads(&self) -> usize {
        self.downloads.in_flight.load(Ordering::SeqCst)
    }

    /// Browser sessions currently holding a slot.
    #[must_use]
    pub fn in_flight_browsers(&self) -> usize {
        self.browsers.in_flight.load(Ordering::SeqCst)
    }

    /// Highest simultaneous download count observed.
    #[must_use]
    pub fn peak_downloads(&self) -> usize {
        self.downloads.peak.load(Ordering::SeqCst)
    }

    /// Highest simultaneous browser count observed.
    #[must_use]
    pub fn peak_browsers(&self) -> usize {
        self.browsers.peak.load(Ordering::SeqCst)
    }
}

impl Default for ConcurrencyBudget {
    fn default() -> Self {
        Self {
            downloads: Pool::new(DEFAULT_CONCURRENCY),
            browsers: Pool::new(DEFAULT_BROWSER_CONCURRENCY),
        }
    }
}
