//! Metadata source adapters.
//!
//! Each adapter turns a [`SearchQuery`] into normalized
//! [`BibliographicRecord`]s:
//! - [`PubMedSource`] - E-utilities `esearch` + `efetch`
//! - [`OpenAlexSource`] - cursor-paged `/works` search

pub mod abstract_index;
mod error;
mod openalex;
mod pubmed;

pub use error::SourceError;
pub use openalex::{OpenAlexOptions, OpenAlexSource};
pub use pubmed::{PubMedSource, parse_efetch_xml};

use async_trait::async_trait;
use chrono::{Days, Local, NaiveDate};

use crate::record::BibliographicRecord;

/// Recency window ending `start_day_offset` days ago and spanning `lookback_days` more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchWindow {
    pub start_day_offset: u32,
    pub lookback_days: u32,
}

impl SearchWindow {
    #[must_use]
    pub fn new(start_day_offset: u32, lookback_days: u32) -> Self {
        Self {
            start_day_offset,
            lookback_days,
        }
    }

    /// `(earliest, latest)` relative to `today`: `[today-(N+W), today-N]`.
    ///
    /// # Errors
    ///
    /// [`SourceError::InvalidQuery`] when the window reaches before the calendar's range.
    pub fn bounds_from(&self, today: NaiveDate) -> Result<(NaiveDate, NaiveDate), SourceError> {
        let latest = today
            .checked_sub_days(Days::new(u64::from(self.start_day_offset)))
            .ok_or_else(|| SourceError::invalid_query("start day offset out of range"))?;
        let earliest = latest
            .checked_sub_days(Days::new(u64::from(self.lookback_days)))
            .ok_or_else(|| SourceError::invalid_query("lookback out of range"))?;
        Ok((earliest, latest))
    }

    /// Bounds relative to the local calendar date.
    ///
    /// # Errors
    ///
    /// See [`SearchWindow::bounds_from`].
    pub fn bounds(&self) -> Result<(NaiveDate, NaiveDate), SourceError> {
        self.bounds_from(Local::now().date_naive())
    }
}

/// One catalog search.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    pub window: SearchWindow,
    pub max_records: usize,
}

impl SearchQuery {
    #[must_use]
    pub fn new(query: impl Into<String>, window: SearchWindow, max_records: usize) -> Self {
        Self {
            query: query.into(),
            window,
            max_records,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), SourceError> {
        if self.query.trim().is_empty() {
            return Err(SourceError::invalid_query("query is empty"));
        }
        Ok(())
    }
}

/// A bibliographic catalog.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Short catalog name for logs.
    fn name(&self) -> &'static str;

    /// Searches the catalog. At most `query.max_records` records are returned.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<BibliographicRecord>, SourceError>;
}
