//! litharvest core library
//!
//! Harvests recent biomedical literature: searches PubMed and OpenAlex for a
//! recency window, screens titles and abstracts with an external classifier,
//! resolves full-text documents through ordered fallback chains and hands the
//! results to an ingestion sink.
//!
//! # Architecture
//!
//! - [`source`] - PubMed and OpenAlex search adapters
//! - [`record`] - bibliographic record model and cross-source merge
//! - [`classify`] - relevance classifier boundary and adapters
//! - [`fulltext`] - full-text strategy chains, transfer, extraction, browser fallback
//! - [`download`] - shared HTTP client, retries, pacing and concurrency budgets
//! - [`ingest`] - ingestion boundary and JSONL manifest sink
//! - [`pipeline`] - orchestration of one harvest run
//! - [`config`] - layered configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod classify;
pub mod config;
pub mod download;
pub mod fulltext;
pub mod ingest;
pub mod pipeline;
pub mod record;
pub mod source;
pub mod user_agent;

#[cfg(test)]
pub mod test_support;

// Re-export commonly used types
pub use classify::{Classification, Classifier, ClassifyError};
pub use config::{Config, ConfigError};
pub use download::{
    ConcurrencyBudget, DownloadError, FailureType, HttpClient, RateLimiter, RetryPolicy,
    Retryable,
};
pub use fulltext::{FullTextResolver, ResolutionAttempt, StrategyOutcome};
pub use ingest::{IngestError, IngestMetadata, Ingestor, JsonlIngestor};
pub use pipeline::{Pipeline, PipelineError, PipelineParts, PipelineReport, StatsSnapshot};
pub use record::{BibliographicRecord, RecordIds, SourceKind, merge_records};
pub use source::{MetadataSource, SearchQuery, SearchWindow, SourceError};
