//! Full-text resolution.
//!
//! A [`FullTextResolver`] runs an ordered list of [`Strategy`] objects for
//! one record and stops at the first one that produces at least one local
//! document. Two chains are provided:
//!
//! - [`FullTextResolver::pmc`] - BioC text, OA service lookup, package
//!   transfer, then a rendered-text PDF as the last resort
//! - [`FullTextResolver::direct`] - a catalog-supplied PDF URL fetched over
//!   HTTP with a headless-browser fallback

pub mod archive;
mod bioc;
pub mod browser;
mod chain;
mod direct;
mod error;
pub mod fetch;
mod oa_service;
mod package;
mod render;
pub mod sniff;
pub mod transfer;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use bioc::{StructuredText, StructuredTextStrategy, parse_bioc_xml};
pub use chain::{FullTextResolver, PmcEndpoints};
pub use direct::DirectPdfStrategy;
pub use error::{ArchiveError, FetchError, RenderError, TransferError};
pub use oa_service::{OaLookupStrategy, OaRecord, parse_oa_response};
pub use package::PackageTransferStrategy;
pub use render::{RenderedTextStrategy, render_text_pdf};
pub use transfer::TransferLink;

use crate::record::BibliographicRecord;

/// Documents produced by a successful strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub paths: Vec<PathBuf>,
    pub license: Option<String>,
    pub is_open_access: bool,
}

/// Result of one strategy attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyOutcome {
    /// Documents were written; the chain stops if there is at least one.
    Resolved(Artifact),
    /// State was enriched for later strategies; no document yet.
    Advanced,
    /// This strategy failed; the next one runs.
    SoftFailure(String),
    /// Nothing later in the chain can succeed for this record.
    HardFailure(String),
}

impl StrategyOutcome {
    #[must_use]
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Resolved(_) => OutcomeKind::Resolved,
            Self::Advanced => OutcomeKind::Advanced,
            Self::SoftFailure(_) => OutcomeKind::SoftFailure,
            Self::HardFailure(_) => OutcomeKind::HardFailure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Resolved,
    Advanced,
    SoftFailure,
    HardFailure,
}

/// Audit entry for one strategy run against a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionAttempt {
    pub strategy: String,
    pub outcome: OutcomeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ResolutionAttempt {
    #[must_use]
    pub fn from_outcome(strategy: &str, outcome: &StrategyOutcome) -> Self {
        let detail = match outcome {
            StrategyOutcome::Resolved(artifact) => Some(format!("{} file(s)", artifact.paths.len())),
            StrategyOutcome::Advanced => None,
            StrategyOutcome::SoftFailure(reason) | StrategyOutcome::HardFailure(reason) => {
                Some(reason.clone())
            }
        };
        Self {
            strategy: strategy.to_string(),
            outcome: outcome.kind(),
            detail,
        }
    }
}

/// Scratch data handed from one strategy to the next for a single record.
#[derive(Debug, Clone, Default)]
pub struct ResolutionState {
    /// Plain text assembled from BioC passages.
    pub structured_text: Option<String>,
    /// License reported alongside the structured text.
    pub text_license: Option<String>,
    pub license: Option<String>,
    /// Package and document links from the OA service.
    pub links: Vec<TransferLink>,
    /// Set when a downloaded package held no usable documents. Gates the
    /// rendered-text fallback.
    pub empty_package: bool,
}

/// One way of obtaining full text.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs against `record`. Must not panic or propagate errors; every
    /// failure is reported through the outcome.
    async fn attempt(&self, record: &BibliographicRecord, state: &mut ResolutionState) -> StrategyOutcome;
}
