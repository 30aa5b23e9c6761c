//! Package transfer and extraction (strategy 3 of the PMC chain).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::archive::{extract_documents, is_package};
use super::transfer::Transfer;
use super::{Artifact, ResolutionState, Strategy, StrategyOutcome};
use crate::download::{ConcurrencyBudget, RetryPolicy};
use crate::record::BibliographicRecord;

/// Subdirectory of the document directory holding downloaded packages.
pub const PACKAGE_SUBDIR: &str = "zips";

/// Downloads every OA link, extracting packages and keeping plain PDFs.
///
/// Each link is retried under the document preset; a download slot is held
/// for every attempt.
pub struct PackageTransferStrategy {
    transfer: Arc<dyn Transfer>,
    budget: Arc<ConcurrencyBudget>,
    doc_dir: PathBuf,
    retry: RetryPolicy,
}

impl PackageTransferStrategy {
    #[must_use]
    pub fn new(transfer: Arc<dyn Transfer>, budget: Arc<ConcurrencyBudget>, doc_dir: PathBuf) -> Self {
        Self {
            transfer,
            budget,
            doc_dir,
            retry: RetryPolicy::document(),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl std::fmt::Debug for PackageTransferStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageTransferStrategy")
            .field("doc_dir", &self.doc_dir)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Strategy for PackageTransferStrategy {
    fn name(&self) -> &'static str {
        "package_transfer"
    }

    #[instrument(skip(self, record, state), fields(id = record.ids.pmc_lookup_id(), links = state.links.len()))]
    async fn attempt(&self, record: &BibliographicRecord, state: &mut ResolutionState) -> StrategyOutcome {
        if state.links.is_empty() {
            return StrategyOutcome::SoftFailure("no package links".to_string());
        }
        let package_dir = self.doc_dir.join(PACKAGE_SUBDIR);
        let mut paths = Vec::new();
        let mut failures = Vec::new();

        let (transfer, budget, dest_dir) = (&self.transfer, &self.budget, package_dir.as_path());
        for link in &state.links {
            let downloaded = self
                .retry
                .run(&link.url, |_attempt| async move {
                    let _permit = budget.acquire_download().await;
                    transfer.fetch(link, dest_dir).await
                })
                .await;
            let local = match downloaded {
                Ok(local) => local,
                Err(e) => {
                    warn!(url = %link.url, error = %e, "transfer failed");
                    failures.push(e.to_string());
                    continue;
                }
            };

            if is_package(&local) {
                match extract_documents(&local, &self.doc_dir).await {
                    Ok(extracted) if extracted.is_empty() => {
                        state.empty_package = true;
                        failures.push(format!("{} contained no article PDF", local.display()));
                    }
                    Ok(extracted) => paths.extend(extracted),
                    Err(e) => {
                        warn!(package = %local.display(), error = %e, "extraction failed");
                        failures.push(e.to_string());
                    }
                }
            } else if local
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
            {
                paths.push(local);
            } else {
                debug!(path = %local.display(), "ignoring non-document transfer");
            }
        }

        if paths.is_empty() {
            let reason = if failures.is_empty() {
                "no documents in transferred files".to_string()
            } else {
                failures.join("; ")
            };
            return StrategyOutcome::SoftFailure(reason);
        }
        StrategyOutcome::Resolved(Artifact {
            paths,
            license: state.license.clone(),
            is_open_access: true,
        })
    }
}
