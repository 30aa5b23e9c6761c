//! Ordered strategy chains.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::fetch::DocumentFetcher;
use super::transfer::Transfer;
use super::{
    DirectPdfStrategy, OaLookupStrategy, PackageTransferStrategy, RenderedTextStrategy,
    ResolutionAttempt, ResolutionState, Strategy, StrategyOutcome, StructuredTextStrategy,
};
use crate::download::{ConcurrencyBudget, HttpClient};
use crate::record::BibliographicRecord;

/// Service locations and output directory for the PMC chain.
#[derive(Debug, Clone)]
pub struct PmcEndpoints {
    /// BioC REST base, e.g. `.../RESTful/pmcoa.cgi`.
    pub bioc_base_url: String,
    /// OA web service, e.g. `.../pmc/utils/oa/oa.fcgi`.
    pub oa_service_url: String,
    pub doc_dir: PathBuf,
}

/// Runs strategies in order until one yields documents.
pub struct FullTextResolver {
    label: &'static str,
    strategies: Vec<Arc<dyn Strategy>>,
}

impl FullTextResolver {
    #[must_use]
    pub fn new(label: &'static str, strategies: Vec<Arc<dyn Strategy>>) -> Self {
        Self { label, strategies }
    }

    /// BioC text, OA lookup, package transfer, rendered text.
    #[must_use]
    pub fn pmc(
        client: &HttpClient,
        transfer: Arc<dyn Transfer>,
        budget: Arc<ConcurrencyBudget>,
        endpoints: PmcEndpoints,
    ) -> Self {
        Self::new(
            "pmc",
            vec![
                Arc::new(StructuredTextStrategy::new(client.clone(), endpoints.bioc_base_url)),
                Arc::new(OaLookupStrategy::new(client.clone(), endpoints.oa_service_url)),
                Arc::new(PackageTransferStrategy::new(
                    transfer,
                    budget,
                    endpoints.doc_dir.clone(),
                )),
                Arc::new(RenderedTextStrategy::new(endpoints.doc_dir)),
            ],
        )
    }

    /// Catalog-supplied PDF URL.
    #[must_use]
    pub fn direct(fetcher: Arc<DocumentFetcher>, budget: Arc<ConcurrencyBudget>, doc_dir: PathBuf) -> Self {
        Self::new(
            "direct",
            vec![Arc::new(DirectPdfStrategy::new(fetcher, budget, doc_dir))],
        )
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }

    #[must_use]
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Resolves `record` in place. Returns whether documents were attached.
    ///
    /// Every attempt is appended to `record.attempts`. Failures never
    /// escape; an unresolved record keeps a null path.
    pub async fn resolve(&self, record: &mut BibliographicRecord) -> bool {
        let key = record.dedupe_key().unwrap_or_default();
        let mut state = ResolutionState::default();

        for strategy in &self.strategies {
            let outcome = strategy.attempt(record, &mut state).await;
            record
                .attempts
                .push(ResolutionAttempt::from_outcome(strategy.name(), &outcome));

            match outcome {
                StrategyOutcome::Resolved(artifact) if !artifact.paths.is_empty() => {
                    info!(
                        chain = self.label,
                        strategy = strategy.name(),
                        record = %key,
                        files = artifact.paths.len(),
                        "full text resolved"
                    );
                    record.is_open_access |= artifact.is_open_access;
                    record.attach_documents(artifact.paths, artifact.license);
                    return true;
                }
                StrategyOutcome::Resolved(_) => {
                    debug!(strategy = strategy.name(), record = %key, "resolved without files");
                }
                StrategyOutcome::Advanced => {
                    debug!(strategy = strategy.name(), record = %key, "advanced");
                }
                StrategyOutcome::SoftFailure(reason) => {
                    debug!(strategy = strategy.name(), record = %key, %reason, "strategy failed");
                }
                StrategyOutcome::HardFailure(reason) => {
                    warn!(chain = self.label, strategy = strategy.name(), record = %key, %reason, "chain aborted");
                    break;
                }
            }
        }

        info!(chain = self.label, record = %key, "full text unresolved");
        false
    }
}

impl std::fmt::Debug for FullTextResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullTextResolver")
            .field("label", &self.label)
            .field("strategies", &self.strategy_names())
            .finish()
    }
}
