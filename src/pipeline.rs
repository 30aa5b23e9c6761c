//! End-to-end orchestration: search, classify, resolve, merge, ingest.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Local;
use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::classify::{Classifier, HttpClassifier, PassThroughClassifier};
use crate::config::Config;
use crate::download::{
    BudgetError, ClientOptions, ConcurrencyBudget, DownloadError, HttpClient, RateLimiter,
    RetryPolicy,
};
use crate::fulltext::browser::{BrowserSessions, ChromiumFetcher, ChromiumOptions};
use crate::fulltext::fetch::{DocumentFetcher, RenderedFetcher};
use crate::fulltext::transfer::{FtpOptions, FtpTransfer, HttpTransfer, SchemeTransfer, Transfer};
use crate::fulltext::{FullTextResolver, OutcomeKind, PmcEndpoints, ResolutionAttempt};
use crate::ingest::{IngestError, IngestMetadata, Ingestor, JsonlIngestor};
use crate::record::{BibliographicRecord, merge_records};
use crate::source::{
    MetadataSource, OpenAlexOptions, OpenAlexSource, PubMedSource, SearchQuery, SearchWindow,
    SourceError,
};

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] DownloadError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    InvalidQuery(SourceError),

    /// Neither catalog produced records.
    #[error("all sources failed: pubmed: {pubmed}; openalex: {openalex}")]
    AllSourcesFailed {
        pubmed: SourceError,
        openalex: SourceError,
    },
}

/// Aggregate counters for one run.
#[derive(Debug, Default)]
pub struct PipelineStats {
    found: AtomicUsize,
    classified: AtomicUsize,
    included: AtomicUsize,
    resolved: AtomicUsize,
    ingested: AtomicUsize,
    ingest_failed: AtomicUsize,
}

impl PipelineStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            found: self.found.load(Ordering::SeqCst),
            classified: self.classified.load(Ordering::SeqCst),
            included: self.included.load(Ordering::SeqCst),
            resolved: self.resolved.load(Ordering::SeqCst),
            ingested: self.ingested.load(Ordering::SeqCst),
            ingest_failed: self.ingest_failed.load(Ordering::SeqCst),
        }
    }

    fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::SeqCst);
    }
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub found: usize,
    pub classified: usize,
    pub included: usize,
    pub resolved: usize,
    pub ingested: usize,
    pub ingest_failed: usize,
}

/// Merged records plus counts.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub records: Vec<BibliographicRecord>,
    pub stats: StatsSnapshot,
}

/// Collaborators a [`Pipeline`] is assembled from.
pub struct PipelineParts {
    pub pubmed: Arc<dyn MetadataSource>,
    pub openalex: Arc<dyn MetadataSource>,
    /// PMC chain; also the cross-source fallback for OpenAlex records.
    pub pmc: Arc<FullTextResolver>,
    pub direct: Arc<FullTextResolver>,
    pub classifier: Arc<dyn Classifier>,
    pub ingestor: Arc<dyn Ingestor>,
}

/// Literature harvesting pipeline.
pub struct Pipeline {
    parts: PipelineParts,
    browsers: Option<BrowserSessions>,
}

impl Pipeline {
    #[must_use]
    pub fn new(parts: PipelineParts) -> Self {
        Self { parts, browsers: None }
    }

    /// Tracks browser sessions so [`Pipeline::shutdown`] can wait for them.
    #[must_use]
    pub fn with_browser_sessions(mut self, sessions: BrowserSessions) -> Self {
        self.browsers = Some(sessions);
        self
    }

    /// Waits up to `grace` for launched browsers to finish closing after
    /// an interrupted run. Returns `false` if some were still open.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let Some(sessions) = &self.browsers else {
            return true;
        };
        let open = sessions.open();
        if open > 0 {
            info!(open, "waiting for browsers to close");
        }
        let closed = sessions.wait_closed(grace).await;
        if !closed {
            warn!(open = sessions.open(), "browsers still open after shutdown grace");
        }
        closed
    }

    /// Builds every collaborator from `config`. Shared pieces (HTTP client,
    /// budgets, browser fetcher) are created once here.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Config`] for invalid settings, or a client/budget
    /// construction failure.
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        config.validate()?;

        let limiter = Arc::new(RateLimiter::new(config.rate_limit()));
        let mut retry = RetryPolicy::metadata();
        if let Some(attempts) = config.max_retries {
            retry = retry.attempts(attempts);
        }
        let client = HttpClient::new(
            ClientOptions {
                contact_email: config.contact_email.clone(),
                request_timeout: config.request_timeout(),
                retry,
                ..ClientOptions::default()
            },
            limiter,
        )?;
        let budget = Arc::new(ConcurrencyBudget::new(
            config.download_concurrency,
            config.browser_concurrency,
        )?);

        let pubmed = PubMedSource::with_base_url(
            client.clone(),
            config.contact_email.clone(),
            config.ncbi_api_key.clone(),
            config.eutils_base_url.clone(),
        );
        let openalex = OpenAlexSource::new(
            &client,
            OpenAlexOptions {
                base_url: config.openalex_base_url.clone(),
                mailto: config.openalex_contact().to_string(),
                per_page: config.openalex_per_page,
                page_delay: config.openalex_page_delay(),
                ..OpenAlexOptions::default()
            },
        );

        let chromium = ChromiumFetcher::new(
            ChromiumOptions {
                headless: config.headless,
                executable: config.browser_executable.clone(),
                ..ChromiumOptions::default()
            },
            Arc::clone(&budget),
        );
        let browsers = chromium.sessions();
        let chromium: Arc<dyn RenderedFetcher> = Arc::new(chromium);
        let fetcher = Arc::new(DocumentFetcher::new(&client, Some(chromium)));

        let transfer: Arc<dyn Transfer> = Arc::new(SchemeTransfer::new(
            FtpTransfer::new(FtpOptions {
                host: config.ftp_host.clone(),
                user: config.ftp_user.clone(),
                password: config.ftp_password.clone(),
                chunk_size: config.chunk_size,
                io_timeout: config.request_timeout(),
                ..FtpOptions::default()
            }),
            // Attempts are driven by the package strategy's retry policy.
            HttpTransfer::new(client.with_retry_policy(RetryPolicy::with_max_attempts(1))),
        ));
        let pmc = FullTextResolver::pmc(
            &client,
            transfer,
            Arc::clone(&budget),
            PmcEndpoints {
                bioc_base_url: config.bioc_base_url.clone(),
                oa_service_url: config.oa_service_url.clone(),
                doc_dir: config.doc_dir.clone(),
            },
        );
        let direct = FullTextResolver::direct(fetcher, budget, config.doc_dir.clone());

        let classifier: Arc<dyn Classifier> = match &config.classifier_url {
            Some(url) => Arc::new(HttpClassifier::new(client.clone(), url.clone())),
            None => {
                warn!("no classifier configured; every record will qualify");
                Arc::new(PassThroughClassifier)
            }
        };
        let ingestor = Arc::new(JsonlIngestor::new(config.manifest_path()));
        info!(manifest = %ingestor.path().display(), doc_dir = %config.doc_dir.display(), "pipeline ready");

        Ok(Self::new(PipelineParts {
            pubmed: Arc::new(pubmed),
            openalex: Arc::new(openalex),
            pmc: Arc::new(pmc),
            direct: Arc::new(direct),
            classifier,
            ingestor,
        })
        .with_browser_sessions(browsers))
    }

    /// Runs one harvest.
    ///
    /// Unresolved and unclassified records are always part of the report.
    ///
    /// # Errors
    ///
    /// [`PipelineError::InvalidQuery`] for a blank query and
    /// [`PipelineError::AllSourcesFailed`] when neither catalog answers.
    #[instrument(skip(self))]
    pub async fn search_and_resolve(
        &self,
        query: &str,
        start_day_offset: u32,
        lookback_days: u32,
        max_records: usize,
    ) -> Result<PipelineReport, PipelineError> {
        let query = SearchQuery::new(
            query,
            SearchWindow::new(start_day_offset, lookback_days),
            max_records,
        );
        query.validate().map_err(PipelineError::InvalidQuery)?;
        let stats = PipelineStats::new();

        let (pubmed, openalex) = self.search(&query).await?;
        PipelineStats::add(&stats.found, pubmed.len() + openalex.len());

        let (pubmed_hits, pubmed_rest) = self.classify(pubmed, &stats).await;
        let (openalex_hits, openalex_rest) = self.classify(openalex, &stats).await;

        let pmc = Arc::clone(&self.parts.pmc);
        let direct = Arc::clone(&self.parts.direct);
        let (pubmed_done, openalex_done) = tokio::join!(
            resolve_all(&pmc, pubmed_hits),
            resolve_all(&direct, openalex_hits),
        );

        let (openalex_ok, fallback): (Vec<_>, Vec<_>) = openalex_done
            .into_iter()
            .partition(|r| r.has_fulltext() || r.ids.pmc_lookup_id().is_none());
        if !fallback.is_empty() {
            info!(records = fallback.len(), "re-attempting OpenAlex records through PMC");
        }
        let fallback_done = resolve_all(&pmc, fallback).await;

        let mut all = pubmed_done;
        all.extend(openalex_ok);
        all.extend(fallback_done);
        all.extend(pubmed_rest);
        all.extend(openalex_rest);
        let records = merge_records(all);
        PipelineStats::add(&stats.resolved, records.iter().filter(|r| r.has_fulltext()).count());

        self.ingest(&records, &stats).await;

        let snapshot = stats.snapshot();
        info!(
            found = snapshot.found,
            classified = snapshot.classified,
            included = snapshot.included,
            resolved = snapshot.resolved,
            ingested = snapshot.ingested,
            ingest_failed = snapshot.ingest_failed,
            records = records.len(),
            "harvest complete"
        );
        Ok(PipelineReport {
            records,
            stats: snapshot,
        })
    }

    async fn search(
        &self,
        query: &SearchQuery,
    ) -> Result<(Vec<BibliographicRecord>, Vec<BibliographicRecord>), PipelineError> {
        let (pubmed, openalex) = tokio::join!(
            self.parts.pubmed.search(query),
            self.parts.openalex.search(query)
        );
        match (pubmed, openalex) {
            (Err(pubmed), Err(openalex)) => Err(PipelineError::AllSourcesFailed { pubmed, openalex }),
            (pubmed, openalex) => Ok((
                found_or_empty(self.parts.pubmed.name(), pubmed),
                found_or_empty(self.parts.openalex.name(), openalex),
            )),
        }
    }

    /// Returns `(included, everything else)`.
    async fn classify(
        &self,
        mut records: Vec<BibliographicRecord>,
        stats: &PipelineStats,
    ) -> (Vec<BibliographicRecord>, Vec<BibliographicRecord>) {
        let classifier = &self.parts.classifier;
        let outcomes = join_all(records.iter_mut().map(|record| async move {
            let text = record.classification_text()?;
            match classifier.classify(&text).await {
                Ok(classification) => {
                    record.relevant = Some(classification.qualifies);
                    record.classification = Some(classification);
                    Some(())
                }
                Err(e) => {
                    warn!(
                        classifier = classifier.name(),
                        record = record.dedupe_key().unwrap_or_default(),
                        error = %e,
                        "classification failed"
                    );
                    None
                }
            }
        }))
        .await;
        PipelineStats::add(&stats.classified, outcomes.iter().flatten().count());

        let (included, rest): (Vec<_>, Vec<_>) =
            records.into_iter().partition(|r| r.relevant == Some(true));
        PipelineStats::add(&stats.included, included.len());
        (included, rest)
    }

    async fn ingest(&self, records: &[BibliographicRecord], stats: &PipelineStats) {
        let today = Local::now().date_naive();
        let ingestor = &self.parts.ingestor;
        join_all(records.iter().filter_map(|record| {
            let path = record.fulltext_path.clone()?;
            Some(async move {
                let result = match tokio::fs::read(&path).await {
                    Ok(document) => {
                        let metadata = IngestMetadata::from_record(record, today);
                        ingestor.ingest(record, &document, &metadata).await
                    }
                    Err(e) => Err(IngestError::io(&path, e)),
                };
                match result {
                    Ok(()) => PipelineStats::add(&stats.ingested, 1),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "ingestion failed");
                        PipelineStats::add(&stats.ingest_failed, 1);
                    }
                }
            })
        }))
        .await;
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("pubmed", &self.parts.pubmed.name())
            .field("openalex", &self.parts.openalex.name())
            .field("pmc", &self.parts.pmc)
            .field("direct", &self.parts.direct)
            .field("classifier", &self.parts.classifier.name())
            .finish_non_exhaustive()
    }
}

fn found_or_empty(
    source: &str,
    result: Result<Vec<BibliographicRecord>, SourceError>,
) -> Vec<BibliographicRecord> {
    match result {
        Ok(records) => {
            info!(source, records = records.len(), "search complete");
            records
        }
        Err(e) => {
            warn!(source, error = %e, "search failed, continuing with the other source");
            Vec::new()
        }
    }
}

/// Resolves each record in its own task. Input order is kept; a record
/// whose task panics is returned as it went in, with the failure noted.
/// Dropping the returned future aborts every outstanding task.
async fn resolve_all(
    resolver: &Arc<FullTextResolver>,
    records: Vec<BibliographicRecord>,
) -> Vec<BibliographicRecord> {
    let mut slots = records.clone();
    let mut tasks = JoinSet::new();
    let mut positions = HashMap::with_capacity(records.len());
    for (index, mut record) in records.into_iter().enumerate() {
        let resolver = Arc::clone(resolver);
        let handle = tasks.spawn(async move {
            resolver.resolve(&mut record).await;
            record
        });
        positions.insert(handle.id(), index);
    }
    debug!(tasks = tasks.len(), "waiting for resolutions");

    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((id, record)) => {
                if let Some(&index) = positions.get(&id) {
                    slots[index] = record;
                }
            }
            Err(e) => {
                let Some(&index) = positions.get(&e.id()) else {
                    continue;
                };
                let record = &mut slots[index];
                warn!(
                    chain = resolver.label(),
                    record = record.dedupe_key().unwrap_or_default(),
                    error = %e,
                    "resolution task panicked"
                );
                record.attempts.push(ResolutionAttempt {
                    strategy: resolver.label().to_string(),
                    outcome: OutcomeKind::HardFailure,
                    detail: Some("resolution task panicked".to_string()),
                });
            }
        }
    }
    slots
}
