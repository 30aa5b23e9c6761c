//! Catalog-supplied PDF URL (the only strategy of the direct chain).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{instrument, warn};

use super::fetch::DocumentFetcher;
use super::{Artifact, ResolutionState, Strategy, StrategyOutcome};
use crate::download::ConcurrencyBudget;
use crate::record::BibliographicRecord;

/// Fetches `record.pdf_url` into `<doc_dir>/<file stem>.pdf`.
#[derive(Debug)]
pub struct DirectPdfStrategy {
    fetcher: Arc<DocumentFetcher>,
    budget: Arc<ConcurrencyBudget>,
    doc_dir: PathBuf,
}

impl DirectPdfStrategy {
    #[must_use]
    pub fn new(fetcher: Arc<DocumentFetcher>, budget: Arc<ConcurrencyBudget>, doc_dir: PathBuf) -> Self {
        Self {
            fetcher,
            budget,
            doc_dir,
        }
    }
}

#[async_trait]
impl Strategy for DirectPdfStrategy {
    fn name(&self) -> &'static str {
        "direct_pdf"
    }

    #[instrument(skip(self, record, _state), fields(url = record.pdf_url.as_deref()))]
    async fn attempt(&self, record: &BibliographicRecord, _state: &mut ResolutionState) -> StrategyOutcome {
        let Some(pdf_url) = record.pdf_url.as_deref() else {
            return StrategyOutcome::HardFailure("record has no PDF URL".to_string());
        };
        let landing = record.url.as_deref().filter(|u| *u != pdf_url);

        let fetched = {
            let _permit = self.budget.acquire_download().await;
            self.fetcher.fetch(pdf_url, landing).await
        };
        let document = match fetched {
            Ok(document) => document,
            Err(e) => return StrategyOutcome::SoftFailure(e.to_string()),
        };
        if document.body.is_empty() {
            return StrategyOutcome::SoftFailure("empty document body".to_string());
        }
        if !document.looks_like_pdf {
            warn!(
                url = %document.url,
                via_browser = document.via_browser,
                content_type = document.content_type.as_deref().unwrap_or_default(),
                "discarding non-document body"
            );
            return StrategyOutcome::SoftFailure("non-document content after all checks".to_string());
        }

        let dest = self.doc_dir.join(format!("{}.pdf", record.file_stem()));
        if let Err(e) = tokio::fs::create_dir_all(&self.doc_dir).await {
            return StrategyOutcome::SoftFailure(format!("{}: {e}", self.doc_dir.display()));
        }
        if let Err(e) = tokio::fs::write(&dest, &document.body).await {
            let _ = tokio::fs::remove_file(&dest).await;
            return StrategyOutcome::SoftFailure(format!("{}: {e}", dest.display()));
        }

        StrategyOutcome::Resolved(Artifact {
            paths: vec![dest],
            license: None,
            is_open_access: record.is_open_access,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::download::{ClientOptions, HttpClient, RateLimiter, RetryPolicy};
    use crate::fulltext::FetchError;
    use crate::fulltext::fetch::{FetchedDocument, RenderedFetcher};
    use crate::record::{RecordIds, SourceKind};
    use crate::test_support::socket_guard::start_mock_server_or_skip;

    /// Browser that always lands on the same HTML interstitial.
    struct InterstitialBrowser;

    #[async_trait]
    impl RenderedFetcher for InterstitialBrowser {
        async fn fetch_rendered(&self, url: &str, _landing_url: Option<&str>) -> Result<FetchedDocument, FetchError> {
            Ok(FetchedDocument {
                url: url.to_string(),
                body: b"<html>verify you are human</html>".to_vec(),
                content_type: Some("text/html".into()),
                looks_like_pdf: false,
                via_browser: true,
            })
        }
    }

    fn strategy_with(doc_dir: PathBuf, rendered: Option<Arc<dyn RenderedFetcher>>) -> DirectPdfStrategy {
        let client = HttpClient::new(ClientOptions::default(), Arc::new(RateLimiter::disabled())).unwrap();
        let fetcher = DocumentFetcher::new(&client, rendered).with_retry_policy(RetryPolicy::with_max_attempts(1));
        DirectPdfStrategy::new(Arc::new(fetcher), Arc::new(ConcurrencyBudget::default()), doc_dir)
    }

    fn strategy(doc_dir: PathBuf) -> DirectPdfStrategy {
        strategy_with(doc_dir, None)
    }

    async fn mount_html(server: &MockServer) {
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html>Just a moment...</html>"),
            )
            .mount(server)
            .await;
    }

    fn record(pdf_url: Option<String>) -> BibliographicRecord {
        let mut record = BibliographicRecord::new(
            SourceKind::OpenAlex,
            RecordIds {
                openalex: Some("W123".into()),
                ..RecordIds::default()
            },
        );
        record.pdf_url = pdf_url;
        record.is_open_access = true;
        record
    }

    #[tokio::test]
    async fn test_missing_pdf_url_is_hard_failure() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = strategy(dir.path().to_path_buf())
            .attempt(&record(None), &mut ResolutionState::default())
            .await;
        assert!(matches!(outcome, StrategyOutcome::HardFailure(_)));
    }

    #[tokio::test]
    async fn test_writes_document_named_after_record() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/w123.pdf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/pdf")
                    .set_body_bytes(b"%PDF-1.6".to_vec()),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let rec = record(Some(format!("{}/w123.pdf", server.uri())));
        let outcome = strategy(dir.path().to_path_buf())
            .attempt(&rec, &mut ResolutionState::default())
            .await;

        let expected = dir.path().join("W123.pdf");
        assert_eq!(
            outcome,
            StrategyOutcome::Resolved(Artifact {
                paths: vec![expected.clone()],
                license: None,
                is_open_access: true,
            })
        );
        assert_eq!(std::fs::read(expected).unwrap(), b"%PDF-1.6");
    }

    #[tokio::test]
    async fn test_fetch_failure_is_soft() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let rec = record(Some(format!("{}/missing.pdf", server.uri())));
        let outcome = strategy(dir.path().to_path_buf())
            .attempt(&rec, &mut ResolutionState::default())
            .await;
        assert!(matches!(outcome, StrategyOutcome::SoftFailure(_)));
        assert!(!dir.path().join("W123.pdf").exists());
    }

    #[tokio::test]
    async fn test_html_body_is_not_saved() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        mount_html(&server).await;

        let dir = tempfile::tempdir().unwrap();
        let rec = record(Some(format!("{}/w123.pdf", server.uri())));
        let outcome = strategy(dir.path().to_path_buf())
            .attempt(&rec, &mut ResolutionState::default())
            .await;
        assert!(matches!(outcome, StrategyOutcome::SoftFailure(ref r) if r.contains("non-document")));
        assert!(!dir.path().join("W123.pdf").exists());
    }

    #[tokio::test]
    async fn test_browser_interstitial_is_soft_failure() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        mount_html(&server).await;

        let dir = tempfile::tempdir().unwrap();
        let rec = record(Some(format!("{}/w123.pdf", server.uri())));
        let outcome = strategy_with(dir.path().to_path_buf(), Some(Arc::new(InterstitialBrowser)))
            .attempt(&rec, &mut ResolutionState::default())
            .await;
        assert!(matches!(outcome, StrategyOutcome::SoftFailure(_)));
        assert!(!dir.path().join("W123.pdf").exists());
    }
}
