//! Document fetching over plain HTTP with a rendered-browser fallback.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, RANGE, REFERER};
use tracing::{debug, info, instrument, warn};

use super::FetchError;
use super::sniff::looks_like_pdf;
use crate::download::{DownloadError, HttpClient, HttpResponse, RequestSpec, RetryPolicy};
use crate::user_agent::HeaderProfile;

/// Referer sent when no landing page is known.
pub const DEFAULT_REFERER: &str = "https://www.google.com/";

/// A fetched document body with what is known about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDocument {
    /// Final URL after redirects.
    pub url: String,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    /// Result of the signature check.
    pub looks_like_pdf: bool,
    pub via_browser: bool,
}

impl FetchedDocument {
    fn from_response(response: HttpResponse) -> Self {
        let content_type = response.header_str(CONTENT_TYPE.as_str()).map(ToString::to_string);
        let looks_like_pdf = looks_like_pdf(
            content_type.as_deref(),
            response.header_str(CONTENT_DISPOSITION.as_str()),
            &response.body,
        );
        Self {
            url: response.url,
            body: response.body,
            content_type,
            looks_like_pdf,
            via_browser: false,
        }
    }
}

/// Fetches a document from inside a real browser session.
#[async_trait]
pub trait RenderedFetcher: Send + Sync {
    async fn fetch_rendered(&self, url: &str, landing_url: Option<&str>) -> Result<FetchedDocument, FetchError>;
}

/// HTTP document fetcher that escalates to a [`RenderedFetcher`].
pub struct DocumentFetcher {
    client: HttpClient,
    rendered: Option<Arc<dyn RenderedFetcher>>,
}

impl DocumentFetcher {
    /// Uses `client` under the document retry preset.
    #[must_use]
    pub fn new(client: &HttpClient, rendered: Option<Arc<dyn RenderedFetcher>>) -> Self {
        Self {
            client: client.with_retry_policy(RetryPolicy::document()),
            rendered,
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.client = self.client.with_retry_policy(retry);
        self
    }

    /// Fetches `url`, falling back to the rendered fetcher when the HTTP path
    /// fails or returns something that is not a document.
    ///
    /// Without a fallback a suspect body is returned as-is; callers decide
    /// from [`FetchedDocument::looks_like_pdf`].
    ///
    /// # Errors
    ///
    /// The HTTP failure when no fallback is configured, otherwise
    /// [`FetchError::Exhausted`] when both paths fail.
    #[instrument(skip(self))]
    pub async fn fetch(&self, url: &str, landing_url: Option<&str>) -> Result<FetchedDocument, FetchError> {
        let http = self.fetch_http(url, landing_url).await;
        let Some(rendered) = &self.rendered else {
            return http.map_err(FetchError::Http);
        };
        let http_failure = match http {
            Ok(document) if document.looks_like_pdf => return Ok(document),
            Ok(document) => format!(
                "non-document content ({})",
                document.content_type.as_deref().unwrap_or("no content type")
            ),
            Err(e) => e.to_string(),
        };

        warn!(url, reason = %http_failure, "HTTP fetch unusable, escalating to browser");
        match rendered.fetch_rendered(url, landing_url).await {
            Ok(document) => {
                info!(url, bytes = document.body.len(), pdf = document.looks_like_pdf, "browser fetch finished");
                Ok(document)
            }
            Err(browser_error) => Err(FetchError::Exhausted {
                url: url.to_string(),
                http: http_failure,
                browser: browser_error.to_string(),
            }),
        }
    }

    async fn visit_landing(&self, landing_url: &str) -> Result<(), DownloadError> {
        let spec = RequestSpec::get(landing_url)
            .profile(HeaderProfile::Browser)
            .header(REFERER, landing_url);
        self.client.request(spec).await?;
        debug!(landing_url, "visited landing page");
        Ok(())
    }

    async fn fetch_http(&self, url: &str, landing_url: Option<&str>) -> Result<FetchedDocument, DownloadError> {
        let referer = landing_url.unwrap_or(DEFAULT_REFERER);
        if let Some(landing) = landing_url {
            self.visit_landing(landing).await?;
        }

        if let Err(e) = self.client.execute(&RequestSpec::head(url).header(REFERER, referer)).await {
            debug!(url, error = %e, "HEAD request failed");
        }

        let spec = RequestSpec::get(url)
            .profile(HeaderProfile::Browser)
            .header(REFERER, referer);
        let response = match self.client.request(spec.clone()).await {
            Ok(response) => response,
            Err(e) if matches!(e.status(), Some(401 | 403)) => {
                debug!(url, status = ?e.status(), "document refused, retrying with landing cookies");
                if let Some(landing) = landing_url {
                    self.visit_landing(landing).await?;
                }
                self.client.request(spec.header(RANGE, "bytes=0-")).await?
            }
            Err(e) => return Err(e),
        };

        let document = FetchedDocument::from_response(response);
        if !document.looks_like_pdf {
            warn!(
                url,
                content_type = document.content_type.as_deref().unwrap_or_default(),
                "response does not look like a PDF"
            );
        }
        Ok(document)
    }
}

impl std::fmt::Debug for DocumentFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentFetcher")
            .field("has_rendered_fallback", &self.rendered.is_some())
            .finish_non_exhaustive()
    }
}
