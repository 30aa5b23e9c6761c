//! Headless Chromium fallback for documents that refuse plain HTTP clients.
//!
//! Each fetch launches an isolated browser under a browser budget slot.
//! [`BrowserGuard`] owns the browser and its CDP handler task; it is closed
//! explicitly on every normal path and from `Drop` when the future is
//! cancelled. [`BrowserSessions`] counts browsers until their close has
//! finished, so shutdown can wait for them.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventResponseReceived, GetResponseBodyParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use futures_util::StreamExt;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use super::FetchError;
use super::fetch::{DEFAULT_REFERER, FetchedDocument, RenderedFetcher};
use super::sniff::{is_pdf_response, looks_like_pdf};
use crate::download::ConcurrencyBudget;
use crate::user_agent::BROWSER_USER_AGENT;

static PDF_SEGMENT: LazyLock<Regex> = LazyLock::new(|| compile(r"/pdf(/|$)"));

#[allow(clippy::expect_used)]
fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static regex pattern is valid")
}

/// `url` with a `/pdf/` path segment collapsed, used as a navigation warm-up.
#[must_use]
pub fn strip_pdf_segment(url: &str) -> String {
    PDF_SEGMENT.replace(url, "/").into_owned()
}

/// Browser launch settings.
#[derive(Debug, Clone)]
pub struct ChromiumOptions {
    pub headless: bool,
    pub user_agent: String,
    /// Bound on each navigation or in-page request.
    pub timeout: Duration,
    /// Chrome binary; auto-detected when `None`.
    pub executable: Option<PathBuf>,
}

impl Default for ChromiumOptions {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: BROWSER_USER_AGENT.to_string(),
            timeout: Duration::from_secs(20),
            executable: None,
        }
    }
}

#[derive(Debug, Default)]
struct SessionCount {
    open: AtomicUsize,
    closed: Notify,
}

/// Live count of launched browsers whose close has not completed.
#[derive(Debug, Clone, Default)]
pub struct BrowserSessions {
    inner: Arc<SessionCount>,
}

impl BrowserSessions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn open(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    fn ticket(&self) -> SessionTicket {
        self.inner.open.fetch_add(1, Ordering::SeqCst);
        SessionTicket {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Waits until every session has closed. Returns `false` if some are
    /// still open after `grace`.
    pub async fn wait_closed(&self, grace: Duration) -> bool {
        let all_closed = async {
            loop {
                let notified = self.inner.closed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.open() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, all_closed).await.is_ok()
    }
}

/// Held for as long as one browser is alive.
struct SessionTicket {
    inner: Arc<SessionCount>,
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        self.inner.open.fetch_sub(1, Ordering::SeqCst);
        self.inner.closed.notify_waiters();
    }
}

/// Owns a launched browser and its event-loop task.
pub struct BrowserGuard {
    browser: Option<Browser>,
    handler: Option<JoinHandle<()>>,
    ticket: Option<SessionTicket>,
}

impl BrowserGuard {
    /// Launches Chromium and spawns its CDP handler. The browser counts as
    /// open in `sessions` until it has been closed.
    ///
    /// # Errors
    ///
    /// [`FetchError::Launch`] when configuration or process start fails.
    pub async fn launch(options: &ChromiumOptions, sessions: &BrowserSessions) -> Result<Self, FetchError> {
        let mut builder = BrowserConfig::builder().arg(format!("--user-agent={}", options.user_agent));
        if !options.headless {
            builder = builder.with_head();
        }
        if let Some(executable) = &options.executable {
            builder = builder.chrome_executable(executable);
        }
        let config = builder.build().map_err(FetchError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| FetchError::Launch(e.to_string()))?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    trace!(error = %e, "browser handler error");
                }
            }
        });
        debug!(headless = options.headless, "browser launched");
        Ok(Self {
            browser: Some(browser),
            handler: Some(handler),
            ticket: Some(sessions.ticket()),
        })
    }

    fn browser(&self) -> Result<&Browser, FetchError> {
        self.browser
            .as_ref()
            .ok_or_else(|| FetchError::Launch("browser already closed".to_string()))
    }

    /// Closes the browser and stops the handler.
    pub async fn close(mut self) {
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                warn!(error = %e, "browser close failed");
            }
            if let Err(e) = browser.wait().await {
                debug!(error = %e, "browser wait failed");
            }
        }
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
        self.ticket.take();
        debug!("browser closed");
    }
}

impl Drop for BrowserGuard {
    fn drop(&mut self) {
        let browser = self.browser.take();
        let handler = self.handler.take();
        let ticket = self.ticket.take();
        if browser.is_none() && handler.is_none() {
            return;
        }
        // Without a runtime the browser is dropped here, which kills the
        // child process.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            if let Some(handler) = handler {
                handler.abort();
            }
            return;
        };
        runtime.spawn(async move {
            if let Some(mut browser) = browser {
                if let Err(e) = browser.close().await {
                    warn!(error = %e, "browser drop cleanup failed");
                }
                let _ = browser.wait().await;
            }
            if let Some(handler) = handler {
                handler.abort();
            }
            drop(ticket);
        });
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InPageResponse {
    ok: bool,
    status: u16,
    url: String,
    content_type: String,
    disposition: String,
    body: String,
}

fn in_page_fetch_script(url: &str, referer: &str) -> Result<String, FetchError> {
    let url = serde_json::to_string(url).map_err(|e| FetchError::browser(url, e))?;
    let referer = serde_json::to_string(referer).map_err(|e| FetchError::browser(&url, e))?;
    Ok(format!(
        r"(async () => {{
  const r = await fetch({url}, {{
    credentials: 'include',
    referrer: {referer},
    headers: {{ 'Accept': 'application/pdf,application/octet-stream;q=0.9,*/*;q=0.8' }}
  }});
  const bytes = new Uint8Array(await r.arrayBuffer());
  let bin = '';
  for (let i = 0; i < bytes.length; i += 0x8000) {{
    bin += String.fromCharCode.apply(null, bytes.subarray(i, i + 0x8000));
  }}
  return {{
    ok: r.ok,
    status: r.status,
    url: r.url,
    contentType: r.headers.get('content-type') || '',
    disposition: r.headers.get('content-disposition') || '',
    body: btoa(bin)
  }};
}})()"
    ))
}

/// [`RenderedFetcher`] backed by chromiumoxide.
pub struct ChromiumFetcher {
    options: ChromiumOptions,
    budget: Arc<ConcurrencyBudget>,
    sessions: BrowserSessions,
}

impl ChromiumFetcher {
    #[must_use]
    pub fn new(options: ChromiumOptions, budget: Arc<ConcurrencyBudget>) -> Self {
        Self {
            options,
            budget,
            sessions: BrowserSessions::new(),
        }
    }

    /// Handle on the browsers this fetcher has open.
    #[must_use]
    pub fn sessions(&self) -> BrowserSessions {
        self.sessions.clone()
    }

    async fn fetch_in_page(&self, page: &Page, url: &str, referer: &str) -> Result<FetchedDocument, FetchError> {
        let params = EvaluateParams::builder()
            .expression(in_page_fetch_script(url, referer)?)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(|e| FetchError::browser(url, e))?;
        let evaluated = tokio::time::timeout(self.options.timeout, page.evaluate_expression(params))
            .await
            .map_err(|_| FetchError::timeout(url))?
            .map_err(|e| FetchError::browser(url, e))?;
        let response: InPageResponse = evaluated
            .into_value()
            .map_err(|e| FetchError::browser(url, e))?;
        if !response.ok {
            return Err(FetchError::browser(url, format!("in-page fetch returned {}", response.status)));
        }
        let body = STANDARD
            .decode(response.body.as_bytes())
            .map_err(|e| FetchError::browser(url, e))?;
        let content_type = (!response.content_type.is_empty()).then_some(response.content_type);
        let is_pdf = looks_like_pdf(
            content_type.as_deref(),
            Some(response.disposition.as_str()).filter(|d| !d.is_empty()),
            &body,
        );
        Ok(FetchedDocument {
            url: response.url,
            body,
            content_type,
            looks_like_pdf: is_pdf,
            via_browser: true,
        })
    }

    async fn capture_navigation(
        &self,
        page: &Page,
        url: &str,
        landing_url: Option<&str>,
    ) -> Result<FetchedDocument, FetchError> {
        if let Err(e) = page.execute(EnableParams::default()).await {
            warn!(url, error = %e, "failed to enable network events");
        }

        let warm_up = landing_url.map_or_else(|| strip_pdf_segment(url), ToString::to_string);
        match tokio::time::timeout(self.options.timeout, page.goto(warm_up.as_str())).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(url = %warm_up, error = %e, "warm-up navigation failed"),
            Err(_) => debug!(url = %warm_up, "warm-up navigation timed out"),
        }

        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| FetchError::browser(url, e))?;

        // Navigating straight to a PDF often aborts or errors; the response
        // event is still emitted.
        if let Ok(Err(e)) = tokio::time::timeout(self.options.timeout, page.goto(url)).await {
            debug!(url, error = %e, "document navigation reported an error");
        }

        let captured = tokio::time::timeout(self.options.timeout, async {
            while let Some(event) = responses.next().await {
                if is_pdf_response(&event.response.mime_type, &event.response.url) {
                    return Some((
                        event.request_id.clone(),
                        event.response.url.clone(),
                        event.response.mime_type.clone(),
                    ));
                }
            }
            None
        })
        .await
        .map_err(|_| FetchError::timeout(url))?;
        let Some((request_id, response_url, mime_type)) = captured else {
            return Err(FetchError::browser(url, "no PDF response observed"));
        };

        let returned = page
            .execute(GetResponseBodyParams::new(request_id))
            .await
            .map_err(|e| FetchError::browser(url, e))?;
        let body = if returned.result.base64_encoded {
            STANDARD
                .decode(returned.result.body.as_bytes())
                .map_err(|e| FetchError::browser(url, e))?
        } else {
            returned.result.body.clone().into_bytes()
        };
        let is_pdf = looks_like_pdf(Some(&mime_type), None, &body);
        if !is_pdf {
            warn!(url, "captured browser response does not look like a PDF");
        }
        Ok(FetchedDocument {
            url: response_url,
            body,
            content_type: Some(mime_type),
            looks_like_pdf: is_pdf,
            via_browser: true,
        })
    }

    async fn run_session(&self, guard: &BrowserGuard, url: &str, landing_url: Option<&str>) -> Result<FetchedDocument, FetchError> {
        let browser = guard.browser()?;
        let start = landing_url.unwrap_or("about:blank");
        let page = tokio::time::timeout(self.options.timeout, browser.new_page(start))
            .await
            .map_err(|_| FetchError::timeout(start))?
            .map_err(|e| FetchError::browser(start, e))?;

        let referer = landing_url.unwrap_or(DEFAULT_REFERER);
        match self.fetch_in_page(&page, url, referer).await {
            Ok(document) if document.looks_like_pdf => return Ok(document),
            Ok(_) => debug!(url, "in-page fetch returned a non-PDF body"),
            Err(e) => debug!(url, error = %e, "in-page fetch failed"),
        }
        self.capture_navigation(&page, url, landing_url).await
    }
}

impl std::fmt::Debug for ChromiumFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChromiumFetcher")
            .field("options", &self.options)
            .field("open_sessions", &self.sessions.open())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RenderedFetcher for ChromiumFetcher {
    #[instrument(skip(self))]
    async fn fetch_rendered(&self, url: &str, landing_url: Option<&str>) -> Result<FetchedDocument, FetchError> {
        let _permit = self.budget.acquire_browser().await;
        let guard = tokio::time::timeout(self.options.timeout, BrowserGuard::launch(&self.options, &self.sessions))
            .await
            .map_err(|_| FetchError::Launch("browser launch timed out".to_string()))??;

        let result = self.run_session(&guard, url, landing_url).await;
        guard.close().await;

        if let Ok(document) = &result {
            info!(url, bytes = document.body.len(), pdf = document.looks_like_pdf, "browser capture complete");
        }
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_pdf_segment() {
        assert_eq!(
            strip_pdf_segment("https://journal.example/doi/pdf/10.1/abc"),
            "https://journal.example/doi/10.1/abc"
        );
        assert_eq!(strip_pdf_segment("https://x.example/article/pdf"), "https://x.example/article/");
        assert_eq!(strip_pdf_segment("https://x.example/a.pdf"), "https://x.example/a.pdf");
    }

    #[test]
    fn test_in_page_script_quotes_url() {
        let script = in_page_fetch_script("https://x.example/a'b\".pdf", DEFAULT_REFERER).unwrap();
        assert!(script.contains(r#""https://x.example/a'b\".pdf""#));
        assert!(script.contains("credentials: 'include'"));
    }

    #[test]
    fn test_default_options_are_headless() {
        let options = ChromiumOptions::default();
        assert!(options.headless);
        assert_eq!(options.user_agent, BROWSER_USER_AGENT);
    }

    #[tokio::test]
    async fn test_sessions_wait_until_last_ticket_dropped() {
        let sessions = BrowserSessions::new();
        assert!(sessions.wait_closed(Duration::from_millis(10)).await);

        let first = sessions.ticket();
        let second = sessions.ticket();
        assert_eq!(sessions.open(), 2);
        assert!(!sessions.wait_closed(Duration::from_millis(20)).await);

        drop(first);
        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(second);
        });
        assert!(sessions.wait_closed(Duration::from_secs(2)).await);
        assert_eq!(sessions.open(), 0);
        closer.await.unwrap();
    }
}
