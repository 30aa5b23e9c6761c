//! Rate-limited, retrying HTTP client shared by every network-facing component.
//!
//! [`HttpClient`] wraps one pooled `reqwest::Client` with a cookie jar, a
//! per-host [`RateLimiter`] and a [`RetryPolicy`]. Single attempts go through
//! [`HttpClient::execute`]; [`HttpClient::request`] and the convenience
//! helpers run the attempt inside the retry loop.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::cookie::Jar;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, REQUEST_TIMEOUT_SECS};
use super::error::DownloadError;
use super::rate_limiter::{RateLimiter, parse_retry_after};
use super::retry::RetryPolicy;
use crate::user_agent::{HeaderProfile, headers_for};

/// Construction options for [`HttpClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Contact address placed in the API User-Agent.
    pub contact_email: String,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Default per-request timeout; individual requests may override it.
    pub request_timeout: Duration,
    /// Retry policy applied by [`HttpClient::request`].
    pub retry: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            contact_email: String::new(),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
        }
    }
}

/// Body attached to a [`RequestSpec`].
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// `application/x-www-form-urlencoded` pairs.
    Form(Vec<(String, String)>),
    /// JSON document.
    Json(serde_json::Value),
}

/// One outbound request.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub profile: HeaderProfile,
    /// Extra headers layered over the profile headers.
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
    /// Overrides the client's default request timeout.
    pub timeout: Option<Duration>,
}

impl RequestSpec {
    /// A GET request with the API header profile.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            profile: HeaderProfile::Api,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// A HEAD request with the browser header profile.
    #[must_use]
    pub fn head(url: impl Into<String>) -> Self {
        Self {
            method: Method::HEAD,
            profile: HeaderProfile::Browser,
            ..Self::get(url)
        }
    }

    /// A form POST with the API header profile.
    #[must_use]
    pub fn post_form(url: impl Into<String>, form: Vec<(String, String)>) -> Self {
        Self {
            method: Method::POST,
            body: Some(RequestBody::Form(form)),
            ..Self::get(url)
        }
    }

    /// A JSON POST with the API header profile.
    #[must_use]
    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            body: Some(RequestBody::Json(body)),
            ..Self::get(url)
        }
    }

    /// Switches the header profile.
    #[must_use]
    pub fn profile(mut self, profile: HeaderProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Adds one header; invalid values are skipped.
    #[must_use]
    pub fn header(mut self, name: reqwest::header::HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Sets a per-request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Returns a header as text, if present and valid.
    #[must_use]
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Lossy UTF-8 view of the body.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Shared HTTP client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    rate_limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    contact_email: String,
    request_timeout: Duration,
}

impl HttpClient {
    /// Builds a client with its own cookie jar.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Network`] if the TLS backend cannot be initialised.
    pub fn new(options: ClientOptions, rate_limiter: Arc<RateLimiter>) -> Result<Self, DownloadError> {
        let client = build_client(Arc::new(Jar::default()), options.connect_timeout)
            .map_err(|e| DownloadError::network("client-builder", e))?;
        debug!(
            max_retries = options.retry.max_attempts(),
            spacing_ms = rate_limiter.min_spacing().as_millis(),
            "created HTTP client"
        );
        Ok(Self {
            client,
            rate_limiter,
            retry: options.retry,
            contact_email: options.contact_email,
            request_timeout: options.request_timeout,
        })
    }

    /// Returns a copy of this client using a different retry policy.
    #[must_use]
    pub fn with_retry_policy(&self, retry: RetryPolicy) -> Self {
        Self {
            retry,
            ..self.clone()
        }
    }

    /// The retry policy used by [`HttpClient::request`].
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Sends exactly one attempt. Non-success statuses become [`DownloadError::HttpStatus`].
    ///
    /// A 429 carrying `Retry-After` pauses the host in the rate limiter.
    ///
    /// # Errors
    ///
    /// Any transport, timeout or status failure.
    #[instrument(skip(self, spec), fields(method = %spec.method, url = %spec.url))]
    pub async fn execute(&self, spec: &RequestSpec) -> Result<HttpResponse, DownloadError> {
        let response = self.send(spec).await?;
        let url = response.url().to_string();
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_send_error(&spec.url, e))?
            .to_vec();
        Ok(HttpResponse {
            url,
            status,
            headers,
            body,
        })
    }

    /// Sends `spec` under the client's retry policy.
    ///
    /// # Errors
    ///
    /// The last failure once retries are exhausted, or the first permanent one.
    pub async fn request(&self, spec: RequestSpec) -> Result<HttpResponse, DownloadError> {
        self.retry
            .run(&spec.url, |_attempt| self.execute(&spec))
            .await
    }

    /// GETs `url` with query `params` and decodes a JSON body.
    ///
    /// # Errors
    ///
    /// Request failures, or [`DownloadError::Decode`] for an unparseable body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<T, DownloadError> {
        let full_url = with_query(url, params)?;
        let response = self.request(RequestSpec::get(full_url.clone())).await?;
        serde_json::from_slice(&response.body)
            .map_err(|e| DownloadError::decode(full_url, e.to_string()))
    }

    /// GETs `url` with query `params` and returns the body as text.
    ///
    /// # Errors
    ///
    /// Request failures.
    pub async fn get_text(&self, url: &str, params: &[(&str, String)]) -> Result<String, DownloadError> {
        let full_url = with_query(url, params)?;
        Ok(self.request(RequestSpec::get(full_url)).await?.text())
    }

    /// POSTs a urlencoded form and returns the body as text.
    ///
    /// # Errors
    ///
    /// Request failures.
    pub async fn post_form_text(
        &self,
        url: &str,
        form: &[(&str, String)],
    ) -> Result<String, DownloadError> {
        let form = form
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        Ok(self.request(RequestSpec::post_form(url, form)).await?.text())
    }

    /// Streams `url` to `dest`, retrying transient failures. Partial files are removed.
    ///
    /// # Errors
    ///
    /// Request or file-system failures.
    #[instrument(skip(self), fields(dest = %dest.display()))]
    pub async fn download_to_file(
        &self,
        url: &str,
        dest: &Path,
        profile: HeaderProfile,
    ) -> Result<u64, DownloadError> {
        let spec = RequestSpec::get(url).profile(profile);
        self.retry
            .run(url, |_attempt| self.stream_once(&spec, dest))
            .await
    }

    async fn stream_once(&self, spec: &RequestSpec, dest: &Path) -> Result<u64, DownloadError> {
        let response = self.send(spec).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }
        let mut file = File::create(dest)
            .await
            .map_err(|e| DownloadError::io(dest, e))?;

        match stream_to_file(&mut file, response, &spec.url, dest).await {
            Ok(bytes) => {
                debug!(bytes, "download complete");
                Ok(bytes)
            }
            Err(e) => {
                drop(file);
                if let Err(cleanup) = tokio::fs::remove_file(dest).await {
                    warn!(path = %dest.display(), error = %cleanup, "failed to remove partial download");
                }
                Err(e)
            }
        }
    }

    async fn send(&self, spec: &RequestSpec) -> Result<reqwest::Response, DownloadError> {
        Url::parse(&spec.url).map_err(|_| DownloadError::invalid_url(&spec.url))?;
        self.rate_limiter.acquire(&spec.url).await;

        let mut headers = headers_for(spec.profile, &self.contact_email);
        headers.extend(spec.headers.clone());

        let mut request = self
            .client
            .request(spec.method.clone(), &spec.url)
            .headers(headers)
            .timeout(spec.timeout.unwrap_or(self.request_timeout));
        match &spec.body {
            Some(RequestBody::Form(pairs)) => {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                    .finish();
                request = request
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(encoded);
            }
            Some(RequestBody::Json(value)) => {
                request = request.json(value);
            }
            None => {}
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_send_error(&spec.url, e))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        if status == 429
            && let Some(delay) = retry_after.as_deref().and_then(parse_retry_after)
        {
            self.rate_limiter.record_rate_limit(&spec.url, delay).await;
        }
        Err(DownloadError::http_status_with_retry_after(
            &spec.url,
            status,
            retry_after,
        ))
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

/// Appends query parameters to `url`.
///
/// # Errors
///
/// [`DownloadError::InvalidUrl`] when `url` does not parse.
pub fn with_query(url: &str, params: &[(&str, String)]) -> Result<String, DownloadError> {
    if params.is_empty() {
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        return Ok(url.to_string());
    }
    Url::parse_with_params(url, params.iter().map(|(k, v)| (*k, v.as_str())))
        .map(String::from)
        .map_err(|_| DownloadError::invalid_url(url))
}

fn map_send_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else {
        DownloadError::network(url, error)
    }
}

/// Streams the response body to `file`, returning bytes written.
async fn stream_to_file(
    file: &mut File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| map_send_error(url, e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path, e))?;
        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;

    Ok(bytes_written)
}

fn build_client(jar: Arc<Jar>, connect_timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .gzip(true)
        .cookie_provider(jar)
        .build()
}
