//! HTTPS JSON-RPC transport.
//!
//! One [`HttpClient`] belongs to one task (the dispatcher worker); separate
//! instances are independent and may live on separate tasks.

use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Configuration for the HTTPS client.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Total per-request timeout.
    pub timeout: Duration,
    /// Verify the server certificate.
    pub verify_tls: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            verify_tls: true,
        }
    }
}

/// Seam between the dispatcher and the HTTPS layer so tests can script the
/// exchange's responses.
#[async_trait]
pub trait JsonRpcTransport: Send + Sync + 'static {
    /// POST a JSON-RPC body, optionally with a bearer token, and return the
    /// raw response body.
    async fn post_json(&self, url: &str, body: String, bearer: Option<&str>) -> Result<String>;
}

/// Blocking-free HTTPS client for single JSON-RPC calls.
pub struct HttpClient {
    http: reqwest::Client,
    last_status: AtomicU16,
    last_error: Mutex<Option<String>>,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .default_headers(headers);
        if !config.verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("HTTP client build failed: {}", e)))?;

        Ok(Self {
            http,
            last_status: AtomicU16::new(0),
            last_error: Mutex::new(None),
        })
    }

    /// POST `body` to `url` and return the raw response body.
    pub async fn post(&self, url: &str, body: String, bearer: Option<&str>) -> Result<String> {
        let mut request = self.http.post(url).body(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        self.perform(request).await
    }

    /// GET `url` and return the raw response body.
    pub async fn get(&self, url: &str) -> Result<String> {
        self.perform(self.http.get(url)).await
    }

    async fn perform(&self, request: reqwest::RequestBuilder) -> Result<String> {
        let response = request.send().await.map_err(|e| self.record_error(e))?;
        self.last_status
            .store(response.status().as_u16(), Ordering::Relaxed);
        debug!("Upstream HTTP status: {}", response.status());
        response.text().await.map_err(|e| self.record_error(e))
    }

    fn record_error(&self, e: reqwest::Error) -> Error {
        let message = e.to_string();
        *self.last_error.lock().expect("last_error lock") = Some(message.clone());
        Error::Transport(message)
    }

    /// Status code of the most recent completed request, if any.
    pub fn last_status(&self) -> Option<u16> {
        match self.last_status.load(Ordering::Relaxed) {
            0 => None,
            code => Some(code),
        }
    }

    /// Diagnostic from the most recent transport failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("last_error lock").clone()
    }
}

#[async_trait]
impl JsonRpcTransport for HttpClient {
    async fn post_json(&self, url: &str, body: String, bearer: Option<&str>) -> Result<String> {
        self.post(url, body, bearer).await
    }
}
