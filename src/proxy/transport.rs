//! HTTP transport, direct or tunneled through a candidate proxy

use crate::error::TransportError;
use crate::proxy::models::{Protocol, ProxyCandidate};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Proxy as ReqwestProxy};
use std::error::Error as StdError;
use std::time::Duration;

/// Default user agent for probe requests
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

static TITLE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("Invalid title regex"));

/// How a request reaches its target
#[derive(Debug, Clone, Copy)]
pub enum Route<'a> {
    Direct,
    Via(&'a ProxyCandidate, Protocol),
}

/// Minimal view of an HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Contents of the first `<title>` element, trimmed
    pub fn title(&self) -> Option<&str> {
        TITLE_REGEX
            .captures(&self.body)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim())
    }

    /// Case-insensitive substring match against the page title
    pub fn title_matches(&self, expected: &str) -> bool {
        self.title()
            .map(|title| title.to_lowercase().contains(&expected.to_lowercase()))
            .unwrap_or(false)
    }
}

/// Issues GET requests; the seam the probes are instrumented through
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(
        &self,
        route: Route<'_>,
        url: &str,
        timeout: Duration,
    ) -> Result<HttpReply, TransportError>;
}

/// `reqwest`-backed transport; one client per request since the proxy differs each time
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    user_agent: String,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }

    fn create_client(&self, route: Route<'_>, timeout: Duration) -> Result<Client, TransportError> {
        let mut builder = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(&self.user_agent);

        builder = match route {
            Route::Direct => builder.no_proxy(),
            Route::Via(candidate, protocol) => {
                let proxy = ReqwestProxy::all(candidate.url(protocol))
                    .map_err(|e| TransportError::Build(e.to_string()))?;
                builder.proxy(proxy)
            }
        };

        builder
            .build()
            .map_err(|e| TransportError::Build(e.to_string()))
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(
        &self,
        route: Route<'_>,
        url: &str,
        timeout: Duration,
    ) -> Result<HttpReply, TransportError> {
        let client = self.create_client(route, timeout)?;
        let response = client.get(url).send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify)?;
        Ok(HttpReply { status, body })
    }
}

/// Map a reqwest error onto the retry-relevant taxonomy
fn classify(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        return TransportError::Timeout;
    }

    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }

    if is_tls_handshake_drop(&message) {
        TransportError::TlsHandshakeDropped(message)
    } else {
        TransportError::Request(message)
    }
}

/// Socket closed while the TLS handshake was still in progress
pub(crate) fn is_tls_handshake_drop(message: &str) -> bool {
    let lower = message.to_lowercase();
    (lower.contains("handshake") || lower.contains("secure tls connection"))
        && ["eof", "closed", "reset", "disconnected"]
            .iter()
            .any(|needle| lower.contains(needle))
}
