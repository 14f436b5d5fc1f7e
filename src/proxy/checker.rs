//! Protocol prober: tunnels a known-title request through a candidate

use crate::config::{EngineConfig, TestTarget};
use crate::error::TransportError;
use crate::proxy::ip::resolve_public_ip;
use crate::proxy::liveness::PortProbe;
use crate::proxy::models::{ProbeOutcome, Protocol, ProxyCandidate};
use crate::proxy::transport::{HttpReply, Route, Transport};
use futures::future::join_all;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Retries after the peer drops the TLS handshake
const MAX_TLS_RETRIES: u32 = 4;

/// Retries against the plain-HTTP target after a 400 on the TLS target
const MAX_HTTP_FALLBACKS: u32 = 8;

/// Why an attempt should be repeated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryReason {
    TlsHandshakeDropped,
    BadRequest,
}

enum Attempt {
    Done(ProbeOutcome),
    Retry(RetryReason, String),
}

/// Result of the composite per-address check
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub port_open: bool,
    pub outcomes: Vec<(Protocol, ProbeOutcome)>,
}

impl CheckReport {
    fn closed(protocols: &[Protocol]) -> Self {
        Self {
            port_open: false,
            outcomes: protocols
                .iter()
                .map(|&p| (p, ProbeOutcome::failed("port closed")))
                .collect(),
        }
    }

    /// Protocols that count as valid: HTTPS-capable ones if any, else any working one
    pub fn working_protocols(&self) -> Vec<Protocol> {
        let https: Vec<Protocol> = self
            .outcomes
            .iter()
            .filter(|(_, o)| o.working && o.is_https)
            .map(|(p, _)| *p)
            .collect();
        if !https.is_empty() {
            return https;
        }
        self.outcomes
            .iter()
            .filter(|(_, o)| o.working)
            .map(|(p, _)| *p)
            .collect()
    }

    pub fn https(&self) -> bool {
        self.outcomes.iter().any(|(_, o)| o.working && o.is_https)
    }

    pub fn is_working(&self) -> bool {
        self.outcomes.iter().any(|(_, o)| o.working)
    }

    /// First captured error, for the progress log
    pub fn first_error(&self) -> Option<&str> {
        self.outcomes.iter().find_map(|(_, o)| o.error.as_deref())
    }
}

/// Probes candidates protocol by protocol
#[derive(Clone)]
pub struct ProtocolProber {
    transport: Arc<dyn Transport>,
    port_probe: Arc<dyn PortProbe>,
    https_target: TestTarget,
    http_target: TestTarget,
    ip_echo_urls: Vec<String>,
    timeout: Duration,
    accurate: bool,
}

impl ProtocolProber {
    pub fn new(
        transport: Arc<dyn Transport>,
        port_probe: Arc<dyn PortProbe>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            transport,
            port_probe,
            https_target: config.https_target.clone(),
            http_target: config.http_target.clone(),
            ip_echo_urls: config.ip_echo_urls.clone(),
            timeout: config.probe_timeout,
            accurate: config.accurate,
        }
    }

    pub fn https_target(&self) -> &TestTarget {
        &self.https_target
    }

    pub fn http_target(&self) -> &TestTarget {
        &self.http_target
    }

    /// Probe one protocol against `target`.
    ///
    /// TLS handshake drops are retried in place; a 400 from the TLS target switches to
    /// the plain-HTTP target when `allow_http_fallback` is set. Never fails: errors are
    /// folded into the outcome.
    pub async fn probe(
        &self,
        candidate: &ProxyCandidate,
        protocol: Protocol,
        target: &TestTarget,
        allow_http_fallback: bool,
        device_ip: Option<Ipv4Addr>,
    ) -> ProbeOutcome {
        let mut target = target;
        let mut tls_retries = 0;
        let mut fallbacks = 0;

        loop {
            let (reason, error) = match self.attempt(candidate, protocol, target, device_ip).await {
                Attempt::Done(outcome) => return outcome,
                Attempt::Retry(reason, error) => (reason, error),
            };

            match reason {
                RetryReason::TlsHandshakeDropped if tls_retries < MAX_TLS_RETRIES => {
                    tls_retries += 1;
                }
                RetryReason::BadRequest if allow_http_fallback && fallbacks < MAX_HTTP_FALLBACKS => {
                    fallbacks += 1;
                    target = &self.http_target;
                }
                _ => return ProbeOutcome::failed(error),
            }

            debug!(
                proxy = %candidate.address(),
                %protocol,
                ?reason,
                tls_retries,
                fallbacks,
                "retrying probe"
            );
        }
    }

    async fn attempt(
        &self,
        candidate: &ProxyCandidate,
        protocol: Protocol,
        target: &TestTarget,
        device_ip: Option<Ipv4Addr>,
    ) -> Attempt {
        let route = Route::Via(candidate, protocol);
        let reply = match self.transport.get(route, &target.url, self.timeout).await {
            Ok(reply) => reply,
            Err(TransportError::TlsHandshakeDropped(message)) => {
                return Attempt::Retry(RetryReason::TlsHandshakeDropped, message)
            }
            Err(e) => return Attempt::Done(ProbeOutcome::failed(e.to_string())),
        };

        if is_bad_request(&reply) {
            return Attempt::Retry(RetryReason::BadRequest, "HTTP 400 Bad Request".to_string());
        }

        let title_ok = reply.title_matches(&target.title);
        if self.verdict(title_ok, route, device_ip).await {
            Attempt::Done(ProbeOutcome::working(target.url.starts_with("https://")))
        } else {
            Attempt::Done(ProbeOutcome::failed(format!(
                "unexpected response: HTTP {} title {:?}",
                reply.status,
                reply.title().unwrap_or("")
            )))
        }
    }

    /// Accurate mode needs the title AND a changed egress IP; otherwise either suffices
    async fn verdict(&self, title_ok: bool, route: Route<'_>, device_ip: Option<Ipv4Addr>) -> bool {
        let Some(device_ip) = device_ip else {
            return title_ok;
        };
        if self.accurate {
            title_ok && self.egress_differs(route, device_ip).await
        } else {
            title_ok || self.egress_differs(route, device_ip).await
        }
    }

    async fn egress_differs(&self, route: Route<'_>, device_ip: Ipv4Addr) -> bool {
        match resolve_public_ip(self.transport.as_ref(), route, &self.ip_echo_urls, self.timeout).await {
            Some(ip) => ip != device_ip,
            None => false,
        }
    }

    /// Liveness first, then `http`, `socks4` and `socks5` concurrently.
    ///
    /// A closed port short-circuits every protocol without issuing requests.
    pub async fn check_proxy(
        &self,
        candidate: &ProxyCandidate,
        device_ip: Option<Ipv4Addr>,
        liveness_timeout: Duration,
    ) -> CheckReport {
        let address = candidate.address();
        if !self.port_probe.is_open(&address, liveness_timeout).await {
            debug!(proxy = %address, "port closed, skipping protocol probes");
            return CheckReport::closed(&Protocol::CORE);
        }

        let probes = Protocol::CORE.iter().map(|&protocol| async move {
            let outcome = self
                .probe(candidate, protocol, &self.https_target, true, device_ip)
                .await;
            (protocol, outcome)
        });

        CheckReport {
            port_open: true,
            outcomes: join_all(probes).await,
        }
    }
}

fn is_bad_request(reply: &HttpReply) -> bool {
    reply.status == 400
        || reply
            .title()
            .map(|t| t.to_lowercase().contains("bad request"))
            .unwrap_or(false)
}
