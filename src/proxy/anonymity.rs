//! Anonymity classification against header-echo judges

use crate::config::{EngineConfig, TestTarget};
use crate::proxy::ip::mentions_ip;
use crate::proxy::models::{Anonymity, Protocol, ProxyCandidate};
use crate::proxy::transport::{Route, Transport};
use futures::future::join_all;
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Header names whose presence in an echoed body betrays a proxy
pub const FORWARDING_HEADERS: &[&str] = &[
    "VIA",
    "X-FORWARDED-FOR",
    "FORWARDED-FOR",
    "X-FORWARDED",
    "FORWARDED",
    "CLIENT-IP",
    "FORWARDED-FOR-IP",
    "PROXY-CONNECTION",
    "X-PROXY-ID",
    "X-REAL-IP",
];

/// A forwarding header rendered as a name/value pair: `HTTP_VIA = ..`, `Via: ..`
/// or a table cell. Names inside longer words (`AVIATION`) do not count.
static HEADER_REGEX: Lazy<Regex> = Lazy::new(|| {
    let names: Vec<String> = FORWARDING_HEADERS.iter().map(|h| regex::escape(h)).collect();
    Regex::new(&format!(
        r"(?:^|[^A-Z0-9-])(?:HTTP-)?(?:{})\s*[=:<]",
        names.join("|")
    ))
    .expect("Invalid forwarding header regex")
});

/// How per-protocol levels from one judge collapse into a single verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TieBreak {
    /// Best observed level wins; only protocols reaching it are reported
    #[default]
    Best,
    /// Worst observed level wins; every matching protocol is reported
    Worst,
}

impl TieBreak {
    fn resolve(self, levels: &[(Protocol, Anonymity)]) -> (Anonymity, Vec<Protocol>) {
        let pick = match self {
            TieBreak::Best => levels.iter().map(|(_, a)| *a).max(),
            TieBreak::Worst => levels.iter().map(|(_, a)| *a).min(),
        };
        let Some(level) = pick else {
            return (Anonymity::Unknown, Vec::new());
        };
        let protocols = levels
            .iter()
            .filter(|(_, a)| self == TieBreak::Worst || *a == level)
            .map(|(p, _)| *p)
            .collect();
        (level, protocols)
    }
}

impl FromStr for TieBreak {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "best" => Ok(TieBreak::Best),
            "worst" => Ok(TieBreak::Worst),
            other => Err(anyhow::anyhow!("Invalid tie-break: {}. Use: best, worst", other)),
        }
    }
}

/// Verdict for one address
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnonymityReport {
    pub anonymity: Anonymity,
    pub protocols: Vec<Protocol>,
    /// Judge that produced the verdict
    pub judge: Option<String>,
}

impl AnonymityReport {
    pub fn unknown() -> Self {
        Self {
            anonymity: Anonymity::Unknown,
            protocols: Vec::new(),
            judge: None,
        }
    }
}

/// Rank one echoed judge body
pub fn rank_body(body: &str, device_ip: Option<Ipv4Addr>) -> Anonymity {
    if device_ip.is_some_and(|ip| mentions_ip(body, ip)) {
        return Anonymity::Transparent;
    }
    let normalized = body.to_uppercase().replace('_', "-");
    if HEADER_REGEX.is_match(&normalized) {
        Anonymity::Anonymous
    } else {
        Anonymity::Elite
    }
}

#[derive(Clone)]
pub struct AnonymityClassifier {
    transport: Arc<dyn Transport>,
    judges: Vec<TestTarget>,
    tie_break: TieBreak,
    timeout: Duration,
}

impl AnonymityClassifier {
    pub fn new(transport: Arc<dyn Transport>, config: &EngineConfig) -> Self {
        Self {
            transport,
            judges: config.judges.clone(),
            tie_break: config.tie_break,
            timeout: config.probe_timeout,
        }
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    /// Try judges in random order; the first reachable judge with at least one
    /// title-matching proxied response decides.
    pub async fn classify(
        &self,
        candidate: &ProxyCandidate,
        device_ip: Option<Ipv4Addr>,
    ) -> AnonymityReport {
        let mut judges = self.judges.clone();
        judges.shuffle(&mut rand::thread_rng());

        for judge in &judges {
            if !self.is_reachable(judge).await {
                debug!(judge = %judge.url, "judge unreachable");
                continue;
            }

            let probes = Protocol::CORE.iter().map(|&protocol| async move {
                let reply = self
                    .transport
                    .get(Route::Via(candidate, protocol), &judge.url, self.timeout)
                    .await;
                (protocol, reply)
            });

            let levels: Vec<(Protocol, Anonymity)> = join_all(probes)
                .await
                .into_iter()
                .filter_map(|(protocol, reply)| {
                    let reply = reply.ok()?;
                    reply
                        .title_matches(&judge.title)
                        .then(|| (protocol, rank_body(&reply.body, device_ip)))
                })
                .collect();

            if levels.is_empty() {
                continue;
            }

            let (anonymity, protocols) = self.tie_break.resolve(&levels);
            return AnonymityReport {
                anonymity,
                protocols,
                judge: Some(judge.url.clone()),
            };
        }

        AnonymityReport::unknown()
    }

    async fn is_reachable(&self, judge: &TestTarget) -> bool {
        match self.transport.get(Route::Direct, &judge.url, self.timeout).await {
            Ok(reply) => reply.title_matches(&judge.title),
            Err(_) => false,
        }
    }
}
