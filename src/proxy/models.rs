//! Proxy data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tunneling protocol a proxy may relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
    Socks4,
    Socks4a,
    Socks5,
    Socks5h,
}

impl Protocol {
    /// Every protocol the engine knows how to tunnel through
    pub const ALL: [Protocol; 6] = [
        Protocol::Http,
        Protocol::Https,
        Protocol::Socks4,
        Protocol::Socks4a,
        Protocol::Socks5,
        Protocol::Socks5h,
    ];

    /// Protocols probed by the composite check and the anonymity classifier
    pub const CORE: [Protocol; 3] = [Protocol::Http, Protocol::Socks4, Protocol::Socks5];

    /// Protocols sampled by the latency profiler
    pub const LATENCY: [Protocol; 5] = [
        Protocol::Http,
        Protocol::Socks4,
        Protocol::Socks5,
        Protocol::Socks4a,
        Protocol::Socks5h,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Socks4 => "socks4",
            Protocol::Socks4a => "socks4a",
            Protocol::Socks5 => "socks5",
            Protocol::Socks5h => "socks5h",
        }
    }

    /// Join protocol names the way the `type` column stores them, e.g. `http-socks5`
    pub fn join(protocols: &[Protocol]) -> String {
        protocols
            .iter()
            .map(Protocol::as_str)
            .collect::<Vec<_>>()
            .join("-")
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Protocol::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("unknown protocol: {}", s))
    }
}

/// Proxy authentication credentials
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

impl ProxyAuth {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}

/// A normalized `ip:port` candidate produced by the extractor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyCandidate {
    pub ip: String,
    pub port: u16,
    pub auth: Option<ProxyAuth>,
}

impl ProxyCandidate {
    pub fn new(ip: String, port: u16) -> Self {
        Self {
            ip,
            port,
            auth: None,
        }
    }

    pub fn with_auth(ip: String, port: u16, username: String, password: String) -> Self {
        Self {
            ip,
            port,
            auth: Some(ProxyAuth::new(username, password)),
        }
    }

    /// The `ip:port` key
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn username(&self) -> Option<&str> {
        self.auth.as_ref().map(|a| a.username.as_str())
    }

    pub fn password(&self) -> Option<&str> {
        self.auth.as_ref().map(|a| a.password.as_str())
    }

    /// Proxy URL for the given tunneling protocol, credentials inline
    pub fn url(&self, protocol: Protocol) -> String {
        let auth_part = self.auth.as_ref().map_or(String::new(), |auth| {
            format!("{}:{}@", auth.username, auth.password)
        });

        format!("{}://{}{}:{}", protocol, auth_part, self.ip, self.port)
    }
}

impl fmt::Display for ProxyCandidate {
    /// Serializes as `user:pass@ip:port`, or bare `ip:port`; the extractor reads both back
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.auth {
            Some(auth) => write!(f, "{}:{}@{}:{}", auth.username, auth.password, self.ip, self.port),
            None => write!(f, "{}:{}", self.ip, self.port),
        }
    }
}

/// Lifecycle status of a persisted proxy record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyStatus {
    #[default]
    Untested,
    Active,
    Dead,
    PortOpen,
    PortClosed,
}

impl ProxyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::Untested => "untested",
            ProxyStatus::Active => "active",
            ProxyStatus::Dead => "dead",
            ProxyStatus::PortOpen => "port-open",
            ProxyStatus::PortClosed => "port-closed",
        }
    }
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "untested" => Ok(ProxyStatus::Untested),
            "active" => Ok(ProxyStatus::Active),
            "dead" => Ok(ProxyStatus::Dead),
            "port-open" => Ok(ProxyStatus::PortOpen),
            "port-closed" => Ok(ProxyStatus::PortClosed),
            other => Err(anyhow::anyhow!("unknown proxy status: {}", other)),
        }
    }
}

/// Anonymity level, ordered worst to best
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Anonymity {
    Unknown,
    Transparent,
    Anonymous,
    Elite,
}

impl Anonymity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Anonymity::Unknown => "unknown",
            Anonymity::Transparent => "transparent",
            Anonymity::Anonymous => "anonymous",
            Anonymity::Elite => "elite",
        }
    }
}

impl fmt::Display for Anonymity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Anonymity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "unknown" => Ok(Anonymity::Unknown),
            "transparent" => Ok(Anonymity::Transparent),
            "anonymous" => Ok(Anonymity::Anonymous),
            "elite" => Ok(Anonymity::Elite),
            other => Err(anyhow::anyhow!("unknown anonymity level: {}", other)),
        }
    }
}

/// Persistent proxy row, one per unique address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProxyRecord {
    pub proxy: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Hyphen-joined working protocols
    pub proxy_type: Option<String>,
    pub https: bool,
    /// `None` when the stored value is null or empty
    pub status: Option<ProxyStatus>,
    pub latency: Option<f64>,
    pub anonymity: Option<Anonymity>,
    pub last_check: Option<DateTime<Utc>>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub timezone: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl ProxyRecord {
    /// Host part of the address, split on the first `:`
    pub fn ip(&self) -> &str {
        self.proxy.split_once(':').map_or(self.proxy.as_str(), |(ip, _)| ip)
    }

    pub fn candidate(&self) -> Option<ProxyCandidate> {
        let (ip, port) = self.proxy.split_once(':')?;
        let port: u16 = port.parse().ok()?;
        Some(match (&self.username, &self.password) {
            (Some(user), Some(pass)) if !user.is_empty() => {
                ProxyCandidate::with_auth(ip.to_string(), port, user.clone(), pass.clone())
            }
            _ => ProxyCandidate::new(ip.to_string(), port),
        })
    }
}

/// Outcome of a single-protocol probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProbeOutcome {
    pub working: bool,
    pub is_https: bool,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn working(is_https: bool) -> Self {
        Self {
            working: true,
            is_https,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            working: false,
            is_https: false,
            error: Some(error.into()),
        }
    }
}
