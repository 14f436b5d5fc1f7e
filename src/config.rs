//! Engine configuration

use crate::proxy::anonymity::TieBreak;
use crate::proxy::ip::DEFAULT_IP_ECHO_URLS;
use std::path::PathBuf;
use std::time::Duration;

/// Default timeout for each proxied request in seconds
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

/// Liveness timeout used by batch sweeps
const DEFAULT_SHORT_LIVENESS_SECS: u64 = 10;

/// Liveness timeout used by single-proxy checks
const DEFAULT_LONG_LIVENESS_SECS: u64 = 60;

/// Candidates probed concurrently per chunk
const DEFAULT_CHUNK_SIZE: usize = 5;

/// Wall-clock budget for a non-admin job
const DEFAULT_EXECUTION_BUDGET_SECS: u64 = 120;

/// Concurrent lock files allowed per script namespace
const DEFAULT_LOCK_CAP: usize = 3;

const DEFAULT_LATENCY_ITERATIONS: usize = 5;

const DEFAULT_USED_TTL_SECS: u64 = 60 * 60;
const DEFAULT_DEAD_TTL_SECS: u64 = 5 * 60 * 60;
const DEFAULT_PURGE_INTERVAL_SECS: u64 = 30 * 60;

/// Groups smaller than this are left alone by host consolidation
const DEFAULT_CONSOLIDATION_MIN_GROUP: usize = 3;

/// A URL whose page title is known in advance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestTarget {
    pub url: String,
    pub title: String,
}

impl TestTarget {
    pub fn new(url: &str, title: &str) -> Self {
        Self {
            url: url.to_string(),
            title: title.to_string(),
        }
    }
}

/// Judges echoing request headers back in the body
pub fn default_judges() -> Vec<TestTarget> {
    vec![
        TestTarget::new("http://azenv.net/", "AZ Environment variables"),
        TestTarget::new("http://www.wfuchs.de/azenv.php", "AZ Environment variables"),
        TestTarget::new("http://mojeip.net.pl/asdfa/azenv.php", "AZ Environment variables"),
        TestTarget::new("http://httpheader.net/azenv.php", "AZ Environment variables"),
    ]
}

/// Configuration shared by every component of the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timeout for each proxied request
    pub probe_timeout: Duration,
    /// Liveness timeout for batch sweeps
    pub short_liveness_timeout: Duration,
    /// Liveness timeout for single-proxy checks
    pub long_liveness_timeout: Duration,
    /// TLS target used to prove HTTPS capability
    pub https_target: TestTarget,
    /// Plain-HTTP target, also the latency endpoint
    pub http_target: TestTarget,
    pub ip_echo_urls: Vec<String>,
    pub judges: Vec<TestTarget>,
    /// Require title match AND a changed egress IP, instead of either
    pub accurate: bool,
    pub tie_break: TieBreak,
    pub latency_iterations: usize,
    pub chunk_size: usize,
    pub execution_budget: Duration,
    pub lock_dir: PathBuf,
    pub lock_cap: usize,
    pub used_ttl: Duration,
    pub dead_ttl: Duration,
    pub purge_interval: Duration,
    pub consolidation_min_group: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            short_liveness_timeout: Duration::from_secs(DEFAULT_SHORT_LIVENESS_SECS),
            long_liveness_timeout: Duration::from_secs(DEFAULT_LONG_LIVENESS_SECS),
            https_target: TestTarget::new("https://www.example.com/", "Example Domain"),
            http_target: TestTarget::new("http://httpforever.com/", "HTTP Forever"),
            ip_echo_urls: DEFAULT_IP_ECHO_URLS.iter().map(|s| s.to_string()).collect(),
            judges: default_judges(),
            accurate: false,
            tie_break: TieBreak::default(),
            latency_iterations: DEFAULT_LATENCY_ITERATIONS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            execution_budget: Duration::from_secs(DEFAULT_EXECUTION_BUDGET_SECS),
            lock_dir: std::env::temp_dir().join("proxy-warden"),
            lock_cap: DEFAULT_LOCK_CAP,
            used_ttl: Duration::from_secs(DEFAULT_USED_TTL_SECS),
            dead_ttl: Duration::from_secs(DEFAULT_DEAD_TTL_SECS),
            purge_interval: Duration::from_secs(DEFAULT_PURGE_INTERVAL_SECS),
            consolidation_min_group: DEFAULT_CONSOLIDATION_MIN_GROUP,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_liveness_timeouts(mut self, short: Duration, long: Duration) -> Self {
        self.short_liveness_timeout = short;
        self.long_liveness_timeout = long;
        self
    }

    pub fn with_https_target(mut self, target: TestTarget) -> Self {
        self.https_target = target;
        self
    }

    pub fn with_http_target(mut self, target: TestTarget) -> Self {
        self.http_target = target;
        self
    }

    pub fn with_ip_echo_urls(mut self, urls: Vec<String>) -> Self {
        self.ip_echo_urls = urls;
        self
    }

    pub fn with_judges(mut self, judges: Vec<TestTarget>) -> Self {
        self.judges = judges;
        self
    }

    pub fn with_accurate(mut self, accurate: bool) -> Self {
        self.accurate = accurate;
        self
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn with_latency_iterations(mut self, iterations: usize) -> Self {
        self.latency_iterations = iterations;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_execution_budget(mut self, budget: Duration) -> Self {
        self.execution_budget = budget;
        self
    }

    pub fn with_lock_dir(mut self, dir: PathBuf) -> Self {
        self.lock_dir = dir;
        self
    }

    pub fn with_lock_cap(mut self, cap: usize) -> Self {
        self.lock_cap = cap;
        self
    }

    pub fn with_cache_ttls(mut self, used: Duration, dead: Duration) -> Self {
        self.used_ttl = used;
        self.dead_ttl = dead;
        self
    }

    pub fn with_consolidation_min_group(mut self, size: usize) -> Self {
        self.consolidation_min_group = size;
        self
    }
}
