//! Job scheduler: lock admission, budgeted chunked dispatch, persistence of verdicts

use crate::cache::CacheSet;
use crate::database::CheckUpdate;
use crate::engine::Engine;
use crate::error::LockError;
use crate::job::lock::{acquire, JobKey, JobLock, JobLockGuard, Trigger};
use crate::job::progress::{Mark, ProgressLog};
use crate::proxy::models::{Anonymity, Protocol, ProxyCandidate, ProxyRecord, ProxyStatus};
use crate::proxy::parser::ProxyParser;
use crate::Result;
use anyhow::bail;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Which checker is running; decides freshness and what counts as already done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckerKind {
    #[default]
    Full,
    Https,
    /// Periodic re-check of everything already classified
    Sweep,
}

impl CheckerKind {
    /// Lock namespace
    pub fn script(&self) -> &'static str {
        match self {
            CheckerKind::Full => "check-full",
            CheckerKind::Https => "check-https",
            CheckerKind::Sweep => "check-sweep",
        }
    }

    pub fn freshness(&self) -> chrono::Duration {
        match self {
            CheckerKind::Full => chrono::Duration::hours(5),
            CheckerKind::Https => chrono::Duration::hours(4),
            CheckerKind::Sweep => chrono::Duration::hours(24),
        }
    }

    /// Whether the stored result already meets this checker's goal
    pub fn satisfied_by(&self, record: &ProxyRecord) -> bool {
        match self {
            CheckerKind::Full => record.status == Some(ProxyStatus::Active),
            CheckerKind::Https => record.status == Some(ProxyStatus::Active) && record.https,
            CheckerKind::Sweep => !matches!(record.status, None | Some(ProxyStatus::Untested)),
        }
    }

    /// Checked within the freshness window with a result this checker accepts
    pub fn is_fresh(&self, record: &ProxyRecord, now: DateTime<Utc>) -> bool {
        match record.last_check {
            Some(checked) => now - checked < self.freshness() && self.satisfied_by(record),
            None => false,
        }
    }
}

impl fmt::Display for CheckerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckerKind::Full => "full",
            CheckerKind::Https => "https",
            CheckerKind::Sweep => "sweep",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for CheckerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "full" => Ok(CheckerKind::Full),
            "https" => Ok(CheckerKind::Https),
            "sweep" => Ok(CheckerKind::Sweep),
            _ => bail!("Invalid checker kind: {}. Use: full, https, sweep", s),
        }
    }
}

/// Where a job's candidates come from
#[derive(Debug, Clone)]
pub enum JobInput {
    /// Free-form text handed over by a collaborator
    Text(String),
    /// One explicit `address[@user:pass]`
    Single(String),
    /// Sample of stored untested/active rows
    Store { limit: i64 },
}

/// JSON reply telling the caller whether the job was accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub error: bool,
    pub message: String,
}

impl JobStatus {
    pub fn accepted(kind: CheckerKind) -> Self {
        Self {
            error: false,
            message: format!("{} check started", kind),
        }
    }

    pub fn rejected(err: &LockError) -> Self {
        Self {
            error: true,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub kind: CheckerKind,
    pub session: String,
    pub trigger: Trigger,
    /// Admin runs ignore the execution budget
    pub admin: bool,
    pub log_path: Option<PathBuf>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            kind: CheckerKind::default(),
            session: "cli".to_string(),
            trigger: Trigger::Scheduled,
            admin: false,
            log_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub total: usize,
    pub active: usize,
    pub dead: usize,
    pub skipped: usize,
    /// Candidates left untouched when the budget ran out
    pub remaining: usize,
}

/// Per-candidate result as shown in the progress log
#[derive(Debug, Clone, PartialEq)]
enum Verdict {
    Skipped(&'static str),
    Dead(String),
    Active {
        protocols: Vec<Protocol>,
        anonymity: Anonymity,
        latency: Option<f64>,
    },
}

impl Verdict {
    fn mark(&self) -> Mark {
        match self {
            Verdict::Skipped(_) => Mark::Skip,
            Verdict::Dead(_) => Mark::Fail,
            Verdict::Active { .. } => Mark::Ok,
        }
    }

    fn detail(&self) -> String {
        match self {
            Verdict::Skipped(reason) => reason.to_string(),
            Verdict::Dead(error) => error.clone(),
            Verdict::Active {
                protocols,
                anonymity,
                latency,
            } => match latency {
                Some(ms) => format!("{} {} {:.0}ms", Protocol::join(protocols), anonymity, ms),
                None => format!("{} {}", Protocol::join(protocols), anonymity),
            },
        }
    }
}

/// Admits jobs under the job lock and hands out runnable jobs
pub struct Scheduler {
    engine: Arc<Engine>,
    lock: Arc<dyn JobLock>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, lock: Arc<dyn JobLock>) -> Self {
        Self { engine, lock }
    }

    /// Take the job lock for `options`; nothing is touched when this fails
    pub fn accept(&self, options: JobOptions) -> std::result::Result<AcceptedJob, LockError> {
        let key = JobKey::new(options.kind.script(), &options.session, options.trigger);
        let guard = acquire(self.lock.clone(), key, self.engine.config().lock_cap)?;
        info!(kind = %options.kind, session = %options.session, "job accepted");
        Ok(AcceptedJob {
            engine: self.engine.clone(),
            options,
            _guard: guard,
        })
    }
}

/// A job holding its lock; the lock goes with it
pub struct AcceptedJob {
    engine: Arc<Engine>,
    options: JobOptions,
    _guard: JobLockGuard,
}

impl AcceptedJob {
    pub fn status(&self) -> JobStatus {
        JobStatus::accepted(self.options.kind)
    }

    pub async fn run(self, input: JobInput) -> Result<JobSummary> {
        let engine = self.engine.as_ref();
        let config = engine.config();

        match engine.cache().purge_if_due().await {
            Ok(Some(removed)) => debug!(removed, "exclusion cache purged"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "exclusion cache purge failed"),
        }

        let liveness_timeout = match input {
            JobInput::Single(_) => config.long_liveness_timeout,
            _ => config.short_liveness_timeout,
        };
        let candidates = self.resolve(input).await?;

        let mut log = ProgressLog::create(self.options.log_path.as_deref())?;
        let device_ip = engine.device_ip().await;
        let started = Instant::now();

        let mut summary = JobSummary {
            total: candidates.len(),
            ..Default::default()
        };
        info!(total = summary.total, kind = %self.options.kind, "checking candidates");

        let mut index = 0;
        for chunk in candidates.chunks(config.chunk_size) {
            if !self.options.admin && started.elapsed() >= config.execution_budget {
                summary.remaining = candidates.len() - index;
                info!(remaining = summary.remaining, "execution budget exhausted");
                break;
            }

            let checks = chunk
                .iter()
                .map(|candidate| self.check_one(candidate, device_ip, liveness_timeout));
            let verdicts = join_all(checks).await;

            for (candidate, verdict) in chunk.iter().zip(verdicts) {
                index += 1;
                match verdict {
                    Verdict::Skipped(_) => summary.skipped += 1,
                    Verdict::Dead(_) => summary.dead += 1,
                    Verdict::Active { .. } => summary.active += 1,
                }
                log.line(index, &candidate.address(), verdict.mark(), &verdict.detail());
            }
        }

        info!(
            active = summary.active,
            dead = summary.dead,
            skipped = summary.skipped,
            remaining = summary.remaining,
            "job finished"
        );
        Ok(summary)
    }

    async fn resolve(&self, input: JobInput) -> Result<Vec<ProxyCandidate>> {
        let store = self.engine.store();
        let candidates = match input {
            JobInput::Text(text) => ProxyParser::extract(&text),
            JobInput::Single(address) => match ProxyParser::parse_single(&address) {
                Some(candidate) => vec![candidate],
                None => bail!("Invalid proxy address: {}", address),
            },
            JobInput::Store { limit } => {
                return Ok(store
                    .sample_for_check(limit)
                    .await?
                    .iter()
                    .filter_map(ProxyRecord::candidate)
                    .collect())
            }
        };

        for candidate in &candidates {
            if let Err(e) = store.insert_candidate(candidate).await {
                warn!(proxy = %candidate.address(), error = %e, "failed to store candidate");
            }
        }
        Ok(candidates)
    }

    async fn check_one(
        &self,
        candidate: &ProxyCandidate,
        device_ip: Option<Ipv4Addr>,
        liveness_timeout: Duration,
    ) -> Verdict {
        let engine = self.engine.as_ref();
        let address = candidate.address();

        if self.cached(CacheSet::Dead, &address).await {
            return Verdict::Skipped("recently dead");
        }
        if self.cached(CacheSet::Used, &address).await {
            return Verdict::Skipped("recently used");
        }
        match engine.store().get(&address).await {
            Ok(Some(record)) if self.options.kind.is_fresh(&record, Utc::now()) => {
                return Verdict::Skipped("checked recently")
            }
            Ok(_) => {}
            Err(e) => warn!(proxy = %address, error = %e, "failed to read stored record"),
        }

        let report = engine
            .prober()
            .check_proxy(candidate, device_ip, liveness_timeout)
            .await;
        let protocols = report.working_protocols();

        if protocols.is_empty() {
            let error = report.first_error().unwrap_or("not working").to_string();
            self.persist(&address, CheckUpdate::dead(Utc::now()), CacheSet::Dead)
                .await;
            return Verdict::Dead(error);
        }

        let (anonymity, latency) = tokio::join!(
            engine.classifier().classify(candidate, device_ip),
            engine.profiler().measure(candidate)
        );
        let latency = (latency.success_count > 0).then_some(latency.average);

        let update = CheckUpdate {
            status: ProxyStatus::Active,
            proxy_type: Some(Protocol::join(&protocols)),
            https: report.https(),
            latency,
            anonymity: Some(anonymity.anonymity),
            checked_at: Utc::now(),
        };
        self.persist(&address, update, CacheSet::Used).await;

        Verdict::Active {
            protocols,
            anonymity: anonymity.anonymity,
            latency,
        }
    }

    async fn cached(&self, set: CacheSet, address: &str) -> bool {
        self.engine
            .cache()
            .contains(set, address)
            .await
            .unwrap_or_else(|e| {
                warn!(proxy = %address, error = %e, "exclusion cache lookup failed");
                false
            })
    }

    /// Write the verdict and its cache entry; failures are logged, never raised
    async fn persist(&self, address: &str, update: CheckUpdate, set: CacheSet) {
        let engine = self.engine.as_ref();
        if let Err(e) = engine.store().record_check(address, &update).await {
            warn!(proxy = %address, error = %e, "failed to record check");
        }
        if let Err(e) = engine.cache().mark(set, address).await {
            warn!(proxy = %address, error = %e, "failed to update exclusion cache");
        }
    }
}
