use async_trait::async_trait;
use proxy_warden::job::{CheckerKind, JobInput, JobOptions, MemoryJobLock, Scheduler};
use proxy_warden::{
    CacheSet, Engine, EngineConfig, ExclusionCache, HttpReply, PortProbe, ProxyParser,
    ProxyStatus, ProxyStore, Route, Transport, TransportError,
};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const INPUT: &str = "103.160.204.144:80\nuser:pass@103.160.204.144:80";

/// Every port is closed
struct ClosedPorts {
    calls: AtomicUsize,
}

#[async_trait]
impl PortProbe for ClosedPorts {
    async fn is_open(&self, _address: &str, _timeout: Duration) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        false
    }
}

/// Counts requests and fails them all
struct CountingTransport {
    calls: AtomicUsize,
}

#[async_trait]
impl Transport for CountingTransport {
    async fn get(
        &self,
        _route: Route<'_>,
        _url: &str,
        _timeout: Duration,
    ) -> Result<HttpReply, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::Timeout)
    }
}

#[test]
fn test_extractor_prefers_credentials() {
    let candidates = ProxyParser::extract(INPUT);
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].address(), "103.160.204.144:80");
    assert_eq!(candidates[0].username(), Some("user"));
    assert_eq!(candidates[0].password(), Some("pass"));
}

#[tokio::test]
async fn test_closed_port_marks_record_dead() {
    let config = EngineConfig::default();
    let store = ProxyStore::open("sqlite::memory:").await.unwrap();
    let cache = ExclusionCache::open("sqlite::memory:", &config).await.unwrap();

    // a previous run left classification fields behind
    store
        .execute(
            "INSERT INTO proxies(proxy, status, type, https, latency, anonymity)
            VALUES('103.160.204.144:80', 'active', 'http', 1, 321.0, 'elite')",
        )
        .await
        .unwrap();

    let ports = Arc::new(ClosedPorts {
        calls: AtomicUsize::new(0),
    });
    let transport = Arc::new(CountingTransport {
        calls: AtomicUsize::new(0),
    });
    let engine = Engine::new(config, store, cache, transport.clone(), ports.clone())
        .with_device_ip(Some(Ipv4Addr::new(192, 0, 2, 1)));
    let engine = Arc::new(engine);
    let scheduler = Scheduler::new(engine.clone(), Arc::new(MemoryJobLock::new()));

    let options = JobOptions {
        kind: CheckerKind::Sweep,
        ..Default::default()
    };
    let summary = scheduler
        .accept(options)
        .unwrap()
        .run(JobInput::Text(INPUT.to_string()))
        .await
        .unwrap();

    assert_eq!(summary.total, 1);
    assert_eq!(summary.dead, 1);
    assert_eq!(ports.calls.load(Ordering::SeqCst), 1);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

    let record = engine.store().get("103.160.204.144:80").await.unwrap().unwrap();
    assert_eq!(record.status, Some(ProxyStatus::Dead));
    assert!(record.last_check.is_some());
    assert_eq!(record.latency, None);
    assert_eq!(record.anonymity, None);
    assert_eq!(record.proxy_type, None);
    assert_eq!(record.username.as_deref(), Some("user"));
    assert_eq!(record.password.as_deref(), Some("pass"));
    assert!(engine
        .cache()
        .contains(CacheSet::Dead, "103.160.204.144:80")
        .await
        .unwrap());
}
