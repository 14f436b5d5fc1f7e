//! Per-job engine context
//!
//! Built once at job start and shared by reference with every component; holds the
//! stores, the network seams and the device IP resolved for this run.

use crate::cache::ExclusionCache;
use crate::config::EngineConfig;
use crate::database::ProxyStore;
use crate::proxy::anonymity::AnonymityClassifier;
use crate::proxy::checker::ProtocolProber;
use crate::proxy::consolidation::HostConsolidator;
use crate::proxy::ip::resolve_public_ip;
use crate::proxy::latency::LatencyProfiler;
use crate::proxy::liveness::{PortProbe, TcpPortProbe};
use crate::proxy::transport::{ReqwestTransport, Route, Transport};
use crate::Result;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

pub struct Engine {
    config: EngineConfig,
    store: ProxyStore,
    cache: ExclusionCache,
    transport: Arc<dyn Transport>,
    prober: ProtocolProber,
    classifier: AnonymityClassifier,
    profiler: LatencyProfiler,
    consolidator: HostConsolidator,
    device_ip: OnceCell<Option<Ipv4Addr>>,
}

impl Engine {
    /// Open the stores and wire the real network stack
    pub async fn open(config: EngineConfig, database_url: &str, cache_url: &str) -> Result<Self> {
        let store = ProxyStore::open(database_url).await?;
        let cache = ExclusionCache::open(cache_url, &config).await?;
        Ok(Self::new(
            config,
            store,
            cache,
            Arc::new(ReqwestTransport::new()),
            Arc::new(TcpPortProbe),
        ))
    }

    pub fn new(
        config: EngineConfig,
        store: ProxyStore,
        cache: ExclusionCache,
        transport: Arc<dyn Transport>,
        port_probe: Arc<dyn PortProbe>,
    ) -> Self {
        let prober = ProtocolProber::new(transport.clone(), port_probe.clone(), &config);
        let classifier = AnonymityClassifier::new(transport.clone(), &config);
        let profiler = LatencyProfiler::new(transport.clone(), &config);
        let consolidator = HostConsolidator::new(port_probe, &config);
        Self {
            config,
            store,
            cache,
            transport,
            prober,
            classifier,
            profiler,
            consolidator,
            device_ip: OnceCell::new(),
        }
    }

    /// Skip device-IP discovery and use `ip` for this run
    pub fn with_device_ip(mut self, ip: Option<Ipv4Addr>) -> Self {
        self.device_ip = OnceCell::new_with(Some(ip));
        self
    }

    /// Public IP of this host, resolved once per engine
    pub async fn device_ip(&self) -> Option<Ipv4Addr> {
        *self
            .device_ip
            .get_or_init(|| async {
                let ip = resolve_public_ip(
                    self.transport.as_ref(),
                    Route::Direct,
                    &self.config.ip_echo_urls,
                    self.config.probe_timeout,
                )
                .await;
                match ip {
                    Some(ip) => info!(%ip, "resolved device ip"),
                    None => warn!("could not resolve device ip; egress comparison disabled"),
                }
                ip
            })
            .await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &ProxyStore {
        &self.store
    }

    pub fn cache(&self) -> &ExclusionCache {
        &self.cache
    }

    pub fn prober(&self) -> &ProtocolProber {
        &self.prober
    }

    pub fn classifier(&self) -> &AnonymityClassifier {
        &self.classifier
    }

    pub fn profiler(&self) -> &LatencyProfiler {
        &self.profiler
    }

    pub fn consolidator(&self) -> &HostConsolidator {
        &self.consolidator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::transport::HttpReply;
    use crate::testing::{StubPortProbe, StubTransport};

    async fn engine(transport: Arc<StubTransport>) -> Engine {
        let config = EngineConfig::default().with_ip_echo_urls(vec!["http://echo.test/".to_string()]);
        let store = ProxyStore::open("sqlite::memory:").await.unwrap();
        let cache = ExclusionCache::open("sqlite::memory:", &config).await.unwrap();
        Engine::new(config, store, cache, transport, Arc::new(StubPortProbe::fixed(true)))
    }

    #[tokio::test]
    async fn test_device_ip_resolved_once() {
        let transport = Arc::new(StubTransport::new(|_, _| Ok(HttpReply::new(200, "203.0.113.5\n"))));
        let engine = engine(transport.clone()).await;

        assert_eq!(engine.device_ip().await, Some(Ipv4Addr::new(203, 0, 113, 5)));
        assert_eq!(engine.device_ip().await, Some(Ipv4Addr::new(203, 0, 113, 5)));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_preset_device_ip() {
        let transport = Arc::new(StubTransport::new(|_, _| Ok(HttpReply::new(200, "1.1.1.1"))));
        let engine = engine(transport.clone())
            .await
            .with_device_ip(Some(Ipv4Addr::new(198, 51, 100, 1)));

        assert_eq!(engine.device_ip().await, Some(Ipv4Addr::new(198, 51, 100, 1)));
        assert_eq!(transport.calls(), 0);
    }
}
