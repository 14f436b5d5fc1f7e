//! Latency profiling through every tunneling protocol

use crate::config::EngineConfig;
use crate::proxy::models::{Protocol, ProxyCandidate};
use crate::proxy::transport::{Route, Transport};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Aggregate timing over all protocols and iterations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyReport {
    /// Mean of successful samples in milliseconds, 0 without any
    pub average: f64,
    pub min: u64,
    pub max: u64,
    pub success_count: usize,
    /// Always `protocols * iterations`
    pub total_count: usize,
}

impl LatencyReport {
    pub fn from_samples(samples: &[u64], total_count: usize) -> Self {
        if samples.is_empty() {
            return Self {
                average: 0.0,
                min: 0,
                max: 0,
                success_count: 0,
                total_count,
            };
        }

        let sum: u64 = samples.iter().sum();
        Self {
            average: sum as f64 / samples.len() as f64,
            min: samples.iter().copied().min().unwrap_or(0),
            max: samples.iter().copied().max().unwrap_or(0),
            success_count: samples.len(),
            total_count,
        }
    }

    /// Fraction of requests that succeeded
    pub fn reliability(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.total_count as f64
        }
    }
}

#[derive(Clone)]
pub struct LatencyProfiler {
    transport: Arc<dyn Transport>,
    endpoint: String,
    timeout: Duration,
    iterations: usize,
}

impl LatencyProfiler {
    pub fn new(transport: Arc<dyn Transport>, config: &EngineConfig) -> Self {
        Self {
            transport,
            endpoint: config.http_target.url.clone(),
            timeout: config.probe_timeout,
            iterations: config.latency_iterations,
        }
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    /// Time `iterations` GETs per protocol; responses in [200, 400) count as samples
    pub async fn measure(&self, candidate: &ProxyCandidate) -> LatencyReport {
        let per_protocol = Protocol::LATENCY
            .iter()
            .map(|&protocol| self.sample(candidate, protocol));

        let samples: Vec<u64> = join_all(per_protocol).await.into_iter().flatten().collect();
        LatencyReport::from_samples(&samples, Protocol::LATENCY.len() * self.iterations)
    }

    async fn sample(&self, candidate: &ProxyCandidate, protocol: Protocol) -> Vec<u64> {
        let mut samples = Vec::with_capacity(self.iterations);
        for _ in 0..self.iterations {
            let start = Instant::now();
            let reply = self
                .transport
                .get(Route::Via(candidate, protocol), &self.endpoint, self.timeout)
                .await;
            if let Ok(reply) = reply {
                if (200..400).contains(&reply.status) {
                    samples.push(start.elapsed().as_millis() as u64);
                }
            }
        }
        samples
    }
}
