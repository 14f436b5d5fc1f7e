//! Raw TCP liveness probe

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

/// Check whether `address` accepts a TCP connection within `timeout`.
///
/// Every failure path (refused, unreachable, timeout, unparsable address) yields `false`.
pub async fn is_open(address: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            trace!(address, error = %e, "port closed");
            false
        }
        Err(_) => {
            trace!(address, "port probe timed out");
            false
        }
    }
}

/// Injectable liveness check
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_open(&self, address: &str, timeout: Duration) -> bool;
}

/// Plain TCP connect probe
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpPortProbe;

#[async_trait]
impl PortProbe for TcpPortProbe {
    async fn is_open(&self, address: &str, timeout: Duration) -> bool {
        is_open(address, timeout).await
    }
}
