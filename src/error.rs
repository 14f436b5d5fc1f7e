//! Typed errors for the transport and job-lock seams

use std::time::Duration;

/// Failure of a single HTTP request, direct or tunneled
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    /// The peer dropped the socket before the TLS handshake completed
    #[error("TLS handshake dropped: {0}")]
    TlsHandshakeDropped(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("client build failed: {0}")]
    Build(String),
}

/// Failure to take a job lock
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another process is running (pid {pid}, {}s ago)", .age.as_secs())]
    Busy { pid: u32, age: Duration },
    #[error("too many concurrent {namespace} jobs ({count}/{cap})")]
    CapExceeded {
        namespace: String,
        count: usize,
        cap: usize,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
