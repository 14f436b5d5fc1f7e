//! Proxy validation and classification
//!
//! This module provides:
//! - Extraction of candidates from free-form text
//! - TCP liveness probing
//! - Per-protocol tunneling probes with bounded retries
//! - Anonymity classification against header-echo judges
//! - Latency profiling
//! - Same-host consolidation of stored records

pub mod anonymity;
pub mod checker;
pub mod consolidation;
pub mod ip;
pub mod latency;
pub mod liveness;
pub mod models;
pub mod parser;
pub mod transport;

pub use anonymity::{AnonymityClassifier, AnonymityReport, TieBreak};
pub use checker::{CheckReport, ProtocolProber};
pub use consolidation::{ConsolidationSummary, HostConsolidator};
pub use latency::{LatencyProfiler, LatencyReport};
pub use liveness::{is_open, PortProbe, TcpPortProbe};
pub use models::{
    Anonymity, ProbeOutcome, Protocol, ProxyAuth, ProxyCandidate, ProxyRecord, ProxyStatus,
};
pub use parser::ProxyParser;
pub use transport::{HttpReply, ReqwestTransport, Route, Transport};
