//! Proxy Warden - proxy validation and classification engine
//!
//! Turns noisy scraped `ip:port` text into classified proxy records: which
//! protocols a proxy relays, how anonymous it is and how fast it answers.

pub mod cache;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod job;
pub mod logging;
pub mod proxy;

#[cfg(test)]
pub mod testing;

pub use cache::{CacheSet, ExclusionCache};
pub use config::{EngineConfig, TestTarget};
pub use database::{CheckUpdate, ProxyStore};
pub use engine::Engine;
pub use error::{LockError, TransportError};
pub use proxy::*;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
