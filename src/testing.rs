//! In-process stand-ins for the network seams, used by unit tests

use crate::error::TransportError;
use crate::proxy::liveness::PortProbe;
use crate::proxy::models::Protocol;
use crate::proxy::transport::{HttpReply, Route, Transport};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type Handler = dyn Fn(Option<Protocol>, &str) -> Result<HttpReply, TransportError> + Send + Sync;

/// HTML page carrying `title`
pub fn page(status: u16, title: &str) -> HttpReply {
    HttpReply::new(
        status,
        format!("<html><head><title>{title}</title></head><body></body></html>"),
    )
}

/// Transport answering from a closure (or a fixed script) and counting calls
pub struct StubTransport {
    handler: Box<Handler>,
    calls: AtomicUsize,
}

impl StubTransport {
    pub fn new(
        handler: impl Fn(Option<Protocol>, &str) -> Result<HttpReply, TransportError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
        }
    }

    /// Replies in order; timeouts once the script runs out
    pub fn sequence(replies: Vec<Result<HttpReply, TransportError>>) -> Self {
        let script = Mutex::new(VecDeque::from(replies));
        Self::new(move |_, _| {
            script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(TransportError::Timeout))
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn get(
        &self,
        route: Route<'_>,
        url: &str,
        _timeout: Duration,
    ) -> Result<HttpReply, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let protocol = match route {
            Route::Direct => None,
            Route::Via(_, protocol) => Some(protocol),
        };
        (self.handler)(protocol, url)
    }
}

/// Port probe with a fixed answer or an explicit set of open addresses
pub struct StubPortProbe {
    open: Option<HashSet<String>>,
    default: bool,
    calls: AtomicUsize,
}

impl StubPortProbe {
    pub fn fixed(open: bool) -> Self {
        Self {
            open: None,
            default: open,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn open_only(addresses: &[&str]) -> Self {
        Self {
            open: Some(addresses.iter().map(|a| a.to_string()).collect()),
            default: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortProbe for StubPortProbe {
    async fn is_open(&self, address: &str, _timeout: Duration) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.open {
            Some(set) => set.contains(address),
            None => self.default,
        }
    }
}
