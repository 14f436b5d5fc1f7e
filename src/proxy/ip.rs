//! Public IP discovery through IP-echo services

use crate::proxy::transport::{Route, Transport};
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::debug;

/// Echo services in priority order
pub const DEFAULT_IP_ECHO_URLS: &[&str] = &[
    "https://api.ipify.org",
    "https://icanhazip.com",
    "https://checkip.amazonaws.com",
    "https://ifconfig.me/ip",
];

static IPV4_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\b").expect("Invalid IPv4 regex")
});

/// First valid dotted quad found in `body`
pub fn first_ipv4(body: &str) -> Option<Ipv4Addr> {
    IPV4_REGEX
        .captures_iter(body)
        .find_map(|caps| caps[1].parse::<Ipv4Addr>().ok())
}

/// Whether `body` mentions `ip` as a whole dotted quad
pub fn mentions_ip(body: &str, ip: Ipv4Addr) -> bool {
    IPV4_REGEX
        .captures_iter(body)
        .any(|caps| caps[1].parse::<Ipv4Addr>().ok() == Some(ip))
}

/// Ask each echo service in turn which address `route` egresses from.
///
/// Falls through to the next service on any failure; `None` when all fail.
pub async fn resolve_public_ip(
    transport: &dyn Transport,
    route: Route<'_>,
    echo_urls: &[String],
    timeout: Duration,
) -> Option<Ipv4Addr> {
    for url in echo_urls {
        match transport.get(route, url, timeout).await {
            Ok(reply) if (200..400).contains(&reply.status) => {
                if let Some(ip) = first_ipv4(&reply.body) {
                    return Some(ip);
                }
                debug!(url = %url, "echo service returned no address");
            }
            Ok(reply) => debug!(url = %url, status = reply.status, "echo service rejected request"),
            Err(e) => debug!(url = %url, error = %e, "echo service unreachable"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::proxy::transport::HttpReply;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<Vec<Result<HttpReply, TransportError>>>,
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn get(
            &self,
            _route: Route<'_>,
            _url: &str,
            _timeout: Duration,
        ) -> Result<HttpReply, TransportError> {
            self.replies.lock().unwrap().remove(0)
        }
    }

    #[test]
    fn test_first_ipv4() {
        assert_eq!(first_ipv4("  203.0.113.9\n"), Some(Ipv4Addr::new(203, 0, 113, 9)));
        assert_eq!(first_ipv4("{\"ip\":\"999.1.1.1\"} 8.8.4.4"), Some(Ipv4Addr::new(8, 8, 4, 4)));
        assert_eq!(first_ipv4("no address"), None);
    }

    #[test]
    fn test_mentions_ip() {
        let ip = Ipv4Addr::new(1, 2, 3, 4);
        assert!(mentions_ip("REMOTE_ADDR = 1.2.3.4", ip));
        assert!(!mentions_ip("REMOTE_ADDR = 11.2.3.45", ip));
    }

    #[tokio::test]
    async fn test_resolve_falls_through() {
        let transport = Scripted {
            replies: Mutex::new(vec![
                Err(TransportError::Timeout),
                Ok(HttpReply::new(503, "down")),
                Ok(HttpReply::new(200, "198.51.100.7")),
            ]),
        };
        let urls: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let ip = resolve_public_ip(&transport, Route::Direct, &urls, Duration::from_secs(1)).await;
        assert_eq!(ip, Some(Ipv4Addr::new(198, 51, 100, 7)));
    }

    #[tokio::test]
    async fn test_resolve_all_fail() {
        let transport = Scripted {
            replies: Mutex::new(vec![Err(TransportError::Timeout)]),
        };
        let urls = vec!["a".to_string()];
        assert!(resolve_public_ip(&transport, Route::Direct, &urls, Duration::from_secs(1))
            .await
            .is_none());
    }
}
