//! Candidate extraction from free-form text
//!
//! Recognized notations:
//! - `IP:PORT`, optionally `USER:PASS@IP:PORT` or `IP:PORT@USER:PASS`
//! - whitespace separated `IP PORT` (markup tags count as whitespace)
//! - JSON fragments carrying `"ip": "..."` and `"port": "..."` keys, in either order

use crate::proxy::models::ProxyCandidate;
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Shortest serialized address, `1.1.1.1:1`
const MIN_ADDRESS_LEN: usize = 7;

/// Longest serialized address, `255.255.255.255:65535`
const MAX_ADDRESS_LEN: usize = 21;

static COLON_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?:([^\s:@/"'<>,;]+):([^\s:@/"'<>,;]+)@)?(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d+)(?:@([^\s:@/"'<>,;]+):([^\s:@/"'<>,;]+))?"#,
    )
    .expect("Invalid IP:PORT regex")
});

static SPACED_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[^\d.:])(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})[ \t]+(\d+)\b")
        .expect("Invalid IP PORT regex")
});

static JSON_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""ip"\s*:\s*"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})"[^{}]*?"port"\s*:\s*"?(\d+)"?"#)
        .expect("Invalid JSON proxy regex")
});

static JSON_PORT_FIRST_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""port"\s*:\s*"?(\d+)"?[^{}]*?"ip"\s*:\s*"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})""#)
        .expect("Invalid JSON proxy regex")
});

static TAG_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("Invalid tag regex"));

/// Proxy parser turning raw text into deduplicated candidates
pub struct ProxyParser;

impl ProxyParser {
    /// Extract every valid candidate from `content`.
    ///
    /// Candidates are keyed by `ip:port`; a credentialed sighting replaces a bare one
    /// and later credentials replace earlier ones. Output keeps first-seen order.
    pub fn extract(content: &str) -> Vec<ProxyCandidate> {
        let mut found = Dedup::default();

        for caps in COLON_REGEX.captures_iter(content) {
            let Some(ip) = caps.get(3) else { continue };
            if !Self::quad_starts_clean(content, ip.start()) {
                continue;
            }
            let auth = match (caps.get(1), caps.get(2), caps.get(5), caps.get(6)) {
                (_, _, Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
                (Some(user), Some(pass), _, _) => Some((user.as_str(), pass.as_str())),
                _ => None,
            };
            if let Some(candidate) = Self::build(ip.as_str(), &caps[4], auth) {
                found.insert(candidate);
            }
        }

        let untagged = TAG_REGEX.replace_all(content, " ");
        for caps in SPACED_REGEX.captures_iter(&untagged) {
            if let Some(candidate) = Self::build(&caps[1], &caps[2], None) {
                found.insert(candidate);
            }
        }

        for caps in JSON_REGEX.captures_iter(content) {
            if let Some(candidate) = Self::build(&caps[1], &caps[2], None) {
                found.insert(candidate);
            }
        }
        for caps in JSON_PORT_FIRST_REGEX.captures_iter(content) {
            if let Some(candidate) = Self::build(&caps[2], &caps[1], None) {
                found.insert(candidate);
            }
        }

        found.into_vec()
    }

    /// Parse one explicit `address[@user:pass]` (or `user:pass@address`)
    pub fn parse_single(input: &str) -> Option<ProxyCandidate> {
        Self::extract(input.trim()).into_iter().next()
    }

    /// Extract candidates from a file
    pub fn extract_file<P: AsRef<Path>>(path: P) -> Result<Vec<ProxyCandidate>> {
        let content = fs::read_to_string(path)?;
        Ok(Self::extract(&content))
    }

    /// A dotted quad must not continue a longer number or dotted run to its left,
    /// otherwise `1234.5.6.7` would yield `234.5.6.7`
    fn quad_starts_clean(content: &str, start: usize) -> bool {
        !matches!(
            content[..start].chars().next_back(),
            Some(c) if c.is_ascii_digit() || c == '.'
        )
    }

    /// Validate raw captures and build a candidate
    fn build(ip: &str, port: &str, auth: Option<(&str, &str)>) -> Option<ProxyCandidate> {
        if !Self::is_valid_ip(ip) {
            return None;
        }
        let port: u32 = port.parse().ok()?;
        if !(1..=65535).contains(&port) {
            return None;
        }
        let port = port as u16;

        let len = ip.len() + 1 + port.to_string().len();
        if !(MIN_ADDRESS_LEN..=MAX_ADDRESS_LEN).contains(&len) {
            return None;
        }

        Some(match auth {
            Some((user, pass)) => {
                ProxyCandidate::with_auth(ip.to_string(), port, user.to_string(), pass.to_string())
            }
            None => ProxyCandidate::new(ip.to_string(), port),
        })
    }

    /// Dotted quad, octets <= 255, no leading zeros, first octet non-zero
    fn is_valid_ip(ip: &str) -> bool {
        let parts: Vec<&str> = ip.split('.').collect();
        if parts.len() != 4 {
            return false;
        }
        for part in &parts {
            if part.is_empty() || (part.len() > 1 && part.starts_with('0')) {
                return false;
            }
            match part.parse::<u32>() {
                Ok(num) if num <= 255 => {}
                _ => return false,
            }
        }
        parts[0] != "0"
    }
}

/// Address-keyed accumulator preserving first-seen order
#[derive(Default)]
struct Dedup {
    order: Vec<String>,
    by_address: HashMap<String, ProxyCandidate>,
}

impl Dedup {
    fn insert(&mut self, candidate: ProxyCandidate) {
        let address = candidate.address();
        match self.by_address.get(&address) {
            None => {
                self.order.push(address.clone());
                self.by_address.insert(address, candidate);
            }
            Some(_) if candidate.auth.is_some() => {
                self.by_address.insert(address, candidate);
            }
            Some(_) => {}
        }
    }

    fn into_vec(mut self) -> Vec<ProxyCandidate> {
        self.order
            .iter()
            .filter_map(|address| self.by_address.remove(address))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialize(candidates: &[ProxyCandidate]) -> String {
        candidates
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_extract_simple_lines() {
        let content = r#"
192.168.1.1:8080
192.168.1.2:3128
# comment 10.0.0.1:1080
"#;
        let proxies = ProxyParser::extract(content);
        assert_eq!(proxies.len(), 3);
        assert_eq!(proxies[0].address(), "192.168.1.1:8080");
    }

    #[test]
    fn test_credential_precedence() {
        let proxies = ProxyParser::extract("1.2.3.4:80\nuser:pass@1.2.3.4:80");
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].address(), "1.2.3.4:80");
        assert_eq!(proxies[0].username(), Some("user"));
        assert_eq!(proxies[0].password(), Some("pass"));

        // bare sighting after the credentialed one does not erase credentials
        let proxies = ProxyParser::extract("user:pass@1.2.3.4:80 1.2.3.4:80");
        assert_eq!(proxies.len(), 1);
        assert!(proxies[0].auth.is_some());
    }

    #[test]
    fn test_later_credentials_overwrite() {
        let proxies = ProxyParser::extract("a:b@1.2.3.4:80\n1.2.3.4:80@c:d");
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].username(), Some("c"));
        assert_eq!(proxies[0].password(), Some("d"));
    }

    #[test]
    fn test_port_boundaries() {
        assert!(ProxyParser::extract("203.0.113.1:0").is_empty());
        assert!(ProxyParser::extract("203.0.113.1:65536").is_empty());
        assert_eq!(ProxyParser::extract("203.0.113.1:1").len(), 1);
        assert_eq!(ProxyParser::extract("203.0.113.1:65535").len(), 1);
    }

    #[test]
    fn test_invalid_ips_rejected() {
        assert!(ProxyParser::extract("999.999.999.999:8080").is_empty());
        assert!(ProxyParser::extract("0.1.2.3:8080").is_empty());
        assert!(ProxyParser::extract("01.2.3.4:8080").is_empty());
        assert!(ProxyParser::extract("garbage text without proxies").is_empty());
        assert!(ProxyParser::extract("1234.5.6.7:80").is_empty());
        assert!(ProxyParser::extract("1.2.3.4.5:8080").is_empty());
        assert!(ProxyParser::extract("1234.5.6.7 80\n1.2.3.4.5 8080").is_empty());
        assert!(ProxyParser::extract(r#"{"ip":"1.2.3.4.5","port":"8080"}"#).is_empty());
    }

    #[test]
    fn test_quad_boundary_keeps_neighbours() {
        let content = "a:b@1.2.3.4:80, proxy=5.6.7.8:3128.";
        let addresses: Vec<_> = ProxyParser::extract(content)
            .iter()
            .map(ProxyCandidate::address)
            .collect();
        assert_eq!(addresses, vec!["1.2.3.4:80", "5.6.7.8:3128"]);
    }

    #[test]
    fn test_whitespace_notation() {
        let proxies = ProxyParser::extract("10.0.0.1 3128\n10.0.0.2\t8080");
        let addresses: Vec<_> = proxies.iter().map(ProxyCandidate::address).collect();
        assert_eq!(addresses, vec!["10.0.0.1:3128", "10.0.0.2:8080"]);
    }

    #[test]
    fn test_html_table_notation() {
        let content = "<tr><td>192.168.1.1</td><td>8080</td></tr>";
        let proxies = ProxyParser::extract(content);
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].address(), "192.168.1.1:8080");
    }

    #[test]
    fn test_json_notation() {
        let content = r#"[{"ip":"45.12.30.1","port":"8080"},{"ip": "45.12.30.2", "country": "DE", "port": 1080}]"#;
        let proxies = ProxyParser::extract(content);
        let addresses: Vec<_> = proxies.iter().map(ProxyCandidate::address).collect();
        assert_eq!(addresses, vec!["45.12.30.1:8080", "45.12.30.2:1080"]);
    }

    #[test]
    fn test_json_port_before_ip() {
        let content = r#"[{"port":"8080","ip":"45.12.30.1"},{"port": 1080, "country": "DE", "ip": "45.12.30.2"}]"#;
        let proxies = ProxyParser::extract(content);
        let addresses: Vec<_> = proxies.iter().map(ProxyCandidate::address).collect();
        assert_eq!(addresses, vec!["45.12.30.1:8080", "45.12.30.2:1080"]);
    }

    #[test]
    fn test_idempotence() {
        let content = r#"
user:pass@103.160.204.144:80
103.160.204.144:80
10.1.1.1 8080
{"ip":"45.12.30.1","port":"3128"}
77.1.2.3:1080@alice:secret
"#;
        let first = ProxyParser::extract(content);
        let second = ProxyParser::extract(&serialize(&first));
        assert_eq!(first, second);
    }

    #[test]
    fn test_parse_single() {
        let candidate = ProxyParser::parse_single("8.8.8.8:53@u:p").unwrap();
        assert_eq!(candidate.address(), "8.8.8.8:53");
        assert_eq!(candidate.username(), Some("u"));
        assert!(ProxyParser::parse_single("nope").is_none());
    }
}
