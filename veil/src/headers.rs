//! Proxy-control headers: extraction and scrubbing.

use crate::dialer::FingerprintConfig;

/// Order-preserving header list, as read off the wire.
pub type HeaderList = Vec<(String, String)>;

/// Request headers consumed by the proxy itself; never forwarded upstream.
pub const CONTROL_HEADERS: [&str; 5] = [
    "proxy-protocol",
    "proxy-node-escape",
    "proxy-downgrade",
    "proxy-tls-setup",
    "proxy-tls",
];

pub fn header_get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Settings extracted from one inner (or plain-forward) request.
#[derive(Debug, Clone)]
pub struct ProxyControls {
    /// Effective URL scheme: `proxy-protocol`, defaulting to `https`.
    pub scheme: String,
    /// JA3 token from `proxy-tls`; empty disables impersonation.
    pub ja3: String,
    /// Opaque data from `proxy-tls-setup`.
    pub setup: String,
    /// `proxy-downgrade` non-empty: advertise only `http/1.1`.
    pub downgrade: bool,
    /// `proxy-node-escape` non-empty: also strip `Connection`.
    pub node_escape: bool,
    pub user_agent: String,
}

impl ProxyControls {
    pub fn extract(headers: &[(String, String)]) -> Self {
        let scheme = match header_get(headers, "proxy-protocol") {
            Some(s) if !s.is_empty() => s.to_ascii_lowercase(),
            _ => "https".to_string(),
        };
        ProxyControls {
            scheme,
            ja3: header_get(headers, "proxy-tls").unwrap_or("").to_string(),
            setup: header_get(headers, "proxy-tls-setup")
                .unwrap_or("")
                .to_string(),
            downgrade: header_get(headers, "proxy-downgrade").is_some_and(|v| !v.is_empty()),
            node_escape: header_get(headers, "proxy-node-escape").is_some_and(|v| !v.is_empty()),
            user_agent: header_get(headers, "user-agent").unwrap_or("").to_string(),
        }
    }

    pub fn fingerprint_config(&self) -> FingerprintConfig {
        FingerprintConfig {
            ja3: self.ja3.clone(),
            setup: self.setup.clone(),
            user_agent: self.user_agent.clone(),
            downgrade: self.downgrade,
        }
    }
}

/// Remove the fixed blacklist plus any extras from the header list,
/// case-insensitively. Names that are absent cost nothing.
pub fn strip_control_headers(headers: &mut HeaderList, extras: &[&str]) {
    headers.retain(|(name, _)| {
        !CONTROL_HEADERS
            .iter()
            .chain(extras.iter())
            .any(|blocked| name.eq_ignore_ascii_case(blocked))
    });
}
