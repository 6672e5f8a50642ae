//! Upstream transports: the request/response model, the HTTP/1.1 and HTTP/2
//! engines, and the per-authority cache that picks between them.

pub mod cache;
pub mod h1;
pub mod h2;

pub use cache::TransportCache;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::headers::HeaderList;

use std::io;

/// An upstream request: URL parts plus the order-preserving header list read
/// from the client.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub scheme: String,
    /// `host[:port]`
    pub authority: String,
    /// origin-form path and query
    pub path: String,
    pub version: Version,
    pub headers: HeaderList,
    pub body: Bytes,
}

impl Request {
    /// Cache key for the transport map: `host:port`, with `:443` assumed
    /// when the authority has no explicit port.
    pub fn cache_addr(&self) -> String {
        ensure_port(&self.authority, 443)
    }

    /// Address to dial for plain-HTTP requests.
    pub fn plain_addr(&self) -> String {
        ensure_port(&self.authority, 80)
    }
}

fn ensure_port(authority: &str, default: u16) -> String {
    let after_host = match authority.rfind(']') {
        Some(i) => &authority[i..],
        None => authority,
    };
    if after_host.contains(':') {
        authority.to_string()
    } else {
        format!("{}:{}", authority, default)
    }
}

/// An upstream response, body materialized.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderList,
    pub body: Bytes,
}

impl Response {
    /// Write the response in HTTP/1.x wire format. Framing headers are
    /// regenerated from the materialized body.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or("")
        )
        .into_bytes();
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
            {
                continue;
            }
            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
        w.write_all(&head).await?;
        w.write_all(&self.body).await?;
        w.flush().await
    }
}

/// The capability the proxy handler consumes: one request in, one response
/// out, over whatever engine the cache installed for the authority.
#[async_trait]
pub trait RoundTrip: Send + Sync {
    async fn round_trip(&self, req: &Request) -> Result<Response>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_addr_assumes_https_port() {
        let req = Request {
            method: Method::GET,
            scheme: "https".into(),
            authority: "example.com".into(),
            path: "/".into(),
            version: Version::HTTP_11,
            headers: Vec::new(),
            body: Bytes::new(),
        };
        assert_eq!(req.cache_addr(), "example.com:443");
        assert_eq!(req.plain_addr(), "example.com:80");
    }

    #[test]
    fn explicit_ports_kept() {
        assert_eq!(ensure_port("example.com:8443", 443), "example.com:8443");
        assert_eq!(ensure_port("[::1]:8443", 443), "[::1]:8443");
        assert_eq!(ensure_port("[::1]", 443), "[::1]:443");
    }
}
