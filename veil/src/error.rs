use std::io;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the dialer, the transports, and the proxy handler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid JA3 string: expected 5 components, got {0}")]
    Ja3Malformed(usize),

    #[error("invalid JA3 field: {0}")]
    Ja3Field(String),

    #[error("unknown JA3 extension id: {0}")]
    UnknownExtension(u16),

    #[error("invalid URL scheme: [{0}]")]
    InvalidScheme(String),

    #[error("scheme not allowed: {0}")]
    SchemeNotAllowed(String),

    #[error("unsupported protocol version")]
    UnsupportedProtocol,

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("failed to read request: {0}")]
    Read(String),

    /// TLS 1.3 negotiated a curve the handshake stack cannot serve. The
    /// caller may retry the request, typically with a different fingerprint.
    #[error("tls handshake failed for tls 1.3 (please retry request): {0}")]
    HandshakeRetryable(String),

    #[error("tls handshake failed: {0}")]
    Handshake(String),

    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport cache dropped while a transport was still live")]
    CacheGone,

    #[error("http/2 protocol error: {0}")]
    H2(#[from] h2::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the error is the distinguished retryable handshake failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::HandshakeRetryable(_))
    }
}
