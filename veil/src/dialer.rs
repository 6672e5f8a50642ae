//! Fingerprint-driven TLS dialer.
//!
//! One call, one connection: resolve and dial the authority, synthesize a
//! ClientHello per the caller's JA3 and user-agent, handshake with
//! certificate verification disabled, and hand back the stream together with
//! the ALPN the origin negotiated.

use async_trait::async_trait;
use boring::ssl::{SslConnector, SslMethod, SslVerifyMode, SslVersion};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::hello::{is_chrome, ClientHelloSpec, GREASE_PLACEHOLDER};
use crate::ja3::Ja3;

// FFI bindings for BoringSSL hello-shaping controls not exposed by the safe
// wrapper.
use boring_sys::SSL_CTX;
use std::os::raw::c_int;

extern "C" {
    /// Toggle GREASE (RFC 8701) values in the ClientHello.
    fn SSL_CTX_set_grease_enabled(ctx: *mut SSL_CTX, enabled: c_int) -> c_int;
    /// Toggle extension order permutation (Chrome 110+ behavior).
    fn SSL_CTX_set_permute_extensions(ctx: *mut SSL_CTX, enabled: c_int) -> c_int;
}

/// Byte stream a transport can run over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// Application protocol negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alpn {
    /// HTTP/2 ("h2")
    H2,
    /// HTTP/1.1 ("http/1.1")
    Http1,
    /// Nothing negotiated, or an unknown protocol
    None,
}

impl Alpn {
    pub fn is_h2(&self) -> bool {
        matches!(self, Alpn::H2)
    }
}

/// An established connection plus its handshake outcome.
pub struct Dialed {
    pub io: Box<dyn Io>,
    pub alpn: Alpn,
}

impl std::fmt::Debug for Dialed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialed").field("alpn", &self.alpn).finish()
    }
}

/// The dial seam between the transport cache and the TLS stack. Production
/// uses [`FingerprintDialer`]; tests substitute scripted implementations.
#[async_trait]
pub trait Dial: Send + Sync {
    async fn dial(&self, authority: &str) -> Result<Dialed>;
}

/// Per-request fingerprint parameters carried from the proxy-control headers.
#[derive(Debug, Clone, Default)]
pub struct FingerprintConfig {
    /// JA3 token; empty disables impersonation in favor of the library's
    /// default Chrome-family hello.
    pub ja3: String,
    /// Opaque auxiliary fingerprint data (`proxy-tls-setup`).
    pub setup: String,
    pub user_agent: String,
    /// Advertise only `http/1.1` instead of `h2, http/1.1`.
    pub downgrade: bool,
}

impl FingerprintConfig {
    pub fn alpn_protocols(&self) -> Vec<String> {
        if self.downgrade {
            vec!["http/1.1".to_string()]
        } else {
            vec!["h2".to_string(), "http/1.1".to_string()]
        }
    }

    fn alpn_wire(&self) -> Vec<u8> {
        let mut wire = Vec::new();
        for proto in self.alpn_protocols() {
            wire.push(proto.len() as u8);
            wire.extend_from_slice(proto.as_bytes());
        }
        wire
    }
}

/// Stateless dialer: every call builds a fresh connector from the config and
/// performs one handshake.
pub struct FingerprintDialer {
    config: FingerprintConfig,
}

impl FingerprintDialer {
    pub fn new(config: FingerprintConfig) -> Self {
        FingerprintDialer { config }
    }

    fn connector(&self) -> Result<SslConnector> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())
            .map_err(|e| Error::Tls(format!("failed to create connector: {}", e)))?;

        builder.set_verify(SslVerifyMode::NONE);
        builder
            .set_min_proto_version(Some(SslVersion::TLS1_2))
            .map_err(|e| Error::Tls(format!("failed to set min version: {}", e)))?;
        builder
            .set_max_proto_version(Some(SslVersion::TLS1_3))
            .map_err(|e| Error::Tls(format!("failed to set max version: {}", e)))?;
        builder
            .set_alpn_protos(&self.config.alpn_wire())
            .map_err(|e| Error::Tls(format!("failed to set alpn: {}", e)))?;

        if self.config.ja3.is_empty() {
            // Default hello: GREASE plus permuted extensions, the shape the
            // library emits for current Chrome.
            unsafe {
                let ctx = builder.as_ptr() as *mut SSL_CTX;
                SSL_CTX_set_grease_enabled(ctx, 1);
                SSL_CTX_set_permute_extensions(ctx, 1);
            }
            return Ok(builder.build());
        }

        let ja3: Ja3 = self.config.ja3.parse()?;
        let alpn = self.alpn_protocols();
        let spec = ClientHelloSpec::from_ja3(&ja3, &self.config.user_agent, &alpn)?;
        trace!(extensions = spec.extensions.len(), "hello spec built");

        let ciphers = cipher_list(&spec.cipher_suites);
        if !ciphers.is_empty() {
            builder
                .set_cipher_list(&ciphers)
                .map_err(|e| Error::Tls(format!("failed to set cipher list: {}", e)))?;
        }
        let curves = curves_list(&ja3.curves);
        if !curves.is_empty() {
            builder
                .set_curves_list(&curves)
                .map_err(|e| Error::Tls(format!("failed to set curves: {}", e)))?;
        }
        if spec.has_signature_algorithms() {
            builder
                .set_sigalgs_list(SIGALGS_LIST)
                .map_err(|e| Error::Tls(format!("failed to set sigalgs: {}", e)))?;
        }

        // Extension order follows the JA3 as far as the library permits;
        // permutation stays off so the order is stable. GREASE only for a
        // Chrome user-agent, matching the hello's markers.
        unsafe {
            let ctx = builder.as_ptr() as *mut SSL_CTX;
            let grease = is_chrome(&self.config.user_agent) as c_int;
            SSL_CTX_set_grease_enabled(ctx, grease);
            SSL_CTX_set_permute_extensions(ctx, 0);
        }
        Ok(builder.build())
    }

    fn alpn_protocols(&self) -> Vec<String> {
        self.config.alpn_protocols()
    }
}

#[async_trait]
impl Dial for FingerprintDialer {
    async fn dial(&self, authority: &str) -> Result<Dialed> {
        // Validate the fingerprint before touching the network so malformed
        // JA3 surfaces as a parse error rather than a dial artifact.
        let connector = self.connector()?;
        if !self.config.setup.is_empty() {
            debug!(setup = %self.config.setup, "auxiliary fingerprint data");
        }

        let stream = TcpStream::connect(authority).await?;
        let host = server_name(authority);

        let mut config = connector
            .configure()
            .map_err(|e| Error::Tls(format!("failed to configure session: {}", e)))?;
        config.set_verify_hostname(false);

        let tls = tokio_boring::connect(config, host, stream)
            .await
            .map_err(|e| classify_handshake_error(e.to_string()))?;

        let alpn = match tls.ssl().selected_alpn_protocol() {
            Some(b"h2") => Alpn::H2,
            Some(b"http/1.1") => Alpn::Http1,
            _ => Alpn::None,
        };
        debug!(authority, ?alpn, "tls handshake done");
        Ok(Dialed {
            io: Box::new(tls),
            alpn,
        })
    }
}

fn classify_handshake_error(msg: String) -> Error {
    let lowered = msg.to_ascii_lowercase();
    if lowered.contains("curve") || lowered.contains("no shared group") {
        Error::HandshakeRetryable(msg)
    } else {
        Error::Handshake(msg)
    }
}

/// Host half of `host:port`; the whole authority when the split fails.
fn server_name(authority: &str) -> &str {
    match authority.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => {
            host.strip_prefix('[')
                .and_then(|h| h.strip_suffix(']'))
                .unwrap_or(host)
        }
        _ => authority,
    }
}

const SIGALGS_LIST: &str = "ecdsa_secp256r1_sha256:rsa_pss_rsae_sha256:rsa_pkcs1_sha256:\
                            ecdsa_secp384r1_sha384:rsa_pss_rsae_sha384:rsa_pkcs1_sha384:\
                            rsa_pss_rsae_sha512:rsa_pkcs1_sha512";

// TLS 1.3 suites are fixed in the library and GREASE is injected by it, so
// only the negotiable legacy suites translate into the cipher list.
fn cipher_name(id: u16) -> Option<&'static str> {
    Some(match id {
        0xc02b => "ECDHE-ECDSA-AES128-GCM-SHA256",
        0xc02f => "ECDHE-RSA-AES128-GCM-SHA256",
        0xc02c => "ECDHE-ECDSA-AES256-GCM-SHA384",
        0xc030 => "ECDHE-RSA-AES256-GCM-SHA384",
        0xcca9 => "ECDHE-ECDSA-CHACHA20-POLY1305",
        0xcca8 => "ECDHE-RSA-CHACHA20-POLY1305",
        0xc009 => "ECDHE-ECDSA-AES128-SHA",
        0xc00a => "ECDHE-ECDSA-AES256-SHA",
        0xc013 => "ECDHE-RSA-AES128-SHA",
        0xc014 => "ECDHE-RSA-AES256-SHA",
        0x009c => "AES128-GCM-SHA256",
        0x009d => "AES256-GCM-SHA384",
        0x002f => "AES128-SHA",
        0x0035 => "AES256-SHA",
        0x000a => "DES-CBC3-SHA",
        _ => return None,
    })
}

fn cipher_list(ids: &[u16]) -> String {
    ids.iter()
        .filter(|&&id| id != GREASE_PLACEHOLDER)
        .filter_map(|&id| cipher_name(id))
        .collect::<Vec<_>>()
        .join(":")
}

fn group_name(id: u16) -> Option<&'static str> {
    Some(match id {
        0x001d => "X25519",
        0x0017 => "P-256",
        0x0018 => "P-384",
        0x0019 => "P-521",
        _ => return None,
    })
}

fn curves_list(ids: &[u16]) -> String {
    ids.iter()
        .filter_map(|&id| group_name(id))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downgrade_narrows_alpn() {
        let full = FingerprintConfig::default();
        assert_eq!(full.alpn_protocols(), vec!["h2", "http/1.1"]);
        let narrowed = FingerprintConfig {
            downgrade: true,
            ..Default::default()
        };
        assert_eq!(narrowed.alpn_protocols(), vec!["http/1.1"]);
        assert_eq!(narrowed.alpn_wire(), b"\x08http/1.1");
    }

    #[test]
    fn server_name_splits_host() {
        assert_eq!(server_name("example.com:443"), "example.com");
        assert_eq!(server_name("[::1]:443"), "::1");
        assert_eq!(server_name("example.com"), "example.com");
        // not a port: keep the whole authority
        assert_eq!(server_name("odd:name"), "odd:name");
    }

    #[test]
    fn cipher_list_skips_grease_and_tls13() {
        let list = cipher_list(&[GREASE_PLACEHOLDER, 0x1301, 0xc02b, 0x002f]);
        assert_eq!(list, "ECDHE-ECDSA-AES128-GCM-SHA256:AES128-SHA");
    }

    #[test]
    fn handshake_error_classification() {
        assert!(classify_handshake_error("no suitable curve offered".into()).is_retryable());
        assert!(!classify_handshake_error("certificate expired".into()).is_retryable());
    }
}
