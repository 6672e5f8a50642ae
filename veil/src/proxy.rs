//! The CONNECT-intercept proxy: validate, acknowledge, read the inner
//! request, and exchange it upstream through a per-request transport cache.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode, Uri, Version};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, instrument, warn};

use crate::dialer::{Dial, FingerprintConfig, FingerprintDialer};
use crate::error::{Error, Result};
use crate::headers::{header_get, strip_control_headers, ProxyControls};
use crate::transport::h1::{ParsedRequest, RequestReader};
use crate::transport::{Request, RoundTrip, TransportCache};

const BAD_REQUEST_MSG: &str = "Bad Request";
const UNSUPPORTED_PROTOCOL_MSG: &str = "Unsupported protocol version.";
const SCHEME_NOT_ALLOWED_MSG: &str = "Scheme not allowed";
const SERVER_READ_ERROR_MSG: &str = "Server Read Error";
const SERVER_REQUEST_ERROR_MSG: &str = "Server Request Error";

/// Produces the dialer for one proxied request from its control headers.
/// Swappable so tests can script handshakes.
pub type DialerFactory = Arc<dyn Fn(FingerprintConfig) -> Arc<dyn Dial> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Deadline applied to each upstream exchange.
    pub timeout: Duration,
    pub allowed_schemes: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            timeout: Duration::from_secs(10),
            allowed_schemes: vec!["http".to_string(), "https".to_string()],
        }
    }
}

pub struct ProxyHandler {
    config: ProxyConfig,
    dialer_factory: DialerFactory,
}

impl ProxyHandler {
    pub fn new(config: ProxyConfig) -> Self {
        Self::with_dialer_factory(
            config,
            Arc::new(|fingerprint| Arc::new(FingerprintDialer::new(fingerprint)) as Arc<dyn Dial>),
        )
    }

    pub fn with_dialer_factory(config: ProxyConfig, dialer_factory: DialerFactory) -> Self {
        ProxyHandler {
            config,
            dialer_factory,
        }
    }

    /// Accept loop; one task per client connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        while let Ok((inbound, client_addr)) = listener.accept().await {
            let handler = self.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.handle(inbound, client_addr).await {
                    debug!("failed to serve {}: {}", client_addr, e);
                }
            });
        }
        Ok(())
    }

    #[instrument(name = "proxy", skip(self, inbound), fields(client = %client_addr))]
    pub async fn handle(&self, inbound: TcpStream, client_addr: SocketAddr) -> Result<()> {
        let mut reader = RequestReader::new(inbound);
        let outer = match reader.read_request().await {
            Ok(outer) => outer,
            Err(Error::UnsupportedProtocol) => {
                warn!("unsupported protocol version");
                respond_plain(
                    &mut reader.inner,
                    StatusCode::BAD_REQUEST,
                    UNSUPPORTED_PROTOCOL_MSG,
                )
                .await?;
                return Err(Error::UnsupportedProtocol);
            }
            Err(e) => {
                warn!("invalid request: {}", e);
                respond_plain(&mut reader.inner, StatusCode::BAD_REQUEST, BAD_REQUEST_MSG).await?;
                return Err(e);
            }
        };
        info!(method = %outer.method, target = %outer.target, "accepting request");

        if outer.method.eq_ignore_ascii_case("CONNECT") {
            self.intercept(reader, outer).await
        } else {
            self.forward(reader, outer).await
        }
    }

    /// CONNECT path: acknowledge first, then treat the remainder of the byte
    /// stream as one inner HTTP/1.x exchange.
    async fn intercept(
        &self,
        mut reader: RequestReader<TcpStream>,
        outer: ParsedRequest,
    ) -> Result<()> {
        // The ack must precede the inner-request read; clients block on it.
        let ack = format!("HTTP/1.{} 200 OK\r\n\r\n", outer.minor);
        reader.inner.write_all(ack.as_bytes()).await?;
        reader.inner.flush().await?;

        let inner = match reader.read_request().await {
            Ok(inner) => inner,
            Err(e) => {
                warn!("failed to read inner request: {}", e);
                respond_hijacked(&mut reader.inner, SERVER_READ_ERROR_MSG).await?;
                return Err(e);
            }
        };

        let controls = ProxyControls::extract(&inner.headers);
        if !self.scheme_allowed(&controls.scheme) {
            warn!(scheme = %controls.scheme, "scheme not allowed");
            respond_hijacked(&mut reader.inner, SCHEME_NOT_ALLOWED_MSG).await?;
            return Err(Error::SchemeNotAllowed(controls.scheme));
        }

        let authority = header_get(&inner.headers, "host")
            .filter(|h| !h.is_empty())
            .unwrap_or(&outer.target)
            .to_string();
        let request = match self.build_request(inner, &controls, authority) {
            Ok(request) => request,
            Err(e) => {
                warn!("unusable inner request: {}", e);
                respond_hijacked(&mut reader.inner, SERVER_READ_ERROR_MSG).await?;
                return Err(e);
            }
        };

        match self.exchange(&controls, &request).await {
            Ok(response) => {
                info!(status = %response.status, "upstream exchange done");
                response.write_to(&mut reader.inner).await?;
                Ok(())
            }
            Err(e) => {
                warn!("upstream exchange failed: {}", e);
                respond_hijacked(&mut reader.inner, SERVER_REQUEST_ERROR_MSG).await?;
                Err(e)
            }
        }
    }

    /// Plain forward-proxy path for absolute-form requests.
    async fn forward(
        &self,
        mut reader: RequestReader<TcpStream>,
        outer: ParsedRequest,
    ) -> Result<()> {
        let uri: Uri = match outer.target.parse() {
            Ok(uri) => uri,
            Err(_) => {
                respond_plain(&mut reader.inner, StatusCode::BAD_REQUEST, BAD_REQUEST_MSG).await?;
                return Err(Error::BadRequest(format!(
                    "invalid target: {}",
                    outer.target
                )));
            }
        };
        let (Some(authority), Some(_)) = (uri.authority(), uri.scheme()) else {
            respond_plain(&mut reader.inner, StatusCode::BAD_REQUEST, BAD_REQUEST_MSG).await?;
            return Err(Error::BadRequest("not a proxied request".to_string()));
        };
        let authority = authority.to_string();
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let controls = ProxyControls::extract(&outer.headers);
        if !self.scheme_allowed(&controls.scheme) {
            warn!(scheme = %controls.scheme, "scheme not allowed");
            respond_plain(
                &mut reader.inner,
                StatusCode::BAD_REQUEST,
                SCHEME_NOT_ALLOWED_MSG,
            )
            .await?;
            return Err(Error::SchemeNotAllowed(controls.scheme));
        }

        let mut outer = outer;
        outer.target = path;
        let request = match self.build_request(outer, &controls, authority) {
            Ok(request) => request,
            Err(e) => {
                respond_plain(&mut reader.inner, StatusCode::BAD_REQUEST, BAD_REQUEST_MSG).await?;
                return Err(e);
            }
        };

        match self.exchange(&controls, &request).await {
            Ok(response) => {
                info!(status = %response.status, "upstream exchange done");
                response.write_to(&mut reader.inner).await?;
                Ok(())
            }
            Err(e) => {
                warn!("upstream exchange failed: {}", e);
                respond_plain(
                    &mut reader.inner,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    SERVER_REQUEST_ERROR_MSG,
                )
                .await?;
                Err(e)
            }
        }
    }

    fn build_request(
        &self,
        parsed: ParsedRequest,
        controls: &ProxyControls,
        authority: String,
    ) -> Result<Request> {
        let method = Method::from_bytes(parsed.method.as_bytes())
            .map_err(|_| Error::BadRequest(format!("invalid method: {}", parsed.method)))?;
        let mut headers = parsed.headers;
        let extras: &[&str] = if controls.node_escape {
            &["Connection"]
        } else {
            &[]
        };
        strip_control_headers(&mut headers, extras);
        Ok(Request {
            method,
            scheme: controls.scheme.clone(),
            authority,
            path: if parsed.target.is_empty() {
                "/".to_string()
            } else {
                parsed.target
            },
            version: Version::HTTP_11,
            headers,
            body: parsed.body,
        })
    }

    async fn exchange(
        &self,
        controls: &ProxyControls,
        request: &Request,
    ) -> Result<crate::transport::Response> {
        let dialer = (self.dialer_factory)(controls.fingerprint_config());
        let cache = TransportCache::new(dialer);
        match tokio::time::timeout(self.config.timeout, cache.round_trip(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.config.timeout)),
        }
    }

    fn scheme_allowed(&self, scheme: &str) -> bool {
        self.config.allowed_schemes.iter().any(|s| s == scheme)
    }
}

/// Full HTTP/1.1 error response for the pre-hijack phase.
async fn respond_plain<W: AsyncWrite + Unpin>(
    w: &mut W,
    status: StatusCode,
    msg: &str,
) -> io::Result<()> {
    let body = format!("{}\n", msg);
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len()
    );
    w.write_all(head.as_bytes()).await?;
    w.write_all(body.as_bytes()).await?;
    w.flush().await
}

/// Bare synthetic response once the connection is hijacked.
async fn respond_hijacked<W: AsyncWrite + Unpin>(w: &mut W, msg: &str) -> io::Result<()> {
    let line = format!("HTTP/1.1 500 Internal Server Error\r\n\r\n{}", msg);
    w.write_all(line.as_bytes()).await?;
    w.flush().await
}
