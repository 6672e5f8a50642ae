//! HTTP/2 upstream engine over the `h2` crate, tuned to mirror Chrome's
//! SETTINGS.

use async_trait::async_trait;
use bytes::Bytes;
use h2::client::SendRequest;
use http::{HeaderName, HeaderValue, Version};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::transport::cache::CacheHandle;
use crate::transport::{Request, Response, RoundTrip};

/// SETTINGS_HEADER_TABLE_SIZE as sent by Chrome.
const HEADER_TABLE_SIZE: u32 = 65536;
/// SETTINGS_INITIAL_WINDOW_SIZE as sent by Chrome.
const INITIAL_WINDOW_SIZE: u32 = 6_291_456;
/// SETTINGS_MAX_FRAME_SIZE as sent by Chrome.
const MAX_FRAME_SIZE: u32 = 262_144;

// Connection-specific headers have no place on an HTTP/2 stream.
const STRIPPED: [&str; 7] = [
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
];

pub struct H2Transport {
    handle: CacheHandle,
    sender: Mutex<Option<SendRequest<Bytes>>>,
}

impl H2Transport {
    pub fn new(handle: CacheHandle) -> Self {
        H2Transport {
            handle,
            sender: Mutex::new(None),
        }
    }

    async fn connect(&self, addr: &str) -> Result<SendRequest<Bytes>> {
        let dialed = self.handle.dial_tls(addr).await?;
        let mut builder = h2::client::Builder::new();
        builder
            .header_table_size(HEADER_TABLE_SIZE)
            .initial_window_size(INITIAL_WINDOW_SIZE)
            .max_frame_size(MAX_FRAME_SIZE);
        let (sender, connection) = builder.handshake::<_, Bytes>(dialed.io).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("h2 connection terminated: {}", e);
            }
        });
        Ok(sender)
    }
}

fn build_h2_request(req: &Request) -> Result<http::Request<()>> {
    let uri = format!("{}://{}{}", req.scheme, req.authority, req.path);
    let mut builder = http::Request::builder()
        .method(req.method.clone())
        .uri(uri.as_str())
        .version(Version::HTTP_2);
    let headers = builder
        .headers_mut()
        .ok_or_else(|| Error::Upstream(format!("invalid request target: {}", uri)))?;
    for (name, value) in &req.headers {
        if STRIPPED.iter().any(|s| name.eq_ignore_ascii_case(s)) {
            continue;
        }
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Upstream(format!("invalid header name: {}", e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Upstream(format!("invalid header value: {}", e)))?;
        headers.append(name, value);
    }
    builder
        .body(())
        .map_err(|e| Error::Upstream(format!("invalid request: {}", e)))
}

#[async_trait]
impl RoundTrip for H2Transport {
    async fn round_trip(&self, req: &Request) -> Result<Response> {
        let mut guard = self.sender.lock().await;
        let sender = match guard.take() {
            Some(sender) => sender,
            None => self.connect(&req.cache_addr()).await?,
        };
        // A dead connection shows up here; replace it once.
        let mut sender = match sender.ready().await {
            Ok(sender) => sender,
            Err(e) => {
                trace!("h2 connection unusable, redialing: {}", e);
                let fresh = self.connect(&req.cache_addr()).await?;
                fresh.ready().await?
            }
        };

        let h2_request = build_h2_request(req)?;
        let end_of_stream = req.body.is_empty();
        let (response, mut stream) = sender.send_request(h2_request, end_of_stream)?;
        *guard = Some(sender);
        drop(guard);

        if !end_of_stream {
            stream.send_data(req.body.clone(), true)?;
        }

        let response = response.await?;
        let (parts, mut recv) = response.into_parts();
        let mut body = Vec::new();
        while let Some(chunk) = recv.data().await {
            let chunk = chunk?;
            let _ = recv.flow_control().release_capacity(chunk.len());
            body.extend_from_slice(&chunk);
        }

        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Ok(Response {
            status: parts.status,
            version: Version::HTTP_2,
            headers,
            body: body.into(),
        })
    }
}
