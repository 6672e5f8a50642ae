//! Shared scaffolding: scripted dialers over in-memory streams and a raw
//! HTTP/2 frame codec for inspecting what the client actually sends.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use veil::proxy::{DialerFactory, ProxyConfig, ProxyHandler};
use veil::{Alpn, Dial, Dialed, FingerprintConfig};

/// Dialer that hands out in-memory connections to a scripted HTTP/1.1
/// origin, counting handshakes and capturing everything the proxy sends.
pub struct MockH1Dialer {
    pub alpn: Alpn,
    pub response: Vec<u8>,
    /// artificial handshake latency, to widen race windows
    pub delay: Duration,
    pub dials: AtomicUsize,
    pub seen: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockH1Dialer {
    pub fn new(response: &[u8]) -> Arc<Self> {
        Arc::new(MockH1Dialer {
            alpn: Alpn::Http1,
            response: response.to_vec(),
            delay: Duration::ZERO,
            dials: AtomicUsize::new(0),
            seen: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn with_delay(response: &[u8], delay: Duration) -> Arc<Self> {
        Arc::new(MockH1Dialer {
            alpn: Alpn::Http1,
            response: response.to_vec(),
            delay,
            dials: AtomicUsize::new(0),
            seen: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub async fn requests(&self) -> Vec<String> {
        self.seen
            .lock()
            .await
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }
}

#[async_trait]
impl Dial for MockH1Dialer {
    async fn dial(&self, _authority: &str) -> veil::Result<Dialed> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let (client, server) = duplex(64 * 1024);
        tokio::spawn(serve_h1(server, self.response.clone(), self.seen.clone()));
        Ok(Dialed {
            io: Box::new(client),
            alpn: self.alpn,
        })
    }
}

// Keep answering requests on the same connection until the peer goes away.
async fn serve_h1(mut server: DuplexStream, response: Vec<u8>, seen: Arc<Mutex<Vec<Vec<u8>>>>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        loop {
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
            match server.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        seen.lock().await.push(std::mem::take(&mut buf));
        if server.write_all(&response).await.is_err() {
            return;
        }
    }
}

/// Factory that reuses one dialer for every request and records the
/// fingerprint configs the handler derived from control headers.
pub fn recording_factory(
    dialer: Arc<MockH1Dialer>,
) -> (DialerFactory, Arc<std::sync::Mutex<Vec<FingerprintConfig>>>) {
    let configs = Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorded = configs.clone();
    let factory: DialerFactory = Arc::new(move |config| {
        recorded.lock().unwrap().push(config);
        dialer.clone() as Arc<dyn Dial>
    });
    (factory, configs)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().try_init();
}

/// Bind the proxy on an ephemeral port and serve it in the background.
pub async fn start_proxy(factory: DialerFactory) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(ProxyHandler::with_dialer_factory(
        ProxyConfig::default(),
        factory,
    ));
    tokio::spawn(handler.serve(listener));
    addr
}

pub async fn start_default_proxy() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(ProxyHandler::new(ProxyConfig::default()));
    tokio::spawn(handler.serve(listener));
    addr
}

/// Read from the stream until the end of an HTTP head, returning everything
/// read so far as text.
pub async fn read_head_text<R: AsyncReadExt + Unpin>(r: &mut R) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match r.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Raw HTTP/2 frame: (type, flags, stream id, payload).
pub type Frame = (u8, u8, u32, Vec<u8>);

pub async fn read_h2_frame<R: AsyncReadExt + Unpin>(r: &mut R) -> std::io::Result<Frame> {
    let mut head = [0u8; 9];
    r.read_exact(&mut head).await?;
    let len = u32::from_be_bytes([0, head[0], head[1], head[2]]) as usize;
    let typ = head[3];
    let flags = head[4];
    let stream = u32::from_be_bytes([head[5] & 0x7f, head[6], head[7], head[8]]);
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok((typ, flags, stream, payload))
}

pub async fn write_h2_frame<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    typ: u8,
    flags: u8,
    stream: u32,
    payload: &[u8],
) -> std::io::Result<()> {
    let len = (payload.len() as u32).to_be_bytes();
    let stream = stream.to_be_bytes();
    let head = [
        len[1], len[2], len[3], typ, flags, stream[0], stream[1], stream[2], stream[3],
    ];
    w.write_all(&head).await?;
    w.write_all(payload).await?;
    w.flush().await
}

pub fn parse_h2_settings(payload: &[u8]) -> HashMap<u16, u32> {
    payload
        .chunks_exact(6)
        .map(|chunk| {
            (
                u16::from_be_bytes([chunk[0], chunk[1]]),
                u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]),
            )
        })
        .collect()
}
