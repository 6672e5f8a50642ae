//! Per-authority transport cache with the probe-then-reuse handoff.
//!
//! The first HTTPS request to an authority dials once to learn the ALPN
//! outcome, installs the matching engine, and parks the freshly handshaken
//! connection; the engine's first dial callback then consumes the parked
//! connection instead of handshaking a second time.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::dialer::{Dial, Dialed};
use crate::error::{Error, Result};
use crate::transport::h1::H1Transport;
use crate::transport::h2::H2Transport;
use crate::transport::{Request, Response, RoundTrip};

#[derive(Default)]
struct CacheState {
    transports: HashMap<String, Arc<dyn RoundTrip>>,
    pendings: HashMap<String, Dialed>,
}

struct CacheInner {
    dialer: Arc<dyn Dial>,
    // One mutex over both maps; held across the probe handshake so at most
    // one probe per authority is ever in flight and the pending connection
    // has a single consumer.
    state: Mutex<CacheState>,
}

/// Transport cache for one proxied request's lifetime (or longer, if the
/// caller chooses to share it). Implements [`RoundTrip`] by routing to the
/// engine installed for the request's authority.
pub struct TransportCache {
    inner: Arc<CacheInner>,
}

/// Weak entry point handed to transports for their dial callbacks, so an
/// engine does not keep its cache alive.
#[derive(Clone)]
pub struct CacheHandle {
    inner: Weak<CacheInner>,
}

impl CacheHandle {
    /// One-shot reuse of the probe connection when present; a fresh
    /// handshake otherwise. The lock spans both, linearizing the handoff.
    pub(crate) async fn dial_tls(&self, addr: &str) -> Result<Dialed> {
        let inner = self.inner.upgrade().ok_or(Error::CacheGone)?;
        let mut state = inner.state.lock().await;
        if let Some(pending) = state.pendings.remove(addr) {
            trace!(addr, "reusing probe connection");
            return Ok(pending);
        }
        inner.dialer.dial(addr).await
    }
}

impl TransportCache {
    pub fn new(dialer: Arc<dyn Dial>) -> Self {
        TransportCache {
            inner: Arc::new(CacheInner {
                dialer,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    fn handle(&self) -> CacheHandle {
        CacheHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    async fn install(&self, state: &mut CacheState, addr: &str, scheme: &str) -> Result<Arc<dyn RoundTrip>> {
        match scheme {
            "http" => Ok(Arc::new(H1Transport::plain())),
            "https" => {
                // Probe: one handshake decides the engine; the connection is
                // parked for the engine's first dial callback.
                let dialed = self.inner.dialer.dial(addr).await?;
                let transport: Arc<dyn RoundTrip> = if dialed.alpn.is_h2() {
                    debug!(addr, "alpn negotiated h2");
                    Arc::new(H2Transport::new(self.handle()))
                } else {
                    debug!(addr, "alpn negotiated http/1.1");
                    Arc::new(H1Transport::over_tls(self.handle()))
                };
                state.pendings.insert(addr.to_string(), dialed);
                Ok(transport)
            }
            other => Err(Error::InvalidScheme(other.to_string())),
        }
    }
}

#[async_trait]
impl RoundTrip for TransportCache {
    async fn round_trip(&self, req: &Request) -> Result<Response> {
        let addr = req.cache_addr();
        let transport = {
            let mut state = self.inner.state.lock().await;
            match state.transports.get(&addr) {
                Some(transport) => transport.clone(),
                None => {
                    let transport = self.install(&mut state, &addr, &req.scheme).await?;
                    state.transports.insert(addr.clone(), transport.clone());
                    transport
                }
            }
        };
        transport.round_trip(req).await
    }
}
