//! Core of the mirage proxy: JA3 parsing, ClientHello synthesis, the
//! fingerprint TLS dialer, ALPN-driven HTTP/1.1 and HTTP/2 transports with a
//! per-authority cache, and the CONNECT-intercept handler that ties them
//! together.

#![warn(rust_2018_idioms)]

pub mod api;
pub mod dialer;
pub mod error;
pub mod headers;
pub mod hello;
pub mod ja3;
pub mod proxy;
pub mod transport;

pub use crate::dialer::{Alpn, Dial, Dialed, FingerprintConfig, FingerprintDialer};
pub use crate::error::{Error, Result};
pub use crate::hello::{ClientHelloSpec, HelloExtension, GREASE_PLACEHOLDER};
pub use crate::ja3::Ja3;
pub use crate::proxy::{DialerFactory, ProxyConfig, ProxyHandler};
pub use crate::transport::{Request, Response, RoundTrip, TransportCache};
