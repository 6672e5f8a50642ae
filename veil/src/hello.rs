//! ClientHello specification built from a JA3 token.
//!
//! The specification models the exact hello a fingerprint asks for: cipher
//! suites in order, the extension list in JA3 order with GREASE markers where
//! a Chrome user-agent calls for them, and the payloads of the supported
//! extension catalogue. `encode` produces the canonical wire form of the
//! specification, which is deterministic for a given (JA3, user-agent, ALPN,
//! server name) and is what the session-id derivation is computed over.

use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::ja3::Ja3;

/// The RFC 8701 placeholder used wherever a GREASE value is called for.
/// Kept fixed so that encodings reproduce byte-exact.
pub const GREASE_PLACEHOLDER: u16 = 0x0a0a;

/// Signature schemes advertised by extension 13, in catalogue order.
const SIGNATURE_ALGORITHMS: [u16; 8] = [
    0x0403, // ecdsa_secp256r1_sha256
    0x0804, // rsa_pss_rsae_sha256
    0x0401, // rsa_pkcs1_sha256
    0x0503, // ecdsa_secp384r1_sha384
    0x0805, // rsa_pss_rsae_sha384
    0x0501, // rsa_pkcs1_sha384
    0x0806, // rsa_pss_rsae_sha512
    0x0601, // rsa_pkcs1_sha512
];

const TLS13: u16 = 0x0304;
const TLS12: u16 = 0x0303;
const X25519: u16 = 0x001d;

/// A single extension of the specification, carrying the payload it will
/// serialize with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelloExtension {
    /// 0 — server name, filled from the dialed authority at encode time
    ServerName,
    /// 5 — OCSP status request
    StatusRequest,
    /// 10 — supported groups, replaced per call from the JA3 curves
    SupportedGroups(Vec<u16>),
    /// 11 — EC point formats, replaced per call
    EcPointFormats(Vec<u8>),
    /// 13 — signature algorithms
    SignatureAlgorithms(Vec<u16>),
    /// 16 — ALPN, set per call from the downgrade flag
    Alpn(Vec<String>),
    /// 18 — signed certificate timestamp
    SignedCertTimestamp,
    /// 21 — padding, length chosen by the BoringSSL rule at encode time
    Padding,
    /// 23 — extended master secret
    ExtendedMasterSecret,
    /// 27 — certificate compression algorithms
    CompressCertificate(Vec<u16>),
    /// 28 — record size limit (static)
    RecordSizeLimit(u16),
    /// 35 — session ticket
    SessionTicket,
    /// 43 — supported versions
    SupportedVersions(Vec<u16>),
    /// 44 — cookie
    Cookie,
    /// 45 — PSK key-exchange modes
    PskKeyExchangeModes(Vec<u8>),
    /// 51 — key share entries (group, key material)
    KeyShare(Vec<(u16, Vec<u8>)>),
    /// 13172 — NPN
    Npn,
    /// 17513 — application settings
    ApplicationSettings(Vec<String>),
    /// 65281 — renegotiation info, "once as client"
    RenegotiationInfo,
    /// opaque catalogue entries with an empty body (17, 22, 34, 41, 49, 50)
    Opaque(u16),
    /// a GREASE marker extension
    Grease,
}

impl HelloExtension {
    pub fn id(&self) -> u16 {
        use HelloExtension::*;
        match self {
            ServerName => 0,
            StatusRequest => 5,
            SupportedGroups(_) => 10,
            EcPointFormats(_) => 11,
            SignatureAlgorithms(_) => 13,
            Alpn(_) => 16,
            SignedCertTimestamp => 18,
            Padding => 21,
            ExtendedMasterSecret => 23,
            CompressCertificate(_) => 27,
            RecordSizeLimit(_) => 28,
            SessionTicket => 35,
            SupportedVersions(_) => 43,
            Cookie => 44,
            PskKeyExchangeModes(_) => 45,
            KeyShare(_) => 51,
            Npn => 13172,
            ApplicationSettings(_) => 17513,
            RenegotiationInfo => 65281,
            Opaque(id) => *id,
            Grease => GREASE_PLACEHOLDER,
        }
    }

    fn encode_payload(&self, server_name: &str, padding_payload: usize) -> Vec<u8> {
        use HelloExtension::*;
        let mut out = Vec::new();
        match self {
            ServerName => {
                // server_name_list with a single host_name entry
                put_u16(&mut out, (server_name.len() + 3) as u16);
                out.push(0x00);
                put_u16(&mut out, server_name.len() as u16);
                out.extend_from_slice(server_name.as_bytes());
            }
            StatusRequest => {
                // CertificateStatusRequest: ocsp, no responder ids, no extensions
                out.extend_from_slice(&[0x01, 0x00, 0x00, 0x00, 0x00]);
            }
            SupportedGroups(groups) => {
                put_u16(&mut out, (groups.len() * 2) as u16);
                for g in groups {
                    put_u16(&mut out, *g);
                }
            }
            EcPointFormats(formats) => {
                out.push(formats.len() as u8);
                out.extend_from_slice(formats);
            }
            SignatureAlgorithms(algos) => {
                put_u16(&mut out, (algos.len() * 2) as u16);
                for a in algos {
                    put_u16(&mut out, *a);
                }
            }
            Alpn(protos) | ApplicationSettings(protos) => {
                let inner: usize = protos.iter().map(|p| p.len() + 1).sum();
                put_u16(&mut out, inner as u16);
                for p in protos {
                    out.push(p.len() as u8);
                    out.extend_from_slice(p.as_bytes());
                }
            }
            Padding => {
                out.resize(padding_payload, 0x00);
            }
            CompressCertificate(algos) => {
                out.push((algos.len() * 2) as u8);
                for a in algos {
                    put_u16(&mut out, *a);
                }
            }
            RecordSizeLimit(limit) => {
                put_u16(&mut out, *limit);
            }
            SupportedVersions(vers) => {
                out.push((vers.len() * 2) as u8);
                for v in vers {
                    put_u16(&mut out, *v);
                }
            }
            PskKeyExchangeModes(modes) => {
                out.push(modes.len() as u8);
                out.extend_from_slice(modes);
            }
            KeyShare(shares) => {
                let inner: usize = shares.iter().map(|(_, key)| key.len() + 4).sum();
                put_u16(&mut out, inner as u16);
                for (group, key) in shares {
                    put_u16(&mut out, *group);
                    put_u16(&mut out, key.len() as u16);
                    out.extend_from_slice(key);
                }
            }
            RenegotiationInfo => {
                // empty renegotiated_connection
                out.push(0x00);
            }
            SignedCertTimestamp | ExtendedMasterSecret | SessionTicket | Cookie | Npn
            | Opaque(_) | Grease => {}
        }
        out
    }
}

/// An ordered ClientHello specification: (cipher suites, extensions,
/// compression methods).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloSpec {
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<HelloExtension>,
    pub compression_methods: Vec<u8>,
}

/// Chrome detection over the user-agent string. Only a `chrome` substring
/// turns GREASE injection on.
pub fn is_chrome(user_agent: &str) -> bool {
    user_agent.to_ascii_lowercase().contains("chrome")
}

fn extension_for_id(id: u16, alpn: &[String]) -> Option<HelloExtension> {
    use HelloExtension::*;
    Some(match id {
        0 => ServerName,
        5 => StatusRequest,
        10 => SupportedGroups(Vec::new()),
        11 => EcPointFormats(Vec::new()),
        13 => SignatureAlgorithms(SIGNATURE_ALGORITHMS.to_vec()),
        16 => Alpn(alpn.to_vec()),
        17 | 22 | 34 | 41 | 49 | 50 => Opaque(id),
        18 => SignedCertTimestamp,
        21 => Padding,
        23 => ExtendedMasterSecret,
        27 => CompressCertificate(vec![0x0002]), // brotli
        28 => RecordSizeLimit(0x4001),
        35 => SessionTicket,
        43 => SupportedVersions(vec![GREASE_PLACEHOLDER, TLS13, TLS12]),
        44 => Cookie,
        45 => PskKeyExchangeModes(vec![0x01]), // psk_dhe_ke
        51 => KeyShare(vec![
            (GREASE_PLACEHOLDER, vec![0x00]),
            (X25519, vec![0x00; 32]),
        ]),
        13172 => Npn,
        17513 => ApplicationSettings(vec!["h2".to_string()]),
        65281 => RenegotiationInfo,
        _ => return None,
    })
}

impl ClientHelloSpec {
    /// Build a specification from a parsed JA3, the user-agent it came with,
    /// and the ALPN list computed from the downgrade flag.
    pub fn from_ja3(ja3: &Ja3, user_agent: &str, alpn: &[String]) -> Result<Self, Error> {
        let chrome = is_chrome(user_agent);

        // The supported-groups list always leads with a GREASE placeholder.
        let mut groups = Vec::with_capacity(ja3.curves.len() + 1);
        groups.push(GREASE_PLACEHOLDER);
        groups.extend_from_slice(&ja3.curves);

        let mut extensions = Vec::with_capacity(ja3.extensions.len() + 2);
        if chrome {
            extensions.push(HelloExtension::Grease);
        }
        for &id in &ja3.extensions {
            let ext = match extension_for_id(id, alpn) {
                Some(HelloExtension::SupportedGroups(_)) => {
                    HelloExtension::SupportedGroups(groups.clone())
                }
                Some(HelloExtension::EcPointFormats(_)) => {
                    HelloExtension::EcPointFormats(ja3.point_formats.clone())
                }
                Some(ext) => ext,
                None => return Err(Error::UnknownExtension(id)),
            };
            if id == 21 && chrome {
                extensions.push(HelloExtension::Grease);
            }
            extensions.push(ext);
        }

        let mut cipher_suites = Vec::with_capacity(ja3.ciphers.len() + 1);
        if chrome {
            cipher_suites.push(GREASE_PLACEHOLDER);
        }
        cipher_suites.extend_from_slice(&ja3.ciphers);

        Ok(ClientHelloSpec {
            cipher_suites,
            extensions,
            compression_methods: vec![0x00],
        })
    }

    /// Whether the specification advertises signature algorithms (JA3 listed
    /// extension 13).
    pub fn has_signature_algorithms(&self) -> bool {
        self.extensions
            .iter()
            .any(|e| matches!(e, HelloExtension::SignatureAlgorithms(_)))
    }

    fn has_padding(&self) -> bool {
        self.extensions
            .iter()
            .any(|e| matches!(e, HelloExtension::Padding))
    }

    /// Serialize the canonical ClientHello handshake message for this
    /// specification. The 32-byte session id is the SHA-256 of the message
    /// serialized with an empty session id; the padding extension length
    /// follows the BoringSSL policy.
    pub fn encode(&self, server_name: &str) -> Vec<u8> {
        let transcript = self.encode_message(server_name, &[], 0);
        let session_id: [u8; 32] = Sha256::digest(&transcript).into();

        let padding_payload = if self.has_padding() {
            // Policy input is the message length without the padding
            // extension; the zero-payload encoding carries its 4-byte header.
            let unpadded = self.encode_message(server_name, &session_id, 0).len() - 4;
            boring_padding_len(unpadded)
        } else {
            0
        };
        self.encode_message(server_name, &session_id, padding_payload)
    }

    fn encode_message(
        &self,
        server_name: &str,
        session_id: &[u8],
        padding_payload: usize,
    ) -> Vec<u8> {
        let mut body = Vec::with_capacity(512);
        put_u16(&mut body, TLS12); // legacy_version
        body.extend_from_slice(&[0u8; 32]); // random, zero in the canonical form
        body.push(session_id.len() as u8);
        body.extend_from_slice(session_id);

        put_u16(&mut body, (self.cipher_suites.len() * 2) as u16);
        for suite in &self.cipher_suites {
            put_u16(&mut body, *suite);
        }

        body.push(self.compression_methods.len() as u8);
        body.extend_from_slice(&self.compression_methods);

        let mut exts = Vec::with_capacity(256);
        for ext in &self.extensions {
            let payload = ext.encode_payload(server_name, padding_payload);
            put_u16(&mut exts, ext.id());
            put_u16(&mut exts, payload.len() as u16);
            exts.extend_from_slice(&payload);
        }
        put_u16(&mut body, exts.len() as u16);
        body.extend_from_slice(&exts);

        let mut msg = Vec::with_capacity(body.len() + 4);
        msg.push(0x01); // client_hello
        put_u24(&mut msg, body.len() as u32);
        msg.extend_from_slice(&body);
        msg
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u24(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes()[1..]);
}

// BoringSSL pads hellos that would land between 256 and 511 bytes out to 512,
// accounting for the 4-byte extension header it is about to add.
fn boring_padding_len(unpadded: usize) -> usize {
    if unpadded > 0xff && unpadded < 0x200 {
        let padding = 0x200 - unpadded;
        if padding >= 4 + 1 {
            padding - 4
        } else {
            1
        }
    } else {
        0
    }
}
