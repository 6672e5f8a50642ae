//! JSON-request mode: a POST endpoint that takes a fully-described request
//! as JSON and plays it through the same fingerprint dialer and transport
//! cache as the intercepting proxy.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode, Uri, Version};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, instrument, warn};

use crate::dialer::{FingerprintConfig, FingerprintDialer};
use crate::error::{Error, Result};
use crate::transport::h1::RequestReader;
use crate::transport::{Request, RoundTrip, TransportCache};

/// Wire record accepted by `POST /api/request`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestRecord {
    pub method: String,
    pub url: String,
    pub params: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub json: Option<serde_json::Value>,
    pub form: HashMap<String, String>,
    pub multipart: HashMap<String, String>,
    pub ja3: String,
    pub user_agent: String,
    pub proxy: String,
    /// seconds; 0 means the default of 10
    pub timeout: u64,
    pub disable_redirect: bool,
}

/// JSON-encoded response record.
#[derive(Debug, Serialize)]
pub struct ResponseRecord {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Execute one described request through the fingerprint stack.
pub async fn execute(record: RequestRecord) -> Result<ResponseRecord> {
    if !record.proxy.is_empty() {
        return Err(Error::BadRequest(
            "upstream proxy chaining is not supported".to_string(),
        ));
    }
    let request = build_request(&record)?;
    debug!(method = %request.method, authority = %request.authority, "api request");

    let fingerprint = FingerprintConfig {
        ja3: record.ja3.clone(),
        setup: String::new(),
        user_agent: record.user_agent.clone(),
        downgrade: false,
    };
    let cache = TransportCache::new(Arc::new(FingerprintDialer::new(fingerprint)));
    let timeout = Duration::from_secs(if record.timeout == 0 { 10 } else { record.timeout });
    let response = match tokio::time::timeout(timeout, cache.round_trip(&request)).await {
        Ok(result) => result?,
        Err(_) => return Err(Error::Timeout(timeout)),
    };

    let mut headers = HashMap::new();
    for (name, value) in &response.headers {
        headers.insert(name.clone(), value.clone());
    }
    Ok(ResponseRecord {
        status: response.status.as_u16(),
        headers,
        body: String::from_utf8_lossy(&response.body).into_owned(),
    })
}

fn build_request(record: &RequestRecord) -> Result<Request> {
    let uri: Uri = record
        .url
        .parse()
        .map_err(|_| Error::BadRequest(format!("invalid url: {}", record.url)))?;
    let authority = uri
        .authority()
        .ok_or_else(|| Error::BadRequest("url has no host".to_string()))?
        .to_string();
    let scheme = uri.scheme_str().unwrap_or("https").to_string();

    let mut path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    if !record.params.is_empty() {
        let query = record
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
            .collect::<Vec<_>>()
            .join("&");
        path.push(if path.contains('?') { '&' } else { '?' });
        path.push_str(&query);
    }

    let method = if record.method.is_empty() {
        Method::GET
    } else {
        Method::from_bytes(record.method.as_bytes())
            .map_err(|_| Error::BadRequest(format!("invalid method: {}", record.method)))?
    };

    let mut headers: Vec<(String, String)> = record
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if !record.user_agent.is_empty()
        && !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("user-agent"))
    {
        headers.push(("User-Agent".to_string(), record.user_agent.clone()));
    }

    let body = encode_body(record, &mut headers)?;
    Ok(Request {
        method,
        scheme,
        authority,
        path,
        version: Version::HTTP_11,
        headers,
        body,
    })
}

// Precedence mirrors the record: json, then form, then multipart, then the
// raw body string.
fn encode_body(record: &RequestRecord, headers: &mut Vec<(String, String)>) -> Result<Bytes> {
    let set_type = |headers: &mut Vec<(String, String)>, value: String| {
        if !headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        {
            headers.push(("Content-Type".to_string(), value));
        }
    };
    if let Some(json) = &record.json {
        let body = serde_json::to_vec(json)
            .map_err(|e| Error::BadRequest(format!("invalid json body: {}", e)))?;
        set_type(headers, "application/json".to_string());
        return Ok(body.into());
    }
    if !record.form.is_empty() {
        let body = record
            .form
            .iter()
            .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
            .collect::<Vec<_>>()
            .join("&");
        set_type(headers, "application/x-www-form-urlencoded".to_string());
        return Ok(body.into_bytes().into());
    }
    if !record.multipart.is_empty() {
        let boundary = format!("----veil{:032x}", rand::random::<u128>());
        let mut body = String::new();
        for (name, value) in &record.multipart {
            body.push_str(&format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                boundary, name, value
            ));
        }
        body.push_str(&format!("--{}--\r\n", boundary));
        set_type(
            headers,
            format!("multipart/form-data; boundary={}", boundary),
        );
        return Ok(body.into_bytes().into());
    }
    Ok(Bytes::from(record.body.clone().into_bytes()))
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Accept loop for the JSON-request listener.
pub async fn serve(listener: TcpListener) -> Result<()> {
    while let Ok((inbound, client_addr)) = listener.accept().await {
        tokio::spawn(async move {
            if let Err(e) = handle(inbound, client_addr).await {
                debug!("failed to serve {}: {}", client_addr, e);
            }
        });
    }
    Ok(())
}

#[instrument(name = "api", skip(inbound), fields(client = %client_addr))]
async fn handle(inbound: TcpStream, client_addr: SocketAddr) -> Result<()> {
    let mut reader = RequestReader::new(inbound);
    let request = reader.read_request().await?;
    info!(method = %request.method, target = %request.target, "accepting request");

    if !request.method.eq_ignore_ascii_case("POST") {
        return respond(
            &mut reader.inner,
            StatusCode::METHOD_NOT_ALLOWED,
            "text/plain; charset=utf-8",
            b"Method Not Allowed\n",
        )
        .await;
    }
    if request.target.split('?').next() != Some("/api/request") {
        return respond(
            &mut reader.inner,
            StatusCode::NOT_FOUND,
            "text/plain; charset=utf-8",
            b"Not Found\n",
        )
        .await;
    }

    let record: RequestRecord = match serde_json::from_slice(&request.body) {
        Ok(record) => record,
        Err(e) => {
            warn!("invalid request record: {}", e);
            return respond(
                &mut reader.inner,
                StatusCode::BAD_REQUEST,
                "text/plain; charset=utf-8",
                format!("{}\n", e).as_bytes(),
            )
            .await;
        }
    };

    match execute(record).await {
        Ok(result) => {
            let body = serde_json::to_vec(&result)
                .map_err(|e| Error::Upstream(format!("failed to encode response: {}", e)))?;
            respond(&mut reader.inner, StatusCode::OK, "application/json", &body).await
        }
        Err(e) => {
            warn!("request failed: {}", e);
            respond(
                &mut reader.inner,
                StatusCode::BAD_REQUEST,
                "text/plain; charset=utf-8",
                format!("{}\n", e).as_bytes(),
            )
            .await
        }
    }
}

async fn respond<W: AsyncWrite + Unpin>(
    w: &mut W,
    status: StatusCode,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        content_type,
        body.len()
    );
    w.write_all(head.as_bytes()).await?;
    w.write_all(body).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_request_with_params_and_form() {
        let record = RequestRecord {
            method: "POST".to_string(),
            url: "https://example.com/search?x=1".to_string(),
            params: HashMap::from([("q".to_string(), "a b".to_string())]),
            form: HashMap::from([("k".to_string(), "v".to_string())]),
            ..Default::default()
        };
        let request = build_request(&record).unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.authority, "example.com");
        assert!(request.path.starts_with("/search?x=1&"));
        assert!(request.path.contains("q=a%20b"));
        assert_eq!(request.body, Bytes::from_static(b"k=v"));
        assert!(request
            .headers
            .iter()
            .any(|(k, v)| k == "Content-Type" && v == "application/x-www-form-urlencoded"));
    }

    #[test]
    fn json_body_wins_over_raw_body() {
        let record = RequestRecord {
            url: "https://example.com/".to_string(),
            json: Some(serde_json::json!({"a": 1})),
            body: "ignored".to_string(),
            ..Default::default()
        };
        let request = build_request(&record).unwrap();
        assert_eq!(request.body, Bytes::from_static(b"{\"a\":1}"));
    }

    #[test]
    fn record_parses_camel_case() {
        let record: RequestRecord = serde_json::from_str(
            r#"{"method":"GET","url":"https://example.com","ja3":"771,4865,0,,","userAgent":"Chrome/120","disableRedirect":true}"#,
        )
        .unwrap();
        assert_eq!(record.user_agent, "Chrome/120");
        assert!(record.disable_redirect);
        assert_eq!(record.ja3, "771,4865,0,,");
    }

    #[test]
    fn missing_host_is_rejected() {
        let record = RequestRecord {
            url: "/relative".to_string(),
            ..Default::default()
        };
        assert!(build_request(&record).is_err());
    }
}
