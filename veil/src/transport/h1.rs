//! HTTP/1.1 over raw streams: the request/response codec shared by the
//! upstream transport and the proxy's client-facing reader.

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::trace;

use crate::dialer::Io;
use crate::error::{Error, Result};
use crate::headers::{header_get, HeaderList};
use crate::transport::cache::CacheHandle;
use crate::transport::{Request, Response, RoundTrip};

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;

/// Read one header block, up to and including the blank line.
pub(crate) async fn read_head<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let mut head = Vec::with_capacity(1024);
    loop {
        let n = r.read_until(b'\n', &mut head).await?;
        if n == 0 {
            return Err(Error::Read(if head.is_empty() {
                "connection closed".to_string()
            } else {
                "connection closed mid-header".to_string()
            }));
        }
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") || head == b"\r\n" || head == b"\n"
        {
            return Ok(head);
        }
        if head.len() > MAX_HEAD_SIZE {
            return Err(Error::Read("header block too large".to_string()));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    Length(usize),
    Chunked,
    /// body runs to connection close
    Eof,
    None,
}

pub(crate) fn request_framing(headers: &[(String, String)]) -> Result<BodyFraming> {
    if header_get(headers, "transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        return Ok(BodyFraming::Chunked);
    }
    match header_get(headers, "content-length") {
        Some(v) => v
            .trim()
            .parse::<usize>()
            .map(BodyFraming::Length)
            .map_err(|_| Error::BadRequest(format!("invalid content-length: {:?}", v))),
        None => Ok(BodyFraming::None),
    }
}

fn response_framing(status: StatusCode, method: &Method, headers: &[(String, String)]) -> Result<BodyFraming> {
    if method == Method::HEAD
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || status.is_informational()
    {
        return Ok(BodyFraming::None);
    }
    if header_get(headers, "transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        return Ok(BodyFraming::Chunked);
    }
    match header_get(headers, "content-length") {
        Some(v) => v
            .trim()
            .parse::<usize>()
            .map(BodyFraming::Length)
            .map_err(|_| Error::Upstream(format!("invalid content-length: {:?}", v))),
        None => Ok(BodyFraming::Eof),
    }
}

/// Read a body per its framing. The second value tells whether the stream is
/// still positioned at a message boundary (reusable).
pub(crate) async fn read_body<R: AsyncBufRead + Unpin>(
    r: &mut R,
    framing: BodyFraming,
) -> Result<(Bytes, bool)> {
    match framing {
        BodyFraming::None => Ok((Bytes::new(), true)),
        BodyFraming::Length(n) => {
            let mut body = vec![0u8; n];
            r.read_exact(&mut body).await?;
            Ok((body.into(), true))
        }
        BodyFraming::Chunked => {
            let mut body = Vec::new();
            read_chunked(r, &mut body).await?;
            Ok((body.into(), true))
        }
        BodyFraming::Eof => {
            let mut body = Vec::new();
            r.read_to_end(&mut body).await?;
            Ok((body.into(), false))
        }
    }
}

async fn read_line<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<String> {
    let mut line = Vec::with_capacity(32);
    let n = r.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(Error::Read("connection closed mid-chunk".to_string()));
    }
    while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| Error::Read("chunk size line not ascii".to_string()))
}

async fn read_chunked<R: AsyncBufRead + Unpin>(r: &mut R, out: &mut Vec<u8>) -> Result<()> {
    loop {
        let line = read_line(r).await?;
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| Error::Read(format!("invalid chunk size: {:?}", size_str)))?;
        if size == 0 {
            // trailers, if any, end with a blank line
            loop {
                if read_line(r).await?.is_empty() {
                    return Ok(());
                }
            }
        }
        let start = out.len();
        out.resize(start + size, 0);
        r.read_exact(&mut out[start..]).await?;
        let mut crlf = [0u8; 2];
        r.read_exact(&mut crlf).await?;
    }
}

fn parse_header_list(headers: &[httparse::Header<'_>]) -> HeaderList {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect()
}

fn connection_close(version: Version, headers: &[(String, String)]) -> bool {
    match header_get(headers, "connection") {
        Some(v) => v.to_ascii_lowercase().contains("close"),
        None => version == Version::HTTP_10,
    }
}

/// Serialize a request in origin-form. `Host` is synthesized from the
/// authority; framing headers are regenerated from the materialized body;
/// everything else goes out in list order.
pub(crate) async fn write_request<W: AsyncWrite + Unpin>(w: &mut W, req: &Request) -> Result<()> {
    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(req.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(req.path.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    out.extend_from_slice(req.authority.as_bytes());
    out.extend_from_slice(b"\r\n");

    let mut had_length = false;
    for (name, value) in &req.headers {
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        if name.eq_ignore_ascii_case("content-length") {
            had_length = true;
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if had_length || !req.body.is_empty() {
        out.extend_from_slice(format!("Content-Length: {}\r\n", req.body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&req.body);

    w.write_all(&out).await?;
    w.flush().await?;
    Ok(())
}

/// Read a response off the stream, skipping 1xx interim responses.
pub(crate) async fn read_response<R: AsyncBufRead + Unpin>(
    r: &mut R,
    method: &Method,
) -> Result<(Response, bool)> {
    loop {
        let head = read_head(r).await?;
        let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut header_buf);
        match parsed
            .parse(&head)
            .map_err(|e| Error::Upstream(format!("malformed response: {}", e)))?
        {
            httparse::Status::Complete(_) => {}
            httparse::Status::Partial => {
                return Err(Error::Upstream("truncated response head".to_string()))
            }
        }
        let code = parsed.code.unwrap_or(0);
        let version = if parsed.version == Some(0) {
            Version::HTTP_10
        } else {
            Version::HTTP_11
        };
        if (100..200).contains(&code) {
            trace!(code, "skipping interim response");
            continue;
        }
        let status = StatusCode::from_u16(code)
            .map_err(|_| Error::Upstream(format!("invalid status code: {}", code)))?;
        let headers = parse_header_list(parsed.headers);
        let framing = response_framing(status, method, &headers)?;
        let (body, framed) = read_body(r, framing).await?;
        let reusable = framed && !connection_close(version, &headers);
        return Ok((
            Response {
                status,
                version,
                headers,
                body,
            },
            reusable,
        ));
    }
}

/// HTTP/1.1 upstream engine. Plain mode dials raw TCP per request with
/// keep-alive off; TLS mode takes its streams from the cache's dial handoff
/// and keeps one live connection for reuse.
pub struct H1Transport {
    tls: Option<CacheHandle>,
    conn: Mutex<Option<Box<dyn Io>>>,
}

impl H1Transport {
    pub fn plain() -> Self {
        H1Transport {
            tls: None,
            conn: Mutex::new(None),
        }
    }

    pub fn over_tls(handle: CacheHandle) -> Self {
        H1Transport {
            tls: Some(handle),
            conn: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RoundTrip for H1Transport {
    async fn round_trip(&self, req: &Request) -> Result<Response> {
        // One connection per transport; the guard serializes exchanges.
        let mut guard = self.conn.lock().await;
        let mut io: Box<dyn Io> = match (guard.take(), &self.tls) {
            (Some(io), _) => io,
            (None, Some(handle)) => handle.dial_tls(&req.cache_addr()).await?.io,
            (None, None) => Box::new(TcpStream::connect(req.plain_addr()).await?),
        };

        write_request(&mut io, req).await?;
        let mut reader = BufReader::new(io);
        let (response, reusable) = read_response(&mut reader, &req.method).await?;
        let clean = reader.buffer().is_empty();
        if self.tls.is_some() && reusable && clean {
            *guard = Some(reader.into_inner());
        }
        Ok(response)
    }
}

/// Client-facing request reader over one accepted stream. Reading leaves the
/// stream plus its buffered remainder inside; `inner` doubles as the write
/// half, so the proxy keeps exclusive ownership of the byte stream after the
/// head is consumed.
pub struct RequestReader<S> {
    pub(crate) inner: BufReader<S>,
}

/// One request read off the client connection.
#[derive(Debug)]
pub struct ParsedRequest {
    pub method: String,
    pub target: String,
    pub minor: u8,
    pub headers: HeaderList,
    pub body: Bytes,
}

impl<S: AsyncRead + Unpin> RequestReader<S> {
    pub fn new(stream: S) -> Self {
        RequestReader {
            inner: BufReader::new(stream),
        }
    }

    /// Read one full request, head and body.
    pub async fn read_request(&mut self) -> Result<ParsedRequest> {
        let head = read_head(&mut self.inner).await?;
        if head.starts_with(b"PRI * HTTP/2.0") {
            return Err(Error::UnsupportedProtocol);
        }
        let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut header_buf);
        match parsed.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(Error::Read("truncated request head".to_string()))
            }
            Err(httparse::Error::Version) => return Err(Error::UnsupportedProtocol),
            Err(e) => return Err(Error::BadRequest(e.to_string())),
        }
        let method = parsed.method.unwrap_or("").to_string();
        let target = parsed.path.unwrap_or("").to_string();
        let minor = parsed.version.unwrap_or(1);
        let headers = parse_header_list(parsed.headers);
        let framing = request_framing(&headers)?;
        let (body, _) = read_body(&mut self.inner, framing).await?;
        Ok(ParsedRequest {
            method,
            target,
            minor,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    async fn response_from(bytes: &[u8], method: Method) -> Result<(Response, bool)> {
        let mut reader = BufReader::new(bytes);
        read_response(&mut reader, &method).await
    }

    #[tokio::test]
    async fn parses_content_length_response() {
        let (resp, reusable) = response_from(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-One: a\r\n\r\nhello",
            Method::GET,
        )
        .await
        .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, Bytes::from_static(b"hello"));
        assert_eq!(resp.headers[1].0, "X-One");
        assert!(reusable);
    }

    #[tokio::test]
    async fn parses_chunked_response() {
        let (resp, reusable) = response_from(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n1\r\n!\r\n0\r\n\r\n",
            Method::GET,
        )
        .await
        .unwrap();
        assert_eq!(resp.body, Bytes::from_static(b"hello!"));
        assert!(reusable);
    }

    #[tokio::test]
    async fn body_runs_to_eof_without_framing() {
        let (resp, reusable) =
            response_from(b"HTTP/1.1 200 OK\r\n\r\nrest of stream", Method::GET)
                .await
                .unwrap();
        assert_eq!(resp.body, Bytes::from_static(b"rest of stream"));
        assert!(!reusable);
    }

    #[tokio::test]
    async fn no_content_has_no_body() {
        let (resp, reusable) = response_from(b"HTTP/1.1 204 No Content\r\n\r\n", Method::GET)
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::NO_CONTENT);
        assert!(resp.body.is_empty());
        assert!(reusable);
    }

    #[tokio::test]
    async fn interim_responses_are_skipped() {
        let (resp, _) = response_from(
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
            Method::GET,
        )
        .await
        .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn connection_close_disables_reuse() {
        let (_, reusable) = response_from(
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            Method::GET,
        )
        .await
        .unwrap();
        assert!(!reusable);
    }

    #[tokio::test]
    async fn request_serialization_preserves_order_and_reframes() {
        let req = Request {
            method: Method::POST,
            scheme: "https".into(),
            authority: "example.com".into(),
            path: "/submit".into(),
            version: Version::HTTP_11,
            headers: vec![
                ("X-B".into(), "2".into()),
                ("X-A".into(), "1".into()),
                ("Transfer-Encoding".into(), "chunked".into()),
            ],
            body: Bytes::from_static(b"data"),
        };
        let mut out = Vec::new();
        write_request(&mut out, &req).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("POST /submit HTTP/1.1\r\nHost: example.com\r\n"));
        let b = text.find("X-B").unwrap();
        let a = text.find("X-A").unwrap();
        assert!(b < a);
        assert!(!text.to_ascii_lowercase().contains("transfer-encoding"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\ndata"));
    }

    #[tokio::test]
    async fn reads_request_with_body() {
        let bytes: &[u8] =
            b"POST /p HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\n\r\nabc";
        let mut reader = RequestReader::new(bytes);
        let req = reader.read_request().await.unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.target, "/p");
        assert_eq!(req.minor, 1);
        assert_eq!(req.body, Bytes::from_static(b"abc"));
    }

    #[tokio::test]
    async fn h2_preface_is_unsupported() {
        let bytes: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
        let mut reader = RequestReader::new(bytes);
        assert!(matches!(
            reader.read_request().await,
            Err(Error::UnsupportedProtocol)
        ));
    }
}
