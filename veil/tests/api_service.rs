//! The JSON-request service end to end, with a plain-HTTP origin.

mod helpers;

use helpers::read_head_text;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn start_api() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(veil::api::serve(listener));
    addr
}

async fn start_plain_origin() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = read_head_text(&mut stream).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                    .await;
            });
        }
    });
    addr
}

async fn roundtrip(addr: std::net::SocketAddr, request: String) -> String {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(request.as_bytes()).await.unwrap();
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    String::from_utf8_lossy(&reply).into_owned()
}

#[tokio::test]
async fn executes_described_request() {
    let origin = start_plain_origin().await;
    let api = start_api().await;

    let record = format!(
        r#"{{"method":"GET","url":"http://{}/x","userAgent":"Chrome/120"}}"#,
        origin
    );
    let request = format!(
        "POST /api/request HTTP/1.1\r\nHost: api\r\nContent-Length: {}\r\n\r\n{}",
        record.len(),
        record
    );
    let reply = roundtrip(api, request).await;
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "reply was {:?}", reply);
    assert!(reply.contains("application/json"));
    assert!(reply.contains(r#""status":200"#));
    assert!(reply.contains(r#""body":"ok""#));
}

#[tokio::test]
async fn non_post_method_is_rejected() {
    let api = start_api().await;
    let reply = roundtrip(api, "GET /api/request HTTP/1.1\r\nHost: api\r\n\r\n".to_string()).await;
    assert!(reply.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
}

#[tokio::test]
async fn malformed_record_yields_400() {
    let api = start_api().await;
    let request =
        "POST /api/request HTTP/1.1\r\nHost: api\r\nContent-Length: 9\r\n\r\nnot json!".to_string();
    let reply = roundtrip(api, request).await;
    assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[tokio::test]
async fn unknown_path_yields_404() {
    let api = start_api().await;
    let request = "POST /other HTTP/1.1\r\nHost: api\r\nContent-Length: 2\r\n\r\n{}".to_string();
    let reply = roundtrip(api, request).await;
    assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"));
}
