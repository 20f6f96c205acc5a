//! Local HTTP server: listen on the agent port, parse requests, hand them to the executor.

use std::net::SocketAddr;
use std::time::Duration;

use nanda_core::protocol::JSON_CONTENT_TYPE;
use nanda_core::ExecutorResponse;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::dispatch::{execute_bounded, SharedExecutor};

const MAX_REQUEST_LEN: usize = 64 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Parsed request line, headers already consumed.
#[derive(Debug, PartialEq, Eq)]
struct ParsedRequest {
    method: String,
    path: String,
    header_len: usize,
    content_length: usize,
}

/// Accept connections and serve each on its own task.
pub async fn serve(
    listener: TcpListener,
    executor: SharedExecutor,
    executor_timeout: Duration,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "http server listening");
    }
    loop {
        let (stream, peer) = listener.accept().await?;
        let executor = executor.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, peer, executor, executor_timeout).await {
                debug!(%peer, error = %e, "http client error");
            }
        });
    }
}

/// None while the header block is incomplete; Some(Err) on a malformed request.
fn parse_request(buf: &[u8]) -> Option<Result<ParsedRequest, httparse::Error>> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    let header_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return None,
        Err(e) => return Some(Err(e)),
    };
    let content_length = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("Content-Length"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
    Some(Ok(ParsedRequest {
        method: req.method.unwrap_or("GET").to_string(),
        path: req.path.unwrap_or("/").to_string(),
        header_len,
        content_length,
    }))
}

async fn read_request(client: &mut TcpStream) -> std::io::Result<Option<(ParsedRequest, String)>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let parsed = loop {
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        match parse_request(&buf) {
            Some(Ok(p)) => break p,
            Some(Err(e)) => {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
            }
            None if buf.len() >= MAX_REQUEST_LEN => {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "headers too large"))
            }
            None => {}
        }
    };
    let body_end = parsed.header_len.saturating_add(parsed.content_length);
    if body_end > MAX_REQUEST_LEN {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "body too large"));
    }
    while buf.len() < body_end {
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let end = body_end.min(buf.len());
    let body = String::from_utf8_lossy(&buf[parsed.header_len..end]).into_owned();
    Ok(Some((parsed, body)))
}

async fn handle_client(
    mut client: TcpStream,
    peer: SocketAddr,
    executor: SharedExecutor,
    executor_timeout: Duration,
) -> std::io::Result<()> {
    let request = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut client)).await {
        Ok(Ok(Some(r))) => r,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
            warn!(%peer, error = %e, "bad request");
            let resp = ExecutorResponse::error(400, "Bad request", "");
            return write_response(&mut client, &resp).await;
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => return Ok(()),
    };
    let (parsed, body) = request;
    debug!(%peer, method = %parsed.method, path = %parsed.path, "http request");
    let resp = execute_bounded(executor, parsed.method, parsed.path, body, executor_timeout).await;
    write_response(&mut client, &resp).await
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        404 => "Not Found",
        504 => "Gateway Timeout",
        _ if status >= 500 => "Internal Server Error",
        _ => "",
    }
}

fn render(resp: &ExecutorResponse) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n",
        resp.status,
        reason(resp.status),
        JSON_CONTENT_TYPE,
        resp.body.len()
    )
    .into_bytes();
    out.extend_from_slice(resp.body.as_bytes());
    out
}

async fn write_response(client: &mut TcpStream, resp: &ExecutorResponse) -> std::io::Result<()> {
    client.write_all(&render(resp)).await?;
    client.flush().await?;
    client.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanda_core::LocalRequestExecutor;
    use std::sync::Arc;

    struct Echo;

    impl LocalRequestExecutor for Echo {
        fn execute(&self, method: &str, path: &str, body: &str) -> ExecutorResponse {
            if path.starts_with("/api/") {
                ExecutorResponse::json(
                    200,
                    &serde_json::json!({"method": method, "path": path, "body": body}),
                )
            } else {
                ExecutorResponse::error(404, "Not found", path)
            }
        }
    }

    async fn roundtrip(raw: &[u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, Arc::new(Echo), Duration::from_secs(1)));
        let mut c = TcpStream::connect(addr).await.unwrap();
        c.write_all(raw).await.unwrap();
        let mut out = String::new();
        c.read_to_string(&mut out).await.unwrap();
        server.abort();
        out
    }

    #[test]
    fn partial_headers_need_more() {
        assert!(parse_request(b"GET /api/sensors HTTP/1.1\r\nHost: x\r\n").is_none());
        let p = parse_request(b"POST /api/display HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcd")
            .unwrap()
            .unwrap();
        assert_eq!(p.method, "POST");
        assert_eq!(p.content_length, 4);
        assert!(parse_request(b"\x01\x02 nonsense\r\n\r\n").unwrap().is_err());
    }

    #[tokio::test]
    async fn serves_executor_json() {
        let out = roundtrip(b"GET /api/battery HTTP/1.1\r\nHost: nanda\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Type: application/json\r\n"));
        let body = out.split("\r\n\r\n").nth(1).unwrap();
        let v: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(v["path"], "/api/battery");
    }

    #[tokio::test]
    async fn reads_body_by_content_length() {
        let out = roundtrip(b"POST /api/display HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello").await;
        let body = out.split("\r\n\r\n").nth(1).unwrap();
        let v: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(v["method"], "POST");
        assert_eq!(v["body"], "hello");
    }

    #[tokio::test]
    async fn unknown_route_is_404_with_path() {
        let out = roundtrip(b"GET /nope HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(out.ends_with(r#"{"error":"Not found","path":"/nope"}"#));
    }
}
