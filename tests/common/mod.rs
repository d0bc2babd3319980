#![allow(dead_code)]

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read one request: the head, then a `Content-Length` or chunked body.
pub async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find(&buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let body = &buf[end + 4..];
            if head.contains("transfer-encoding: chunked") {
                if find(body, b"0\r\n\r\n").is_some() {
                    break;
                }
            } else {
                let length = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if body.len() >= length {
                    break;
                }
            }
        }
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Body part of a request read by [`read_request`].
pub fn request_body(request: &str) -> &str {
    request.split_once("\r\n\r\n").map_or("", |(_, body)| body)
}

/// Path of the request line.
pub fn request_path(request: &str) -> &str {
    request.split(' ').nth(1).unwrap_or("")
}

pub fn request_method(request: &str) -> &str {
    request.split(' ').next().unwrap_or("")
}

/// Serve every connection with `handler`, which maps the raw request to the
/// raw response. The connection is closed after the response.
pub async fn serve<F>(handler: F) -> String
where
    F: Fn(String) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        loop {
            if let Ok((mut socket, _)) = listener.accept().await {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let request = read_request(&mut socket).await;
                    let response = handler(request);
                    let _ = socket.write_all(&response).await;
                    let _ = socket.shutdown().await;
                });
            }
        }
    });

    format!("http://{}", addr)
}

/// Accept connections, read the request, send `prefix` and then hold the
/// connection open without finishing the response.
pub async fn serve_stalled(prefix: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            if let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let _ = read_request(&mut socket).await;
                    let _ = socket.write_all(prefix).await;
                    tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                });
            }
        }
    });

    format!("http://{}", addr)
}

pub fn ok(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

pub fn redirect(status: &str, location: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {}\r\nLocation: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status, location
    )
    .into_bytes()
}
