//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use portproxy::proxy::Manager;
use portproxy::{Binding, MappingRequest, PortSpec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};

pub const HTTP_BODY: &str = "called the upstream server";

/// Find a port nobody is listening on right now
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Minimal HTTP server answering every request with `HTTP_BODY`, no keep-alive
pub async fn spawn_http_upstream() -> SocketAddr {
    spawn_http_upstream_on(IpAddr::V4(Ipv4Addr::LOCALHOST)).await
}

/// Same as `spawn_http_upstream`, on an ephemeral port of `ip`
pub async fn spawn_http_upstream_on(ip: IpAddr) -> SocketAddr {
    let listener = TcpListener::bind((ip, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    HTTP_BODY.len(),
                    HTTP_BODY
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    addr
}

/// Echo server; every connection echoes until the peer closes
pub async fn spawn_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });

    addr
}

/// Send `GET /` and return (status code, body)
pub async fn http_get(addr: SocketAddr) -> std::io::Result<(u16, String)> {
    let mut stream = TcpStream::connect(addr).await?;
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await?;

    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "response timed out"))??;

    let text = String::from_utf8_lossy(&response).into_owned();
    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    Ok((status, body))
}

pub fn mapping(remove: bool, port: u16, upstream: SocketAddr) -> MappingRequest {
    MappingRequest {
        remove,
        ports: vec![(PortSpec::tcp(port), vec![Binding::from(upstream)])],
    }
}

/// Poll until the manager's view of `spec` matches `forwarding`
pub async fn wait_for_forwarding(manager: &Manager, spec: PortSpec, forwarding: bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.is_forwarding(spec).await != forwarding {
        assert!(
            Instant::now() < deadline,
            "{} never became {}",
            spec,
            if forwarding { "forwarded" } else { "unforwarded" }
        );
        sleep(Duration::from_millis(10)).await;
    }
}

pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}
