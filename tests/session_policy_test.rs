//! Forwarder stop behaviour, conflict handling and listen modes,
//! driven over a TCP control listener.

mod common;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use portproxy::config::{ConflictPolicy, ListenMode, SessionPolicy};
use portproxy::{MappingRequest, PortProxy, PortSpec, ProxySettings};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

async fn start_proxy(settings: ProxySettings) -> (Arc<PortProxy>, SocketAddr) {
    let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_addr = control.local_addr().unwrap();

    let proxy = Arc::new(PortProxy::with_settings(control, settings));
    let server_proxy = Arc::clone(&proxy);
    tokio::spawn(async move {
        let _ = server_proxy.start().await;
    });

    (proxy, control_addr)
}

async fn send(control: SocketAddr, request: &MappingRequest) {
    let mut stream = TcpStream::connect(control).await.unwrap();
    stream.write_all(&request.encode().unwrap()).await.unwrap();
    stream.shutdown().await.unwrap();
}

/// Open a relayed connection and prove it works with one echo round-trip
async fn open_session(port: u16) -> TcpStream {
    let mut client = TcpStream::connect(loopback(port)).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    client
}

#[tokio::test]
async fn test_drain_keeps_sessions_after_remove() {
    let settings = ProxySettings::new(LOOPBACK).with_session_policy(SessionPolicy::Drain);
    let (proxy, control) = start_proxy(settings).await;
    let upstream = spawn_echo_upstream().await;
    let port = free_port().await;

    send(control, &mapping(false, port, upstream)).await;
    wait_for_forwarding(proxy.manager(), PortSpec::tcp(port), true).await;

    let mut session = open_session(port).await;

    send(control, &mapping(true, port, upstream)).await;
    wait_for_forwarding(proxy.manager(), PortSpec::tcp(port), false).await;

    // New connections are refused, the in-flight one keeps relaying
    let err = TcpStream::connect(loopback(port)).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);

    session.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    timeout(Duration::from_secs(5), session.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"still here");

    proxy.close().await;
}

#[tokio::test]
async fn test_abort_tears_down_sessions_on_remove() {
    let settings = ProxySettings::new(LOOPBACK).with_session_policy(SessionPolicy::Abort);
    let (proxy, control) = start_proxy(settings).await;
    let upstream = spawn_echo_upstream().await;
    let port = free_port().await;

    send(control, &mapping(false, port, upstream)).await;
    wait_for_forwarding(proxy.manager(), PortSpec::tcp(port), true).await;

    let mut session = open_session(port).await;

    send(control, &mapping(true, port, upstream)).await;
    wait_for_forwarding(proxy.manager(), PortSpec::tcp(port), false).await;

    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(5), session.read(&mut buf))
        .await
        .expect("aborted session should be closed");
    assert!(matches!(read, Ok(0) | Err(_)));

    proxy.close().await;
}

#[tokio::test]
async fn test_conflicting_add_is_rejected_by_default() {
    let (proxy, control) = start_proxy(ProxySettings::new(LOOPBACK)).await;
    let first = spawn_http_upstream().await;
    let second = spawn_echo_upstream().await;
    let port = free_port().await;

    send(control, &mapping(false, port, first)).await;
    wait_for_forwarding(proxy.manager(), PortSpec::tcp(port), true).await;

    let outcome = proxy.apply(mapping(false, port, second)).await;
    assert_eq!(outcome.skipped, vec![PortSpec::tcp(port)]);

    let (status, body) = http_get(loopback(port)).await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, HTTP_BODY);

    proxy.close().await;
}

#[tokio::test]
async fn test_conflicting_add_replaces_when_configured() {
    let settings = ProxySettings::new(LOOPBACK).with_conflict_policy(ConflictPolicy::Replace);
    let (proxy, _control) = start_proxy(settings).await;
    let first = spawn_http_upstream().await;
    let second = spawn_echo_upstream().await;
    let port = free_port().await;

    proxy.apply(mapping(false, port, first)).await;
    let outcome = proxy.apply(mapping(false, port, second)).await;
    assert_eq!(outcome.started, vec![PortSpec::tcp(port)]);

    let infos = proxy.forwarders().await;
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].upstream, second);

    let _session = open_session(port).await;
    proxy.close().await;
}

#[tokio::test]
async fn test_advisory_listen_addr_binds_loopback() {
    let listen_addr = IpAddr::V4(Ipv4Addr::new(10, 0, 2, 15));
    let (proxy, _control) = start_proxy(ProxySettings::new(listen_addr)).await;
    let upstream = spawn_echo_upstream().await;
    let port = free_port().await;

    let outcome = proxy.apply(mapping(false, port, upstream)).await;
    assert_eq!(outcome.started, vec![PortSpec::tcp(port)]);

    let local = proxy.manager().local_addr(PortSpec::tcp(port)).await.unwrap();
    assert_eq!(local, SocketAddr::new(LOOPBACK, port));
    let _session = open_session(port).await;

    proxy.close().await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_bind_mode_binds_listen_addr_exactly() {
    let listen_addr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2));
    let settings = ProxySettings::new(listen_addr).with_listen_mode(ListenMode::Bind);
    let (proxy, _control) = start_proxy(settings).await;
    let upstream = spawn_echo_upstream().await;
    let port = free_port().await;

    proxy.apply(mapping(false, port, upstream)).await;

    let local = proxy.manager().local_addr(PortSpec::tcp(port)).await.unwrap();
    assert_eq!(local, SocketAddr::new(listen_addr, port));

    let err = TcpStream::connect(loopback(port)).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);

    let mut client = TcpStream::connect((listen_addr, port)).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    proxy.close().await;
}

#[tokio::test]
async fn test_unreachable_upstream_closes_client_only() {
    let (proxy, _control) = start_proxy(ProxySettings::new(LOOPBACK).with_connect_timeout(Duration::from_secs(2))).await;
    let dead_upstream = loopback(free_port().await);
    let port = free_port().await;

    proxy.apply(mapping(false, port, dead_upstream)).await;

    let mut client = TcpStream::connect(loopback(port)).await.unwrap();
    let mut buf = [0u8; 8];
    let read = timeout(Duration::from_secs(5), client.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    // The forwarder itself is unaffected
    assert!(proxy.manager().is_forwarding(PortSpec::tcp(port)).await);
    let _second = TcpStream::connect(loopback(port)).await.unwrap();

    proxy.close().await;
}
