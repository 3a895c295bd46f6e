//! Relay Session

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};
use uuid::Uuid;

use crate::Result;

/// One accepted inbound connection paired with its dialed upstream
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub start_time: Instant,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

/// Summary of a finished relay session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

/// Which side of the relay ended the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

impl RelaySession {
    /// Create a new relay session
    pub fn new(client_addr: SocketAddr, upstream_addr: SocketAddr) -> Self {
        let session_id = Uuid::new_v4().to_string();
        debug!(
            "Creating relay session {} ({} -> {})",
            session_id, client_addr, upstream_addr
        );

        Self {
            session_id,
            client_addr,
            upstream_addr,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    /// Bytes copied from the client to the upstream
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes copied from the upstream to the client
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn to_stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.session_id.clone(),
            client_addr: self.client_addr,
            upstream_addr: self.upstream_addr,
            duration_ms: self.duration().as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
        }
    }

    /// Dial the upstream. A timeout counts as a dial failure; there is no retry.
    async fn connect_upstream(&self, connect_timeout: Duration) -> Result<TcpStream> {
        match timeout(connect_timeout, TcpStream::connect(self.upstream_addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(e).with_context(|| format!("Failed to connect to upstream {}", self.upstream_addr)),
            Err(_) => Err(anyhow!(
                "Connecting to upstream {} timed out after {:?}",
                self.upstream_addr,
                connect_timeout
            )),
        }
    }

    /// Dial the upstream and relay bytes in both directions.
    ///
    /// The session ends as soon as either direction reaches end-of-stream or
    /// fails; both connections are closed when this returns. On dial failure
    /// the inbound connection is closed immediately.
    pub async fn run(self, mut inbound: TcpStream, connect_timeout: Duration) -> Result<SessionStats> {
        let mut upstream = match self.connect_upstream(connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = inbound.shutdown().await;
                return Err(e);
            }
        };

        debug!(
            "Relay session {} connected {} -> {}",
            self.session_id, self.client_addr, self.upstream_addr
        );

        let (mut client_read, client_write) = inbound.split();
        let (mut upstream_read, upstream_write) = upstream.split();
        let mut to_upstream = CountingWriter::new(upstream_write, &self.bytes_up);
        let mut to_client = CountingWriter::new(client_write, &self.bytes_down);

        let (direction, result) = tokio::select! {
            result = tokio::io::copy(&mut client_read, &mut to_upstream) => (Direction::Up, result),
            result = tokio::io::copy(&mut upstream_read, &mut to_client) => (Direction::Down, result),
        };

        let stats = self.to_stats();
        match result {
            Ok(_) => {
                info!(
                    session_id = %stats.session_id,
                    client_addr = %stats.client_addr,
                    upstream_addr = %stats.upstream_addr,
                    duration_ms = stats.duration_ms,
                    bytes_up = stats.bytes_up,
                    bytes_down = stats.bytes_down,
                    "Relay session completed"
                );
                Ok(stats)
            }
            Err(e) => {
                let side = match direction {
                    Direction::Up => "client->upstream",
                    Direction::Down => "upstream->client",
                };
                Err(anyhow!(
                    "Relay session {} failed on {} after {:?}: {}",
                    stats.session_id,
                    side,
                    self.duration(),
                    e
                ))
            }
        }
    }
}

/// Adds every byte the inner writer accepts to a shared counter
struct CountingWriter<'a, W> {
    inner: W,
    counter: &'a AtomicU64,
}

impl<'a, W> CountingWriter<'a, W> {
    fn new(inner: W, counter: &'a AtomicU64) -> Self {
        Self { inner, counter }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<'_, W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            this.counter.fetch_add(*n as u64, Ordering::Relaxed);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
