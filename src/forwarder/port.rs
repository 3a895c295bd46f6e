//! Port Forwarder Implementation

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::ForwarderState;
use crate::config::SessionPolicy;
use crate::protocol::{PortSpec, Protocol};
use crate::relay::RelaySession;
use crate::Result;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Settings shared by every forwarder a manager starts
#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    pub connect_timeout: Duration,
    pub session_policy: SessionPolicy,
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            session_policy: SessionPolicy::Drain,
        }
    }
}

/// Connection counters for one forwarder
#[derive(Debug, Default)]
pub struct ForwarderStats {
    total_connections: AtomicU64,
    active_sessions: AtomicU64,
}

impl ForwarderStats {
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    fn session_opened(self: &Arc<Self>) -> ActiveSession {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        ActiveSession(Arc::clone(self))
    }
}

/// Decrements the active count however the session task ends, abort included.
struct ActiveSession(Arc<ForwarderStats>);

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of a forwarder
#[derive(Debug, Clone, Serialize)]
pub struct ForwarderInfo {
    pub spec: PortSpec,
    pub local_addr: SocketAddr,
    pub upstream: SocketAddr,
    pub state: ForwarderState,
    pub total_connections: u64,
    pub active_sessions: u64,
}

/// Owns one listening socket and relays its connections to a fixed upstream
pub struct PortForwarder {
    spec: PortSpec,
    local_addr: SocketAddr,
    upstream: SocketAddr,
    state: ForwarderState,
    stats: Arc<ForwarderStats>,
    stop_tx: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl PortForwarder {
    /// Bind `listen_ip:spec.port` and start accepting.
    ///
    /// Bind failures are returned to the caller; nothing is spawned in that case.
    pub async fn start(
        spec: PortSpec,
        listen_ip: IpAddr,
        upstream: SocketAddr,
        settings: ForwarderSettings,
    ) -> Result<Self> {
        if spec.protocol != Protocol::Tcp {
            bail!("unsupported protocol for {}: only tcp is forwarded", spec);
        }

        let mut state = ForwarderState::Starting;
        let bind_addr = SocketAddr::new(listen_ip, spec.port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind forwarder for {} on {}", spec, bind_addr))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read forwarder local address")?;
        state.transition(ForwarderState::Listening)?;

        info!("Forwarding {} -> {} ({})", local_addr, upstream, spec);

        let stats = Arc::new(ForwarderStats::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            upstream,
            settings,
            stop_rx,
            Arc::clone(&stats),
        ));

        Ok(Self {
            spec,
            local_addr,
            upstream,
            state,
            stats,
            stop_tx,
            accept_task: Some(accept_task),
        })
    }

    pub fn spec(&self) -> PortSpec {
        self.spec
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    pub fn state(&self) -> ForwarderState {
        self.state
    }

    pub fn stats(&self) -> Arc<ForwarderStats> {
        Arc::clone(&self.stats)
    }

    pub fn info(&self) -> ForwarderInfo {
        ForwarderInfo {
            spec: self.spec,
            local_addr: self.local_addr,
            upstream: self.upstream,
            state: self.state,
            total_connections: self.stats.total_connections(),
            active_sessions: self.stats.active_sessions(),
        }
    }

    /// Close the listening socket.
    ///
    /// Returns once the accept loop has exited and the port is released.
    /// Calling it again is a no-op.
    pub async fn stop(&mut self) {
        if !self.state.is_listening() {
            return;
        }
        if let Err(e) = self.state.transition(ForwarderState::Stopping) {
            warn!("{}: {}", self.spec, e);
            return;
        }

        self.stop_tx.send_replace(true);
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Accept loop for {} ended abnormally: {}", self.spec, e);
                }
            }
        }

        if let Err(e) = self.state.transition(ForwarderState::Stopped) {
            warn!("{}: {}", self.spec, e);
        }
        info!("Stopped forwarding {} ({})", self.local_addr, self.spec);
    }
}

impl Drop for PortForwarder {
    fn drop(&mut self) {
        if self.accept_task.is_some() {
            self.stop_tx.send_replace(true);
        }
    }
}

/// Accept until told to stop; each connection gets its own relay session.
async fn accept_loop(
    listener: TcpListener,
    upstream: SocketAddr,
    settings: ForwarderSettings,
    mut stop_rx: watch::Receiver<bool>,
    stats: Arc<ForwarderStats>,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = stop_rx.changed() => break,

            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}

            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("Accepted connection from {} for {}", peer_addr, upstream);
                    let guard = stats.session_opened();
                    sessions.spawn(relay(stream, peer_addr, upstream, settings.connect_timeout, guard));
                }
                Err(e) => {
                    warn!("Accept error on forwarder for {}: {}", upstream, e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }

    drop(listener);

    match settings.session_policy {
        SessionPolicy::Drain => {
            if !sessions.is_empty() {
                debug!("Leaving {} session(s) to {} to drain", sessions.len(), upstream);
            }
            sessions.detach_all();
        }
        SessionPolicy::Abort => {
            if !sessions.is_empty() {
                debug!("Aborting {} session(s) to {}", sessions.len(), upstream);
            }
            sessions.shutdown().await;
        }
    }
}

async fn relay(
    stream: TcpStream,
    peer_addr: SocketAddr,
    upstream: SocketAddr,
    connect_timeout: Duration,
    _active: ActiveSession,
) {
    let session = RelaySession::new(peer_addr, upstream);
    if let Err(e) = session.run(stream, connect_timeout).await {
        warn!("{:#}", e);
    }
}
