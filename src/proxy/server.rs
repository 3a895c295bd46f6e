//! Port Proxy Lifecycle
//!
//! Ties the control channel to the forwarder manager: `start` runs the
//! control loop, `close` tears everything down.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use super::{ApplyOutcome, Manager};
use crate::config::{Config, ConflictPolicy, ListenMode, SessionPolicy};
use crate::control::{ControlListener, ControlReader};
use crate::forwarder::{ForwarderInfo, ForwarderSettings};
use crate::protocol::MappingRequest;
use crate::Result;

/// Runtime settings for a proxy instance
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub listen_addr: IpAddr,
    pub listen_mode: ListenMode,
    pub on_conflict: ConflictPolicy,
    pub session_policy: SessionPolicy,
    pub connect_timeout: Duration,
    pub max_message_bytes: usize,
}

impl ProxySettings {
    pub fn new(listen_addr: IpAddr) -> Self {
        let defaults = Config::default();
        Self {
            listen_addr,
            listen_mode: defaults.proxy.listen_mode,
            on_conflict: defaults.proxy.on_conflict,
            session_policy: defaults.proxy.stop_sessions,
            connect_timeout: defaults.upstream.connect_timeout,
            max_message_bytes: defaults.proxy.max_message_bytes,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            listen_addr: config.proxy.listen_addr,
            listen_mode: config.proxy.listen_mode,
            on_conflict: config.proxy.on_conflict,
            session_policy: config.proxy.stop_sessions,
            connect_timeout: config.upstream.connect_timeout,
            max_message_bytes: config.proxy.max_message_bytes,
        }
    }

    pub fn with_listen_mode(mut self, mode: ListenMode) -> Self {
        self.listen_mode = mode;
        self
    }

    /// Address forwarders actually bind
    pub fn forwarder_ip(&self) -> IpAddr {
        self.listen_mode.forwarder_ip(self.listen_addr)
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.on_conflict = policy;
        self
    }

    pub fn with_session_policy(mut self, policy: SessionPolicy) -> Self {
        self.session_policy = policy;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Dynamic port-forwarding proxy driven by a control channel
pub struct PortProxy {
    control: Mutex<Option<ControlListener>>,
    manager: Arc<Manager>,
    max_message_bytes: usize,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl PortProxy {
    /// Create a proxy for `listen_addr` with default settings.
    ///
    /// By default `listen_addr` is advisory and forwarders bind loopback;
    /// see [`ListenMode`].
    pub fn new(control: impl Into<ControlListener>, listen_addr: IpAddr) -> Self {
        Self::with_settings(control, ProxySettings::new(listen_addr))
    }

    pub fn with_settings(control: impl Into<ControlListener>, settings: ProxySettings) -> Self {
        let forwarder_settings = ForwarderSettings {
            connect_timeout: settings.connect_timeout,
            session_policy: settings.session_policy,
        };
        let manager = Manager::new(settings.forwarder_ip(), settings.on_conflict, forwarder_settings);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            control: Mutex::new(Some(control.into())),
            manager: Arc::new(manager),
            max_message_bytes: settings.max_message_bytes,
            shutdown_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Run the control loop until the proxy is closed.
    ///
    /// May only be called once; the control listener is consumed.
    pub async fn start(&self) -> Result<()> {
        let listener = self
            .control
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("port proxy already started or closed"))?;

        let shutdown_rx = self.shutdown_tx.subscribe();
        info!("Port proxy started (forwarding on {})", self.manager.listen_ip());
        ControlReader::new(listener, Arc::clone(&self.manager), self.max_message_bytes)
            .run(shutdown_rx)
            .await;
        Ok(())
    }

    /// Stop the control loop, then every forwarder. Idempotent.
    ///
    /// Relay sessions are not waited for.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Port proxy already closed");
            return;
        }

        self.shutdown_tx.send_replace(true);
        // Never started: drop the control listener here
        drop(self.control.lock().await.take());

        self.manager.close_all().await;
        info!("Port proxy closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Apply a mapping directly, bypassing the control channel
    pub async fn apply(&self, request: MappingRequest) -> ApplyOutcome {
        self.manager.apply(request).await
    }

    pub async fn forwarders(&self) -> Vec<ForwarderInfo> {
        self.manager.forwarders().await
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }
}
