//! Portproxy - dynamic TCP port forwarder
//!
//! Listens on a local control socket for container port-mapping updates and
//! keeps one forwarding listener per published port.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portproxy::config::{ConfigManager, ConflictPolicy, ListenMode, SessionPolicy};
use portproxy::{ControlListener, PortProxy, ProxySettings, ShutdownCoordinator};

/// CLI arguments for portproxy
#[derive(Parser, Debug)]
#[command(name = "portproxy")]
#[command(about = "Dynamic TCP port forwarder driven by port-mapping updates")]
#[command(version)]
#[command(long_about = "
Portproxy - dynamic TCP port forwarder

Accepts one JSON port-mapping message per connection on a local control
socket and opens or closes forwarding listeners accordingly.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file, when it exists
3. Otherwise environment variables
4. Built-in defaults

Environment variables (read only when the configuration file is absent):
  PORTPROXY_CONTROL_SOCKET     - Control socket path
  PORTPROXY_LISTEN_ADDR        - Address forwarders are published on
  PORTPROXY_LISTEN_MODE        - advisory (bind loopback) or bind (bind listen addr)
  PORTPROXY_CONNECT_TIMEOUT    - Upstream connect timeout (e.g. 10s)
  PORTPROXY_MAX_MESSAGE_BYTES  - Largest accepted control message
  PORTPROXY_LOG_LEVEL          - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "portproxy.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    /// Control socket path (overrides config file)
    #[arg(short = 's', long, help = "Unix socket the port-mapping sender connects to")]
    pub control_socket: Option<PathBuf>,

    /// Listen address (overrides config file)
    #[arg(short, long, help = "Address forwarders are published on (e.g. 192.168.127.2)")]
    pub listen_addr: Option<IpAddr>,

    /// Bind forwarders on the listen address itself instead of loopback
    #[arg(long, help = "Bind forwarding sockets on the listen address exactly")]
    pub bind_listen_addr: bool,

    /// Replace existing forwarders on conflicting adds instead of rejecting
    #[arg(long, help = "Replace an existing forwarder when its port is added again")]
    pub replace_on_conflict: bool,

    /// Abort in-flight sessions when their forwarder stops
    #[arg(long, help = "Close in-flight sessions when their forwarder is removed")]
    pub abort_sessions: bool,

    /// Log level (overrides config file)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut config = ConfigManager::load(&args.config)?;

    config.merge_with_cli_args(
        args.control_socket.as_deref(),
        args.listen_addr,
        args.bind_listen_addr.then_some(ListenMode::Bind),
        args.replace_on_conflict.then_some(ConflictPolicy::Replace),
        args.abort_sessions.then_some(SessionPolicy::Abort),
    );

    init_tracing(&args, &config.logging.level)?;

    info!("Starting portproxy v{}", env!("CARGO_PKG_VERSION"));

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Control socket: {}", config.proxy.control_socket.display());
        info!("  Listen address: {} ({:?})", config.proxy.listen_addr, config.proxy.listen_mode);
        info!("  On conflict: {:?}", config.proxy.on_conflict);
        info!("  Stopped forwarder sessions: {:?}", config.proxy.stop_sessions);
        info!("  Connect timeout: {:?}", config.upstream.connect_timeout);
        return Ok(());
    }

    let socket_path = config.proxy.control_socket.clone();
    let listener = bind_control_socket(&socket_path)?;

    let settings = ProxySettings::from_config(&config);
    let forwarder_ip = settings.forwarder_ip();
    let proxy = Arc::new(PortProxy::with_settings(listener, settings));

    let shutdown_coordinator = Arc::new(ShutdownCoordinator::new());
    let mut shutdown_rx = shutdown_coordinator.subscribe();

    // The control loop ending on its own also shuts the process down
    let server_proxy = Arc::clone(&proxy);
    let server_shutdown = Arc::clone(&shutdown_coordinator);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server_proxy.start().await {
            error!("Port proxy error: {:#}", e);
        }
        server_shutdown.trigger();
    });

    let signal_shutdown = Arc::clone(&shutdown_coordinator);
    tokio::spawn(async move {
        if let Err(e) = signal_shutdown.listen_for_signals().await {
            error!("Error setting up signal handlers: {}", e);
            signal_shutdown.trigger();
        }
    });

    info!(
        "Port proxy ready: control socket {}, forwarding on {}",
        socket_path.display(),
        forwarder_ip
    );

    let _ = shutdown_rx.recv().await;
    proxy.close().await;

    if let Err(e) = server_handle.await {
        if !e.is_cancelled() {
            error!("Port proxy task failed: {}", e);
        }
    }

    if let Err(e) = std::fs::remove_file(&socket_path) {
        warn!("Failed to remove control socket {}: {}", socket_path.display(), e);
    }

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
fn bind_control_socket(path: &Path) -> Result<ControlListener> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    // A socket file left behind by a previous run would make bind fail
    if path.exists() {
        warn!("Removing stale control socket {}", path.display());
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }

    let listener = tokio::net::UnixListener::bind(path)
        .with_context(|| format!("Failed to bind control socket {}", path.display()))?;
    Ok(listener.into())
}

#[cfg(not(unix))]
fn bind_control_socket(path: &Path) -> Result<ControlListener> {
    anyhow::bail!("Unix control sockets are not supported here: {}", path.display())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, configured_level: &str) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        args.log_level.as_deref().unwrap_or(configured_level)
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
