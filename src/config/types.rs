//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Control channel and forwarder configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Unix socket the port-mapping sender connects to
    pub control_socket: PathBuf,
    /// Address the forwarders are published on, see [`ListenMode`]
    pub listen_addr: IpAddr,
    pub listen_mode: ListenMode,
    pub on_conflict: ConflictPolicy,
    pub stop_sessions: SessionPolicy,
    pub max_message_bytes: usize,
}

/// Upstream dialing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

/// How `listen_addr` decides where forwarding sockets are bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    /// `listen_addr` only picks the address family; forwarders bind loopback.
    /// The upstream may then live on `listen_addr` with the same port.
    #[default]
    Advisory,
    /// Forwarders bind `listen_addr:port` exactly
    Bind,
}

impl ListenMode {
    /// Address a forwarder binds for the given `listen_addr`
    pub fn forwarder_ip(self, listen_addr: IpAddr) -> IpAddr {
        match (self, listen_addr) {
            (ListenMode::Bind, addr) => addr,
            (ListenMode::Advisory, IpAddr::V4(_)) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            (ListenMode::Advisory, IpAddr::V6(_)) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }
}

/// What an add does when its port spec is already forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Keep the existing forwarder and skip the entry
    #[default]
    Reject,
    /// Stop the existing forwarder and start a new one.
    ///
    /// The port is released before the new bind; if that bind fails the
    /// port is left unforwarded until the next add.
    Replace,
}

/// What happens to accepted sessions when their forwarder stops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPolicy {
    /// Sessions keep relaying until their peers close
    #[default]
    Drain,
    /// Sessions are torn down together with the listener
    Abort,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            control_socket: PathBuf::from("/run/portproxy/portproxy.sock"),
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_mode: ListenMode::Advisory,
            on_conflict: ConflictPolicy::Reject,
            stop_sessions: SessionPolicy::Drain,
            max_message_bytes: 64 * 1024,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            upstream: UpstreamConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
