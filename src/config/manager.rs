//! Configuration Manager

use super::{Config, ConflictPolicy, ListenMode, SessionPolicy};
use crate::Result;
use anyhow::{bail, Context};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

const MIN_MESSAGE_BYTES: usize = 2;
const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
const MAX_CONNECT_TIMEOUT_SECS: u64 = 600;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load from `path` when it exists, otherwise from the environment.
    ///
    /// The two sources are not layered: an existing file wins outright.
    pub fn load(path: &Path) -> Result<Config> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            Self::load_from_env()
        }
    }

    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(socket) = std::env::var("PORTPROXY_CONTROL_SOCKET") {
            config.proxy.control_socket = PathBuf::from(socket);
        }

        if let Ok(listen_addr) = std::env::var("PORTPROXY_LISTEN_ADDR") {
            config.proxy.listen_addr = listen_addr
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid PORTPROXY_LISTEN_ADDR: {}", listen_addr))?;
        }

        if let Ok(mode) = std::env::var("PORTPROXY_LISTEN_MODE") {
            config.proxy.listen_mode = match mode.to_ascii_lowercase().as_str() {
                "advisory" => ListenMode::Advisory,
                "bind" => ListenMode::Bind,
                _ => bail!("Invalid PORTPROXY_LISTEN_MODE: {} (expected advisory or bind)", mode),
            };
        }

        if let Ok(timeout) = std::env::var("PORTPROXY_CONNECT_TIMEOUT") {
            config.upstream.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid PORTPROXY_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Ok(max_bytes) = std::env::var("PORTPROXY_MAX_MESSAGE_BYTES") {
            config.proxy.max_message_bytes = max_bytes
                .parse::<usize>()
                .with_context(|| format!("Invalid PORTPROXY_MAX_MESSAGE_BYTES: {}", max_bytes))?;
        }

        if let Ok(log_level) = std::env::var("PORTPROXY_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_proxy_config()
            .with_context(|| "Proxy configuration validation failed")?;

        self.validate_upstream_config()
            .with_context(|| "Upstream configuration validation failed")?;

        Ok(())
    }

    fn validate_proxy_config(&self) -> Result<()> {
        if self.proxy.control_socket.as_os_str().is_empty() {
            bail!("control_socket must not be empty");
        }

        if self.proxy.max_message_bytes < MIN_MESSAGE_BYTES {
            bail!("max_message_bytes must be at least {} bytes", MIN_MESSAGE_BYTES);
        }

        if self.proxy.max_message_bytes > MAX_MESSAGE_BYTES {
            bail!("max_message_bytes cannot exceed 16MB");
        }

        Ok(())
    }

    fn validate_upstream_config(&self) -> Result<()> {
        if self.upstream.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if self.upstream.connect_timeout.as_secs() > MAX_CONNECT_TIMEOUT_SECS {
            bail!("connect_timeout cannot exceed 10 minutes");
        }

        Ok(())
    }

    /// Apply command-line overrides on top of the loaded configuration
    pub fn merge_with_cli_args(
        &mut self,
        control_socket: Option<&Path>,
        listen_addr: Option<IpAddr>,
        listen_mode: Option<ListenMode>,
        on_conflict: Option<ConflictPolicy>,
        stop_sessions: Option<SessionPolicy>,
    ) {
        if let Some(socket) = control_socket {
            self.proxy.control_socket = socket.to_path_buf();
        }

        if let Some(addr) = listen_addr {
            self.proxy.listen_addr = addr;
        }

        if let Some(mode) = listen_mode {
            self.proxy.listen_mode = mode;
        }

        if let Some(policy) = on_conflict {
            self.proxy.on_conflict = policy;
        }

        if let Some(policy) = stop_sessions {
            self.proxy.stop_sessions = policy;
        }
    }
}
