//! CLI configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/jsonlink/config.toml` by default. Durations are given in
//! milliseconds.
//!
//! ```toml
//! [connection]
//! endpoint = "localhost:7800"
//! call_timeout_ms = 30000
//! reconnect_timeout_ms = 5000
//! timeout_policy = "notify"
//!
//! [server]
//! listen = "127.0.0.1:7800"
//! max_connections = 100
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use jsonlink_core::Endpoint;
use jsonlink_protocol::MAX_MESSAGE_SIZE;
use jsonlink_rpc::{ConnectionConfig, DEFAULT_PORT, ListenerConfig, TimeoutPolicy};

use crate::error::{CliError, CliResult};

/// Configuration for the jsonlink CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Debug mode.
    pub debug: bool,

    /// Client connection settings.
    pub connection: ConnectionSettings,

    /// Listener settings for `jsonlink serve`.
    pub server: ServerSettings,
}

/// Client connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Peer to connect to.
    pub endpoint: Endpoint,

    /// Call timeout in milliseconds.
    pub call_timeout_ms: u64,

    /// Reconnect delay in milliseconds.
    pub reconnect_timeout_ms: u64,

    /// Reconnect after the transport drops.
    pub auto_reconnect: bool,

    /// What a call timeout does while connected.
    pub timeout_policy: TimeoutPolicy,

    /// Largest incomplete message buffered from the peer, in bytes.
    pub max_message_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let defaults = ConnectionConfig::default();
        Self {
            endpoint: Endpoint::local(DEFAULT_PORT),
            call_timeout_ms: millis(defaults.call_timeout),
            reconnect_timeout_ms: millis(defaults.reconnect_timeout),
            auto_reconnect: defaults.auto_reconnect,
            timeout_policy: defaults.timeout_policy,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl ConnectionSettings {
    /// Builds the engine configuration.
    pub fn to_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::default()
            .with_call_timeout(Duration::from_millis(self.call_timeout_ms))
            .with_reconnect_timeout(Duration::from_millis(self.reconnect_timeout_ms))
            .with_auto_reconnect(self.auto_reconnect)
            .with_timeout_policy(self.timeout_policy)
            .with_max_message_size(self.max_message_size)
    }
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to listen on.
    pub listen: Endpoint,

    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let defaults = ListenerConfig::default();
        Self {
            listen: defaults.bind,
            max_connections: defaults.max_connections,
        }
    }
}

impl ServerSettings {
    /// Builds the listener configuration, with `connection` applied to every
    /// accepted connection.
    pub fn to_listener_config(&self, connection: ConnectionConfig) -> ListenerConfig {
        ListenerConfig::new(self.listen.clone())
            .with_max_connections(self.max_connections)
            .with_connection(connection)
    }
}

impl CliConfig {
    /// Loads configuration from the default path.
    ///
    /// A missing file yields the defaults.
    pub fn load() -> CliResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> CliResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parses TOML configuration text.
    pub fn parse(content: &str) -> CliResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CliError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that parse but cannot work.
    pub fn validate(&self) -> CliResult<()> {
        if self.connection.call_timeout_ms == 0 {
            return Err(CliError::Config(
                "connection.call_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(CliError::Config(
                "server.max_connections must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("jsonlink")
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
