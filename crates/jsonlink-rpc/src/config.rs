//! Connection and listener configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use jsonlink_core::Endpoint;
use jsonlink_protocol::MAX_MESSAGE_SIZE;

/// Port used when nothing else is configured.
pub const DEFAULT_PORT: u16 = 7800;

/// What happens when a call times out while the connection is still up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// Emit a timeout event and keep waiting for the response.
    #[default]
    Notify,
    /// Emit a timeout event, then fail the call and forget it.
    Fail,
}

/// Per-connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long a call may wait for its response.
    pub call_timeout: Duration,

    /// Delay before a dropped client connection retries.
    pub reconnect_timeout: Duration,

    /// Whether a client reconnects after an unexpected close.
    pub auto_reconnect: bool,

    /// Behavior of a call timeout while connected.
    pub timeout_policy: TimeoutPolicy,

    /// Largest incomplete message the decoder will buffer.
    pub max_message_size: usize,

    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            reconnect_timeout: Duration::from_secs(5),
            auto_reconnect: true,
            timeout_policy: TimeoutPolicy::Notify,
            max_message_size: MAX_MESSAGE_SIZE,
            event_capacity: 256,
        }
    }
}

impl ConnectionConfig {
    /// Builder: set call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Builder: set reconnect delay.
    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }

    /// Builder: enable or disable auto-reconnect.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Builder: set timeout policy.
    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    /// Builder: set decoder buffer limit.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Builder: set event channel capacity (minimum 1).
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind.
    pub bind: Endpoint,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Configuration for every accepted connection.
    ///
    /// `auto_reconnect` is ignored: accepted connections never reconnect.
    pub connection: ConnectionConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: Endpoint::new("127.0.0.1", DEFAULT_PORT),
            max_connections: 100,
            connection: ConnectionConfig::default(),
        }
    }
}

impl ListenerConfig {
    /// Creates a listener configuration for the given address.
    pub fn new(bind: impl Into<Endpoint>) -> Self {
        Self {
            bind: bind.into(),
            ..Default::default()
        }
    }

    /// Builder: set max connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Builder: set the per-connection configuration.
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}
