//! Remote endpoint addressing.
//!
//! A client connection remembers the [`Endpoint`] it was asked to connect to
//! so that every reconnect attempt targets the same host and port.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Host used when an endpoint is given as a bare port.
pub const DEFAULT_HOST: &str = "localhost";

/// Errors produced while parsing an endpoint string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    /// The string was empty.
    #[error("empty endpoint")]
    Empty,

    /// The port part was missing or not a valid u16.
    #[error("invalid port in endpoint '{input}'")]
    InvalidPort { input: String },
}

/// A host and port pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Creates an endpoint on [`DEFAULT_HOST`].
    pub fn local(port: u16) -> Self {
        Self::new(DEFAULT_HOST, port)
    }

    /// Returns the `host:port` form accepted by `tokio::net::TcpStream::connect`.
    ///
    /// IPv6 literals are bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    /// Accepts `host:port`, `[v6]:port`, `:port` and a bare `port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EndpointError::Empty);
        }

        let invalid = || EndpointError::InvalidPort {
            input: s.to_string(),
        };

        let Some((host, port)) = s.rsplit_once(':') else {
            let port = s.parse().map_err(|_| invalid())?;
            return Ok(Self::local(port));
        };

        let port = port.parse().map_err(|_| invalid())?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            Ok(Self::local(port))
        } else {
            Ok(Self::new(host, port))
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = EndpointError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.authority()
    }
}

impl From<u16> for Endpoint {
    fn from(port: u16) -> Self {
        Self::local(port)
    }
}

impl From<std::net::SocketAddr> for Endpoint {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}
