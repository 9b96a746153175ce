//! Engine error types.

use std::any::Any;
use std::io;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use jsonlink_protocol::{METHOD_NOT_FOUND, ProtocolError};

/// Result type for connection operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Errors surfaced to callers and observers of a connection.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The operation needs an attached transport.
    #[error("not connected")]
    NotConnected,

    /// A call was issued with an unusable method name.
    #[error("invalid method name: {0:?}")]
    InvalidMethod(String),

    /// The remote handler reported a failure.
    #[error("{message}")]
    Remote {
        message: String,
        method: String,
        params: Vec<Value>,
    },

    /// No response arrived within the call timeout.
    #[error("call to {method} timed out after {elapsed:?}")]
    Timeout { method: String, elapsed: Duration },

    /// The connection task is gone.
    #[error("connection closed")]
    Closed,

    /// Framing or message shape error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl RpcError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a remote error for a call.
    pub fn remote(message: impl Into<String>, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self::Remote {
            message: message.into(),
            method: method.into(),
            params,
        }
    }

    /// Returns true for errors raised by the remote handler.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

/// Failure reported by a local method handler.
///
/// Only the message travels back to the caller, in the response `error`
/// field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Creates a handler error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error reported for methods nobody exposed.
    pub fn not_found() -> Self {
        Self::new(METHOD_NOT_FOUND)
    }

    /// Error for a positional argument that is missing or has the wrong type.
    pub fn invalid_param(index: usize, reason: impl std::fmt::Display) -> Self {
        Self::new(format!("invalid parameter {}: {}", index, reason))
    }

    /// Converts a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        };
        Self::new(message)
    }

    /// Returns the message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Consumes the error, returning the message.
    pub fn into_message(self) -> String {
        self.message
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<RpcError> for HandlerError {
    fn from(err: RpcError) -> Self {
        Self::new(err.to_string())
    }
}
