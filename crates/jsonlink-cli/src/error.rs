//! CLI error types.

use std::fmt;

use jsonlink_rpc::RpcError;

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

/// Errors that can occur in the CLI.
#[derive(Debug)]
pub enum CliError {
    /// Configuration error.
    Config(String),
    /// IO error.
    Io(std::io::Error),
    /// Connection to the peer failed.
    Connection(String),
    /// Engine error.
    Rpc(RpcError),
    /// The remote handler reported a failure.
    Remote(String),
    /// Operation timed out.
    Timeout(String),
    /// Output could not be rendered.
    Output(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Connection(msg) => write!(f, "connection error: {}", msg),
            Self::Rpc(err) => write!(f, "rpc error: {}", err),
            Self::Remote(msg) => write!(f, "remote error: {}", msg),
            Self::Timeout(msg) => write!(f, "timeout: {}", msg),
            Self::Output(msg) => write!(f, "output error: {}", msg),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Rpc(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<RpcError> for CliError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote { message, .. } => Self::Remote(message),
            RpcError::Timeout { method, elapsed } => {
                Self::Timeout(format!("{} did not answer within {:?}", method, elapsed))
            }
            RpcError::Io(err) => Self::Io(err),
            other => Self::Rpc(other),
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        Self::Output(err.to_string())
    }
}
