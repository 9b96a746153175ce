//! Call and notify commands.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use jsonlink_core::Endpoint;
use jsonlink_rpc::{Connection, ConnectionConfig, ConnectionHandle, TimeoutPolicy};

use crate::error::{CliError, CliResult};

/// Connects, waiting at most the call timeout for the transport.
async fn connect(endpoint: &Endpoint, config: ConnectionConfig) -> CliResult<ConnectionHandle> {
    let wait = config.call_timeout;
    // Calls fail at the timeout instead of waiting on a silent peer.
    let handle = Connection::new(config.with_timeout_policy(TimeoutPolicy::Fail)).spawn();
    handle.connect(endpoint.clone()).await?;

    match tokio::time::timeout(wait, handle.wait_connected()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(CliError::Connection(format!(
                "could not connect to {} within {:?}",
                endpoint, wait
            )));
        }
    }
    debug!(%endpoint, "Connected");
    Ok(handle)
}

/// Calls `method` on `endpoint` and returns the result.
pub async fn call(
    endpoint: &Endpoint,
    config: ConnectionConfig,
    method: &str,
    params: Vec<Value>,
) -> CliResult<Value> {
    let handle = connect(endpoint, config).await?;
    let result = handle.call(method, params).await?;
    handle.end().await?;
    Ok(result)
}

/// Sends a notification for `method` to `endpoint`.
///
/// Returns once the notification has been flushed and the connection closed.
pub async fn notify(
    endpoint: &Endpoint,
    config: ConnectionConfig,
    method: &str,
    params: Vec<Value>,
) -> CliResult<()> {
    let handle = connect(endpoint, config).await?;
    handle.notify(method, params).await?;
    handle.end().await?;
    Ok(())
}

/// Renders a call result for stdout.
pub fn render(result: &Value) -> CliResult<String> {
    Ok(serde_json::to_string_pretty(result)?)
}

/// Parses `--timeout` milliseconds.
pub fn timeout_from_millis(millis: u64) -> Duration {
    Duration::from_millis(millis.max(1))
}
