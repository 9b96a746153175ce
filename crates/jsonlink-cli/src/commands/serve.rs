//! Serve command: runs a listener with the demo services.

use tracing::info;

use jsonlink_rpc::{ConnectionConfig, Listener};

use crate::config::ServerSettings;
use crate::error::CliResult;
use crate::services;

/// Serves the demo services until `shutdown` completes.
pub async fn run<S>(server: &ServerSettings, connection: ConnectionConfig, shutdown: S) -> CliResult<()>
where
    S: std::future::Future<Output = ()> + Send,
{
    let listener = Listener::bind(server.to_listener_config(connection)).await?;

    for binding in services::all() {
        listener.expose(binding).await;
    }

    let addr = listener.local_addr()?;
    info!(%addr, "Serving demo services");
    println!("listening on {}", addr);

    listener.run_until_shutdown(shutdown).await?;
    Ok(())
}
