//! Connection engine: call correlation, method dispatch, reconnect, listener.
//!
//! This crate turns a duplex byte stream into bidirectional JSON-RPC:
//! - Outbound calls with id correlation, timeouts and a deferred-call queue
//! - Inbound request and notification dispatch to exposed methods
//! - Client reconnect after transport loss
//! - A TCP listener that serves every accepted stream
//!
//! # Example
//!
//! ```rust,no_run
//! use jsonlink_rpc::{Listener, ListenerConfig, ServiceBinding, sync_fn};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = Listener::bind(ListenerConfig::default()).await?;
//!     listener
//!         .expose(ServiceBinding::function("ping", sync_fn(|_| Ok(json!("pong")))))
//!         .await;
//!
//!     listener.run().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod connection;
mod correlator;
mod error;
mod event;
mod listener;
mod registry;
mod transport;

pub use config::{ConnectionConfig, DEFAULT_PORT, ListenerConfig, TimeoutPolicy};
pub use connection::{Connection, ConnectionHandle, ConnectionState};
pub use correlator::PendingResponse;
pub use error::{HandlerError, RpcError, RpcResult};
pub use event::{ConnectionEvent, ListenerEvent};
pub use listener::Listener;
pub use registry::{
    Handler, HandlerFuture, MethodRegistry, Params, ServiceBinding, ServiceMap, handler_fn,
    invoke, sync_fn,
};
pub use transport::{AsyncStream, Connector, TcpConnector, Transport};
