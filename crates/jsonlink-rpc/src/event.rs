//! Observable connection and listener events.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use jsonlink_protocol::{Notification, Request, Response};

use crate::connection::ConnectionHandle;
use crate::error::RpcError;

/// Events broadcast by a connection.
///
/// Observation only: nothing needs to listen for the connection to work.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A transport was attached.
    Connect { peer: String },
    /// A request arrived, before dispatch.
    Request(Request),
    /// A response arrived, before correlation.
    Response(Response),
    /// A notification arrived, before dispatch.
    Notification(Notification),
    /// Transport, decode, or unobserved call error.
    Error(Arc<RpcError>),
    /// A call saw no response within the call timeout.
    Timeout { method: String, params: Vec<Value> },
    /// A call completed.
    Time { method: String, elapsed: Duration },
    /// The transport is gone.
    Close,
    /// The remote side finished sending.
    End,
    /// Everything queued for writing has been flushed.
    Drain,
}

/// Events broadcast by a listener.
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    /// A connection was accepted and is being served.
    Connection {
        handle: ConnectionHandle,
        peer: SocketAddr,
    },
}
