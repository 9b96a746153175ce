//! The connection actor.
//!
//! A [`Connection`] owns one transport at a time, the method registry, the
//! pending-call table and the deferred-call queue. It runs as a single task:
//! [`ConnectionHandle`]s send it commands, and the reader, writer and timer
//! tasks report back over an internal channel, so none of that state is
//! shared or locked.
//!
//! # Example
//!
//! ```rust,no_run
//! use jsonlink_core::Endpoint;
//! use jsonlink_rpc::{Connection, ConnectionConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let handle = Connection::new(ConnectionConfig::default()).spawn();
//!     handle.connect(Endpoint::local(7800)).await?;
//!
//!     let sum = handle.call("math.add", vec![json!(3), json!(2)]).await?;
//!     println!("{sum}");
//!     Ok(())
//! }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, broadcast, mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use jsonlink_core::Endpoint;
use jsonlink_protocol::{
    METHOD_NOT_FOUND, Message, Notification, ProtocolError, Request, RequestId, Response,
    encode_message,
};

use crate::config::{ConnectionConfig, TimeoutPolicy};
use crate::correlator::{CallCorrelator, DeferredCall, PendingResponse, Reply};
use crate::error::{HandlerError, RpcError, RpcResult};
use crate::event::ConnectionEvent;
use crate::registry::{MethodRegistry, Params, ServiceBinding, start};
use crate::transport::{Connector, Link, TcpConnector, Transport};

const COMMAND_CAPACITY: usize = 64;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Reports from the reader, writer and timer tasks.
#[derive(Debug)]
pub(crate) enum Internal {
    Inbound {
        generation: u64,
        message: Message,
    },
    DecodeError {
        generation: u64,
        error: ProtocolError,
    },
    Eof {
        generation: u64,
    },
    TransportError {
        generation: u64,
        error: io::Error,
    },
    Drained {
        generation: u64,
    },
    WriterClosed {
        generation: u64,
    },
    Connected {
        attempt: u64,
        result: io::Result<Transport>,
    },
    CallTimeout {
        id: RequestId,
    },
    Reconnect,
}

enum Command {
    Connect {
        endpoint: Endpoint,
        reply: oneshot::Sender<RpcResult<()>>,
    },
    Call(DeferredCall),
    Notify(Notification),
    Send {
        message: Message,
        reply: oneshot::Sender<RpcResult<()>>,
    },
    Expose {
        binding: ServiceBinding,
        reply: oneshot::Sender<Vec<String>>,
    },
    End {
        reply: oneshot::Sender<RpcResult<()>>,
    },
}

/// Work queued while not connected, flushed in order on connect.
#[derive(Debug)]
enum Outgoing {
    Call(DeferredCall),
    Notify(Notification),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// A connection that has not been started yet.
///
/// Register methods with [`expose`](Self::expose), then start it with
/// [`spawn`](Self::spawn) or by awaiting [`run`](Self::run).
pub struct Connection {
    actor: Actor,
    commands: mpsc::Receiver<Command>,
    internal: mpsc::UnboundedReceiver<Internal>,
    handle: ConnectionHandle,
    initial: Option<Transport>,
}

impl Connection {
    /// Creates a client connection that dials over TCP.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_connector(config, TcpConnector)
    }

    /// Creates a client connection using a custom connector.
    pub fn with_connector(config: ConnectionConfig, connector: impl Connector) -> Self {
        Self::build(config, Role::Client, Arc::new(connector), None)
    }

    /// Wraps an already established transport.
    ///
    /// The connection starts connected and never reconnects on its own.
    pub fn from_transport(transport: Transport, config: ConnectionConfig) -> Self {
        let config = config.with_auto_reconnect(false);
        Self::build(config, Role::Server, Arc::new(TcpConnector), Some(transport))
    }

    fn build(
        config: ConnectionConfig,
        role: Role,
        connector: Arc<dyn Connector>,
        initial: Option<Transport>,
    ) -> Self {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let initial_state = if initial.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        let (state_tx, state_rx) = watch::channel(initial_state);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let handle = ConnectionHandle {
            commands: commands_tx,
            state: state_rx,
            events: events.clone(),
        };

        let actor = Actor {
            correlator: CallCorrelator::new(config.call_timeout),
            reconnect_armed: false,
            config,
            role,
            connector,
            endpoint: None,
            registry: MethodRegistry::new(),
            deferred: VecDeque::new(),
            link: None,
            generation: 0,
            attempt: 0,
            reconnect_timer: None,
            close_waiters: Vec::new(),
            detached: false,
            state: state_tx,
            events,
            internal: internal_tx,
            _permit: None,
        };

        Self {
            actor,
            commands,
            internal,
            handle,
            initial,
        }
    }

    /// Holds a listener slot until the connection task exits.
    pub(crate) fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.actor._permit = Some(permit);
        self
    }

    /// Registers methods before the connection starts.
    ///
    /// Returns the qualified names that were registered.
    pub fn expose(&mut self, binding: impl Into<ServiceBinding>) -> Vec<String> {
        self.actor.registry.register(&binding.into())
    }

    /// Returns a handle to the connection.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Subscribes to connection events before the connection starts.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.handle.subscribe()
    }

    /// Runs the connection on a new task and returns its handle.
    pub fn spawn(self) -> ConnectionHandle {
        let handle = self.handle();
        tokio::spawn(self.run());
        handle
    }

    /// Runs the connection until no transport is attached and, for client
    /// connections, every handle has been dropped.
    pub async fn run(self) {
        let Connection {
            mut actor,
            mut commands,
            mut internal,
            handle,
            initial,
        } = self;
        drop(handle);

        if let Some(transport) = initial {
            actor.attach(transport);
        }

        let mut commands_open = true;
        loop {
            tokio::select! {
                Some(event) = internal.recv() => actor.on_internal(event),
                command = commands.recv(), if commands_open => match command {
                    Some(command) => actor.on_command(command),
                    None => {
                        commands_open = false;
                        actor.on_detached();
                    }
                },
                else => break,
            }

            // Accepted connections are done once their transport is gone.
            if actor.is_idle() && (!commands_open || actor.role == Role::Server) {
                break;
            }
        }

        debug!(pending = actor.correlator.len(), "Connection task exiting");
        actor.shutdown();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.actor.role)
            .field("registry", &self.actor.registry)
            .finish_non_exhaustive()
    }
}

/// Cloneable handle used to drive a running [`Connection`].
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionHandle {
    async fn command(&self, command: Command) -> RpcResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RpcError::Closed)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> RpcResult<T> {
        let (tx, rx) = oneshot::channel();
        self.command(build(tx)).await?;
        rx.await.map_err(|_| RpcError::Closed)
    }

    /// Connects to `endpoint`, remembering it for reconnects.
    ///
    /// Returns once the attempt has started. Ignored while already
    /// connecting, connected or closing.
    pub async fn connect(&self, endpoint: impl Into<Endpoint>) -> RpcResult<()> {
        let endpoint = endpoint.into();
        self.request(|reply| Command::Connect { endpoint, reply })
            .await?
    }

    /// Waits until the connection is connected.
    pub async fn wait_connected(&self) -> RpcResult<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|state| *state == ConnectionState::Connected)
            .await
            .map(|_| ())
            .map_err(|_| RpcError::Closed)
    }

    /// Issues a call and returns its pending outcome.
    ///
    /// While not connected the call is queued and sent on the next connect.
    pub async fn start_call(
        &self,
        method: impl Into<String>,
        params: Vec<Value>,
    ) -> RpcResult<PendingResponse> {
        let method = checked_method(method)?;
        let (tx, rx) = oneshot::channel();
        let call = DeferredCall::new(method, params, Reply::Waiter(tx));
        self.command(Command::Call(call)).await?;
        Ok(PendingResponse::new(rx))
    }

    /// Calls a remote method and waits for its result.
    pub async fn call(&self, method: impl Into<String>, params: Vec<Value>) -> RpcResult<Value> {
        self.start_call(method, params).await?.await
    }

    /// Issues a call nobody waits for.
    ///
    /// Its failure, if any, is broadcast as [`ConnectionEvent::Error`].
    pub async fn call_detached(&self, method: impl Into<String>, params: Vec<Value>) -> RpcResult<()> {
        let method = checked_method(method)?;
        let call = DeferredCall::new(method, params, Reply::Detached);
        self.command(Command::Call(call)).await
    }

    /// Sends a notification, queueing it while not connected.
    pub async fn notify(&self, method: impl Into<String>, params: Vec<Value>) -> RpcResult<()> {
        let method = checked_method(method)?;
        self.command(Command::Notify(Notification::new(method, params)))
            .await
    }

    /// Registers methods on the running connection.
    pub async fn expose(&self, binding: impl Into<ServiceBinding>) -> RpcResult<Vec<String>> {
        let binding = binding.into();
        self.request(|reply| Command::Expose { binding, reply })
            .await
    }

    /// Writes a raw message on the current transport.
    pub async fn send(&self, message: impl Into<Message>) -> RpcResult<()> {
        let message = message.into();
        self.request(|reply| Command::Send { message, reply })
            .await?
    }

    /// Closes the connection for good.
    ///
    /// Fails with [`RpcError::NotConnected`] unless connected. Otherwise
    /// disarms reconnecting, half-closes the transport once queued writes are
    /// flushed, and returns when the transport is gone.
    pub async fn end(&self) -> RpcResult<()> {
        self.request(|reply| Command::End { reply }).await?
    }

    /// Returns the current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribes to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

fn checked_method(method: impl Into<String>) -> RpcResult<String> {
    let method = method.into();
    if method.trim().is_empty() {
        return Err(RpcError::InvalidMethod(method));
    }
    Ok(method)
}

fn encode<T: Serialize>(message: &T) -> Option<Vec<u8>> {
    match encode_message(message) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(error = %e, "Failed to encode outbound message");
            None
        }
    }
}

/// Writes the response for a finished inbound request.
fn reply(
    writer: &mpsc::UnboundedSender<Vec<u8>>,
    id: RequestId,
    method: &str,
    outcome: Result<Value, HandlerError>,
) {
    let response = match outcome {
        Ok(result) => Response::success(id, result),
        Err(e) => {
            debug!(id, %method, error = %e, "Handler failed");
            Response::failure(id, e.into_message())
        }
    };
    if let Some(bytes) = encode(&response) {
        // The transport may be gone by now.
        let _ = writer.send(bytes);
    }
}

fn log_notification(method: &str, outcome: Result<Value, HandlerError>) {
    if let Err(e) = outcome {
        debug!(%method, error = %e, "Notification handler failed");
    }
}

struct Actor {
    config: ConnectionConfig,
    role: Role,
    connector: Arc<dyn Connector>,
    endpoint: Option<Endpoint>,
    registry: MethodRegistry,
    correlator: CallCorrelator,
    deferred: VecDeque<Outgoing>,
    link: Option<Link>,
    generation: u64,
    attempt: u64,
    reconnect_armed: bool,
    reconnect_timer: Option<AbortHandle>,
    close_waiters: Vec<oneshot::Sender<RpcResult<()>>>,
    /// Every handle is gone.
    detached: bool,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    internal: mpsc::UnboundedSender<Internal>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Actor {
    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: RpcError) {
        self.emit(ConnectionEvent::Error(Arc::new(error)));
    }

    fn is_current(&self, generation: u64) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.generation == generation)
    }

    fn is_idle(&self) -> bool {
        self.link.is_none() && self.current_state() == ConnectionState::Disconnected
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { endpoint, reply } => {
                let _ = reply.send(self.connect(endpoint));
            }
            Command::Call(call) => self.dispatch(Outgoing::Call(call)),
            Command::Notify(notification) => self.dispatch(Outgoing::Notify(notification)),
            Command::Send { message, reply } => {
                let _ = reply.send(self.send(&message));
            }
            Command::Expose { binding, reply } => {
                let names = self.registry.register(&binding);
                debug!(methods = ?names, "Exposed methods");
                let _ = reply.send(names);
            }
            Command::End { reply } => self.end(reply),
        }
    }

    fn on_internal(&mut self, event: Internal) {
        match event {
            Internal::Inbound {
                generation,
                message,
            } => {
                if self.is_current(generation) {
                    self.on_message(message);
                }
            }
            Internal::DecodeError { generation, error } => {
                if self.is_current(generation) {
                    warn!(error = %error, "Dropping transport after undecodable input");
                    self.close_transport();
                    self.emit_error(RpcError::Protocol(error));
                }
            }
            Internal::Eof { generation } => {
                if let Some(link) = self.link.as_mut().filter(|l| l.generation == generation) {
                    link.read_closed = true;
                    link.finish();
                    let done = link.write_closed;
                    self.emit(ConnectionEvent::End);
                    if done {
                        self.close_transport();
                    }
                }
            }
            Internal::WriterClosed { generation } => {
                if let Some(link) = self.link.as_mut().filter(|l| l.generation == generation) {
                    link.write_closed = true;
                    if link.read_closed {
                        self.close_transport();
                    }
                }
            }
            Internal::TransportError { generation, error } => {
                if self.is_current(generation) {
                    self.emit_error(RpcError::Io(error));
                    self.close_transport();
                }
            }
            Internal::Drained { generation } => {
                if self.is_current(generation) {
                    self.emit(ConnectionEvent::Drain);
                }
            }
            Internal::Connected { attempt, result } => self.on_connect_result(attempt, result),
            Internal::CallTimeout { id } => self.on_call_timeout(id),
            Internal::Reconnect => {
                self.reconnect_timer = None;
                if self.reconnect_armed && self.current_state() == ConnectionState::Disconnected {
                    self.start_connect();
                }
            }
        }
    }

    fn on_detached(&mut self) {
        self.detached = true;
        self.disarm_reconnect();
        if self.role == Role::Client
            && let Some(link) = self.link.as_mut()
        {
            debug!("All handles dropped, closing");
            link.finish();
            self.set_state(ConnectionState::Closing);
        }
    }

    fn connect(&mut self, endpoint: Endpoint) -> RpcResult<()> {
        let state = self.current_state();
        if state != ConnectionState::Disconnected {
            debug!(%endpoint, %state, "Connect ignored");
            return Ok(());
        }

        self.endpoint = Some(endpoint);
        self.reconnect_armed = self.role == Role::Client && self.config.auto_reconnect;
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.start_connect();
        Ok(())
    }

    fn start_connect(&mut self) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };

        self.attempt += 1;
        let attempt = self.attempt;
        self.set_state(ConnectionState::Connecting);
        info!(%endpoint, attempt, "Connecting");

        let connector = Arc::clone(&self.connector);
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = connector.connect(endpoint).await;
            let _ = internal.send(Internal::Connected { attempt, result });
        });
    }

    fn on_connect_result(&mut self, attempt: u64, result: io::Result<Transport>) {
        if attempt != self.attempt || self.current_state() != ConnectionState::Connecting {
            debug!(attempt, "Ignoring stale connect result");
            return;
        }

        match result {
            Ok(transport) if self.detached => {
                debug!(peer = %transport.peer(), "Dropping transport, no handles left");
                self.set_state(ConnectionState::Disconnected);
            }
            Ok(transport) => self.attach(transport),
            Err(e) => {
                warn!(error = %e, "Connect failed");
                self.set_state(ConnectionState::Disconnected);
                self.emit_error(RpcError::Io(e));
                self.schedule_reconnect();
            }
        }
    }

    fn attach(&mut self, transport: Transport) {
        self.generation += 1;
        let link = Link::spawn(
            transport,
            self.generation,
            self.config.max_message_size,
            self.internal.clone(),
        );
        let peer = link.peer.clone();
        self.link = Some(link);
        self.set_state(ConnectionState::Connected);
        info!(%peer, generation = self.generation, "Connected");
        self.emit(ConnectionEvent::Connect { peer });

        let queued = std::mem::take(&mut self.deferred);
        if !queued.is_empty() {
            debug!(count = queued.len(), "Flushing deferred calls");
        }
        for outgoing in queued {
            self.dispatch(outgoing);
        }
    }

    fn dispatch(&mut self, outgoing: Outgoing) {
        let writable = self.current_state() == ConnectionState::Connected
            && self.link.as_ref().is_some_and(|link| !link.is_finishing());
        if !writable {
            self.deferred.push_back(outgoing);
            return;
        }

        match outgoing {
            Outgoing::Call(call) => {
                let request = self.correlator.issue(call, &self.internal);
                debug!(id = request.id, method = %request.method, "Sending request");
                self.write(&request);
            }
            Outgoing::Notify(notification) => {
                debug!(method = %notification.method, "Sending notification");
                self.write(&notification);
            }
        }
    }

    fn write<T: Serialize>(&self, message: &T) -> bool {
        let Some(link) = self.link.as_ref() else {
            return false;
        };
        match encode(message) {
            Some(bytes) => link.write(bytes),
            None => false,
        }
    }

    fn send(&self, message: &Message) -> RpcResult<()> {
        let link = self.link.as_ref().ok_or(RpcError::NotConnected)?;
        let bytes = encode_message(message)?;
        if link.write(bytes) {
            Ok(())
        } else {
            Err(RpcError::NotConnected)
        }
    }

    fn end(&mut self, reply: oneshot::Sender<RpcResult<()>>) {
        if self.current_state() != ConnectionState::Connected {
            let _ = reply.send(Err(RpcError::NotConnected));
            return;
        }

        self.disarm_reconnect();
        self.set_state(ConnectionState::Closing);
        self.close_waiters.push(reply);
        if let Some(link) = self.link.as_mut() {
            info!(peer = %link.peer, "Ending connection");
            link.finish();
            if link.read_closed && link.write_closed {
                self.close_transport();
            }
        }
    }

    fn disarm_reconnect(&mut self) {
        self.reconnect_armed = false;
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    fn on_message(&mut self, message: Message) {
        match message {
            Message::Response(response) => {
                self.emit(ConnectionEvent::Response(response.clone()));
                self.on_response(response);
            }
            Message::Request(request) => {
                self.emit(ConnectionEvent::Request(request.clone()));
                self.on_request(request);
            }
            Message::Notification(notification) => {
                self.emit(ConnectionEvent::Notification(notification.clone()));
                self.on_notification(notification);
            }
            Message::Orphan(value) => {
                debug!(%value, "Dropping response without a usable id");
            }
        }
    }

    fn on_response(&mut self, response: Response) {
        let id = response.id;
        let Some((call, outcome)) = self.correlator.resolve(response) else {
            debug!(id, "Dropping response for unknown call");
            return;
        };

        let elapsed = call.elapsed();
        debug!(id, method = %call.method, ?elapsed, "Call completed");
        self.emit(ConnectionEvent::Time {
            method: call.method,
            elapsed,
        });
        if let Some(error) = call.reply.deliver(outcome) {
            self.emit_error(error);
        }
    }

    fn on_request(&mut self, request: Request) {
        let Request { id, method, params } = request;
        let Some(writer) = self.link.as_ref().and_then(Link::writer) else {
            warn!(id, %method, "Request arrived after end, no reply will be sent");
            return;
        };

        let Some(handler) = self.registry.get(&method) else {
            debug!(id, %method, "Method not found");
            if let Some(bytes) = encode(&Response::failure(id, METHOD_NOT_FOUND)) {
                let _ = writer.send(bytes);
            }
            return;
        };

        let mut pending = start(Some(handler), Params::new(params));
        if let Some(outcome) = (&mut pending).now_or_never() {
            reply(&writer, id, &method, outcome);
            return;
        }
        tokio::spawn(async move {
            let outcome = pending.await;
            reply(&writer, id, &method, outcome);
        });
    }

    fn on_notification(&mut self, notification: Notification) {
        let Notification { method, params } = notification;
        let mut pending = start(self.registry.get(&method), Params::new(params));
        if let Some(outcome) = (&mut pending).now_or_never() {
            log_notification(&method, outcome);
            return;
        }
        tokio::spawn(async move {
            log_notification(&method, pending.await);
        });
    }

    fn on_call_timeout(&mut self, id: RequestId) {
        let Some(call) = self.correlator.get(id) else {
            return;
        };

        if self.current_state() != ConnectionState::Connected {
            if let Some(call) = self.correlator.remove(id) {
                debug!(id, method = %call.method, "Call timed out while disconnected, requeueing");
                self.deferred.push_back(Outgoing::Call(call.into_deferred()));
            }
            return;
        }

        warn!(id, method = %call.method, "Call timed out");
        self.emit(ConnectionEvent::Timeout {
            method: call.method.clone(),
            params: call.params.clone(),
        });

        if self.config.timeout_policy == TimeoutPolicy::Fail
            && let Some(call) = self.correlator.remove(id)
        {
            let elapsed = call.elapsed();
            self.emit(ConnectionEvent::Time {
                method: call.method.clone(),
                elapsed,
            });
            let error = RpcError::Timeout {
                elapsed,
                method: call.method,
            };
            if let Some(error) = call.reply.deliver(Err(error)) {
                self.emit_error(error);
            }
        }
    }

    fn close_transport(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        info!(peer = %link.peer, generation = link.generation, "Transport closed");
        drop(link);

        let was_closing = self.current_state() == ConnectionState::Closing;
        self.set_state(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::Close);
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        if !was_closing {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        if !self.reconnect_armed || self.role != Role::Client || self.detached {
            return;
        }
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }

        let delay = self.config.reconnect_timeout;
        debug!(?delay, "Scheduling reconnect");
        let internal = self.internal.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(Internal::Reconnect);
        });
        self.reconnect_timer = Some(timer.abort_handle());
    }

    fn shutdown(&mut self) {
        self.disarm_reconnect();
        self.correlator.abort_timers();
        self.link = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures_util::future::BoxFuture;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use crate::config::DEFAULT_PORT;
    use crate::error::HandlerError;
    use crate::registry::{ServiceMap, handler_fn, sync_fn};

    const WAIT: Duration = Duration::from_secs(2);

    /// Hands the far end of an in-memory pipe to the test for every connect.
    struct PipeConnector {
        far_ends: mpsc::UnboundedSender<DuplexStream>,
        attempts: AtomicUsize,
        refusals: AtomicUsize,
    }

    impl PipeConnector {
        fn new(refusals: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
            let (far_ends, rx) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                far_ends,
                attempts: AtomicUsize::new(0),
                refusals: AtomicUsize::new(refusals),
            });
            (connector, rx)
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl Connector for PipeConnector {
        fn connect(&self, _endpoint: Endpoint) -> BoxFuture<'static, io::Result<Transport>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let refused = self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let result = if refused {
                Err(io::Error::from(io::ErrorKind::ConnectionRefused))
            } else {
                let (near, far) = tokio::io::duplex(4096);
                let _ = self.far_ends.send(far);
                Ok(Transport::new(near, "pipe"))
            };
            Box::pin(async move { result })
        }
    }

    fn demo_services() -> ServiceMap {
        ServiceMap::new()
            .method("echo", sync_fn(|params| params.get::<Value>(0)))
            .method(
                "add",
                sync_fn(|params| Ok(json!(params.get::<i64>(0)? + params.get::<i64>(1)?))),
            )
            .method(
                "fail",
                sync_fn(|_| Err("something went wrong".into())),
            )
    }

    fn served() -> (ConnectionHandle, DuplexStream) {
        let (local, remote) = tokio::io::duplex(4096);
        let mut connection =
            Connection::from_transport(Transport::new(local, "test"), ConnectionConfig::default());
        connection.expose(demo_services());
        (connection.spawn(), remote)
    }

    async fn expect_bytes(stream: &mut DuplexStream, expected: &str) {
        let mut buf = vec![0u8; expected.len()];
        tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
            .await
            .expect("bytes in time")
            .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), expected);
    }

    async fn next_event(
        events: &mut broadcast::Receiver<ConnectionEvent>,
        wanted: impl Fn(&ConnectionEvent) -> bool,
    ) -> ConnectionEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = events.recv().await.unwrap();
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event in time")
    }

    async fn connected_client(
        config: ConnectionConfig,
    ) -> (ConnectionHandle, DuplexStream, Arc<PipeConnector>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (connector, mut far_ends) = PipeConnector::new(0);
        let handle = Connection::with_connector(config, connector.clone()).spawn();
        handle.connect(Endpoint::local(DEFAULT_PORT)).await.unwrap();
        let far = far_ends.recv().await.unwrap();
        handle.wait_connected().await.unwrap();
        (handle, far, connector, far_ends)
    }

    #[tokio::test]
    async fn echo_request_gets_exact_response() {
        let (_handle, mut remote) = served();
        remote
            .write_all(br#"{"id":1,"method":"echo","params":["Hello JSON-RPC"]}"#)
            .await
            .unwrap();
        expect_bytes(&mut remote, r#"{"id":1,"result":"Hello JSON-RPC","error":null}"#).await;
    }

    #[tokio::test]
    async fn add_request_gets_sum() {
        let (_handle, mut remote) = served();
        remote
            .write_all(br#"{"id":1,"method":"add","params":[3,2]}"#)
            .await
            .unwrap();
        expect_bytes(&mut remote, r#"{"id":1,"result":5,"error":null}"#).await;
    }

    #[tokio::test]
    async fn unknown_method_is_reported() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let _handle =
            Connection::from_transport(Transport::new(local, "test"), ConnectionConfig::default())
                .spawn();

        remote
            .write_all(br#"{"id":1,"method":"echo","params":["Hello JSON-RPC"]}"#)
            .await
            .unwrap();
        expect_bytes(&mut remote, r#"{"id":1,"result":null,"error":"Method Not Found"}"#).await;
    }

    #[tokio::test]
    async fn handler_error_is_reported() {
        let (_handle, mut remote) = served();
        remote
            .write_all(br#"{"id":1,"method":"fail","params":[]}"#)
            .await
            .unwrap();
        expect_bytes(
            &mut remote,
            r#"{"id":1,"result":null,"error":"something went wrong"}"#,
        )
        .await;
    }

    #[tokio::test]
    async fn notifications_never_write() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let (local, mut remote) = tokio::io::duplex(4096);
        let mut connection =
            Connection::from_transport(Transport::new(local, "test"), ConnectionConfig::default());
        connection.expose(demo_services());
        connection.expose(ServiceBinding::function(
            "log",
            sync_fn(move |params| {
                let _ = seen_tx.send(params.into_inner());
                Ok(json!("ignored"))
            }),
        ));
        let _handle = connection.spawn();

        remote
            .write_all(br#"{"id":null,"method":"log","params":["a"]}"#)
            .await
            .unwrap();
        let seen = tokio::time::timeout(WAIT, seen_rx.recv()).await.unwrap();
        assert_eq!(seen, Some(vec![json!("a")]));

        remote
            .write_all(br#"{"method":"fail","params":[]}{"method":"missing"}"#)
            .await
            .unwrap();
        remote
            .write_all(br#"{"id":9,"method":"echo","params":["after"]}"#)
            .await
            .unwrap();

        // The first bytes written are the echo response.
        expect_bytes(&mut remote, r#"{"id":9,"result":"after","error":null}"#).await;
    }

    #[tokio::test]
    async fn garbage_input_destroys_transport_once() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let connection =
            Connection::from_transport(Transport::new(local, "test"), ConnectionConfig::default());
        let mut events = connection.subscribe();
        let handle = connection.spawn();

        remote.write_all(b"ABCP").await.unwrap();

        next_event(&mut events, |e| matches!(e, ConnectionEvent::Close)).await;
        let error = next_event(&mut events, |e| matches!(e, ConnectionEvent::Error(_))).await;
        let ConnectionEvent::Error(error) = error else {
            unreachable!()
        };
        assert!(matches!(*error, RpcError::Protocol(_)));

        let mut rest = Vec::new();
        tokio::time::timeout(WAIT, remote.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut extra_errors = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ConnectionEvent::Error(_)) {
                extra_errors += 1;
            }
        }
        assert_eq!(extra_errors, 0);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn queued_calls_flush_in_order() {
        let (connector, mut far_ends) = PipeConnector::new(0);
        let handle = Connection::with_connector(ConnectionConfig::default(), connector).spawn();

        let first = handle.start_call("a", vec![json!(1)]).await.unwrap();
        let second = handle.start_call("b", vec![]).await.unwrap();
        handle.notify("note", vec![json!(true)]).await.unwrap();
        let third = handle.start_call("c", vec![json!("x")]).await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Disconnected);

        handle.connect(Endpoint::local(DEFAULT_PORT)).await.unwrap();
        let mut far = far_ends.recv().await.unwrap();

        expect_bytes(
            &mut far,
            concat!(
                r#"{"id":1,"method":"a","params":[1]}"#,
                r#"{"id":2,"method":"b","params":[]}"#,
                r#"{"id":null,"method":"note","params":[true]}"#,
                r#"{"id":3,"method":"c","params":["x"]}"#,
            ),
        )
        .await;

        far.write_all(
            concat!(
                r#"{"id":3,"result":"third","error":null}"#,
                r#"{"id":1,"result":"first","error":null}"#,
                r#"{"id":2,"result":"second","error":null}"#,
            )
            .as_bytes(),
        )
        .await
        .unwrap();

        assert_eq!(third.await.unwrap(), json!("third"));
        assert_eq!(first.await.unwrap(), json!("first"));
        assert_eq!(second.await.unwrap(), json!("second"));

        // Nothing is sent twice.
        handle.call_detached("d", vec![]).await.unwrap();
        expect_bytes(&mut far, r#"{"id":4,"method":"d","params":[]}"#).await;
    }

    #[tokio::test]
    async fn empty_method_is_rejected() {
        let handle = Connection::new(ConnectionConfig::default()).spawn();
        assert!(matches!(
            handle.call("", vec![]).await,
            Err(RpcError::InvalidMethod(_))
        ));
        assert!(matches!(
            handle.notify(" ", vec![]).await,
            Err(RpcError::InvalidMethod(_))
        ));
    }

    #[tokio::test]
    async fn remote_error_carries_call_details() {
        let (handle, mut far, _, _) = connected_client(ConnectionConfig::default()).await;
        let mut events = handle.subscribe();

        let pending = handle
            .start_call("math.div", vec![json!(1), json!(0)])
            .await
            .unwrap();
        expect_bytes(&mut far, r#"{"id":1,"method":"math.div","params":[1,0]}"#).await;
        far.write_all(br#"{"id":1,"result":null,"error":"division by zero"}"#)
            .await
            .unwrap();

        match pending.await {
            Err(RpcError::Remote {
                message,
                method,
                params,
            }) => {
                assert_eq!(message, "division by zero");
                assert_eq!(method, "math.div");
                assert_eq!(params, vec![json!(1), json!(0)]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let time = next_event(&mut events, |e| matches!(e, ConnectionEvent::Time { .. })).await;
        let ConnectionEvent::Time { method, .. } = time else {
            unreachable!()
        };
        assert_eq!(method, "math.div");
    }

    #[tokio::test]
    async fn detached_call_errors_become_events() {
        let (handle, mut far, _, _) = connected_client(ConnectionConfig::default()).await;
        let mut events = handle.subscribe();

        handle.call_detached("boom", vec![]).await.unwrap();
        expect_bytes(&mut far, r#"{"id":1,"method":"boom","params":[]}"#).await;
        far.write_all(br#"{"id":1,"result":null,"error":"nope"}"#)
            .await
            .unwrap();

        let event = next_event(&mut events, |e| matches!(e, ConnectionEvent::Error(_))).await;
        let ConnectionEvent::Error(error) = event else {
            unreachable!()
        };
        assert!(error.is_remote());
        assert_eq!(error.to_string(), "nope");
    }

    #[tokio::test]
    async fn unknown_response_ids_are_dropped() {
        let (handle, mut far, _, _) = connected_client(ConnectionConfig::default()).await;

        far.write_all(br#"{"id":77,"result":1,"error":null}"#)
            .await
            .unwrap();
        let pending = handle.start_call("a", vec![]).await.unwrap();
        expect_bytes(&mut far, r#"{"id":1,"method":"a","params":[]}"#).await;
        far.write_all(br#"{"id":1,"result":"ok","error":null}"#)
            .await
            .unwrap();

        assert_eq!(pending.await.unwrap(), json!("ok"));
        assert_eq!(handle.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn reconnects_after_remote_close() {
        let config = ConnectionConfig::default().with_reconnect_timeout(Duration::from_millis(20));
        let (handle, far, connector, mut far_ends) = connected_client(config).await;
        let mut events = handle.subscribe();

        drop(far);
        next_event(&mut events, |e| matches!(e, ConnectionEvent::End)).await;
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Close)).await;

        let mut far = tokio::time::timeout(WAIT, far_ends.recv())
            .await
            .unwrap()
            .unwrap();
        handle.wait_connected().await.unwrap();
        assert_eq!(connector.attempts(), 2);

        let pending = handle.start_call("again", vec![]).await.unwrap();
        expect_bytes(&mut far, r#"{"id":1,"method":"again","params":[]}"#).await;
        far.write_all(br#"{"id":1,"result":true,"error":null}"#)
            .await
            .unwrap();
        assert_eq!(pending.await.unwrap(), json!(true));
    }

    #[tokio::test]
    async fn failed_connects_keep_retrying() {
        let config = ConnectionConfig::default().with_reconnect_timeout(Duration::from_millis(10));
        let (connector, mut far_ends) = PipeConnector::new(2);
        let connection = Connection::with_connector(config, connector.clone());
        let mut events = connection.subscribe();
        let handle = connection.spawn();

        handle.connect(Endpoint::local(DEFAULT_PORT)).await.unwrap();
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Error(_))).await;

        let _far = tokio::time::timeout(WAIT, far_ends.recv())
            .await
            .unwrap()
            .unwrap();
        handle.wait_connected().await.unwrap();
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test]
    async fn connect_while_connected_is_ignored() {
        let (handle, _far, connector, _) = connected_client(ConnectionConfig::default()).await;
        handle.connect(Endpoint::local(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(handle.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn end_requires_connection() {
        let handle = Connection::new(ConnectionConfig::default()).spawn();
        assert!(matches!(handle.end().await, Err(RpcError::NotConnected)));
        assert!(matches!(
            handle.send(Notification::new("x", vec![])).await,
            Err(RpcError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn end_closes_without_reconnecting() {
        let config = ConnectionConfig::default().with_reconnect_timeout(Duration::from_millis(10));
        let (handle, mut far, connector, _) = connected_client(config).await;

        let ending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.end().await }
        });

        // The client half-closes, then the far side finishes too.
        let mut rest = Vec::new();
        tokio::time::timeout(WAIT, far.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
        drop(far);

        tokio::time::timeout(WAIT, ending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn timeout_notifies_and_keeps_waiting() {
        let config = ConnectionConfig::default().with_call_timeout(Duration::from_millis(30));
        let (handle, mut far, _, _) = connected_client(config).await;
        let mut events = handle.subscribe();

        let pending = handle.start_call("slow", vec![json!(1)]).await.unwrap();
        expect_bytes(&mut far, r#"{"id":1,"method":"slow","params":[1]}"#).await;

        let event = next_event(&mut events, |e| matches!(e, ConnectionEvent::Timeout { .. })).await;
        let ConnectionEvent::Timeout { method, params } = event else {
            unreachable!()
        };
        assert_eq!(method, "slow");
        assert_eq!(params, vec![json!(1)]);

        far.write_all(br#"{"id":1,"result":"late","error":null}"#)
            .await
            .unwrap();
        assert_eq!(pending.await.unwrap(), json!("late"));
    }

    #[tokio::test]
    async fn timeout_fail_policy_releases_call() {
        let config = ConnectionConfig::default()
            .with_call_timeout(Duration::from_millis(30))
            .with_timeout_policy(TimeoutPolicy::Fail);
        let (handle, mut far, _, _) = connected_client(config).await;
        let mut events = handle.subscribe();

        let pending = handle.start_call("slow", vec![]).await.unwrap();
        expect_bytes(&mut far, r#"{"id":1,"method":"slow","params":[]}"#).await;

        match tokio::time::timeout(WAIT, pending).await.unwrap() {
            Err(RpcError::Timeout { method, .. }) => assert_eq!(method, "slow"),
            other => panic!("unexpected outcome: {other:?}"),
        }

        // The timing event is published before the caller is released.
        let mut timed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::Time { method, .. } = event {
                timed.push(method);
            }
        }
        assert_eq!(timed, vec!["slow".to_string()]);
    }

    #[tokio::test]
    async fn timeout_while_disconnected_requeues() {
        let config = ConnectionConfig::default()
            .with_call_timeout(Duration::from_millis(200))
            .with_reconnect_timeout(Duration::from_millis(600));
        let (handle, mut far, _, mut far_ends) = connected_client(config).await;
        let mut events = handle.subscribe();

        let pending = handle.start_call("a", vec![]).await.unwrap();
        expect_bytes(&mut far, r#"{"id":1,"method":"a","params":[]}"#).await;
        drop(far);
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Close)).await;

        let mut far = tokio::time::timeout(WAIT, far_ends.recv())
            .await
            .unwrap()
            .unwrap();
        expect_bytes(&mut far, r#"{"id":2,"method":"a","params":[]}"#).await;
        far.write_all(br#"{"id":2,"result":"retried","error":null}"#)
            .await
            .unwrap();
        assert_eq!(pending.await.unwrap(), json!("retried"));
    }

    #[tokio::test]
    async fn both_sides_serve_and_call() {
        let (a, b) = tokio::io::duplex(4096);

        let mut left = Connection::from_transport(Transport::new(a, "b"), ConnectionConfig::default());
        left.expose(ServiceBinding::group(
            "left",
            ServiceMap::new().method("whoami", sync_fn(|_| Ok(json!("left")))),
        ));
        let mut right =
            Connection::from_transport(Transport::new(b, "a"), ConnectionConfig::default());
        right.expose(ServiceBinding::group(
            "right",
            ServiceMap::new().method(
                "whoami",
                handler_fn(|_| async { Ok::<_, HandlerError>(json!("right")) }),
            ),
        ));

        let left = left.spawn();
        let right = right.spawn();

        assert_eq!(left.call("right.whoami", vec![]).await.unwrap(), json!("right"));
        assert_eq!(right.call("left.whoami", vec![]).await.unwrap(), json!("left"));
    }

    #[tokio::test]
    async fn expose_on_running_connection() {
        let (handle, mut remote) = served();
        let names = handle
            .expose(ServiceBinding::function("late", sync_fn(|_| Ok(json!(1)))))
            .await
            .unwrap();
        assert_eq!(names, vec!["late"]);

        remote
            .write_all(br#"{"id":4,"method":"late","params":[]}"#)
            .await
            .unwrap();
        expect_bytes(&mut remote, r#"{"id":4,"result":1,"error":null}"#).await;
    }

    #[tokio::test]
    async fn panicking_handler_reports_message() {
        let (handle, mut remote) = served();
        handle
            .expose(ServiceBinding::function("explode", sync_fn(|_| panic!("kaboom"))))
            .await
            .unwrap();

        remote
            .write_all(br#"{"id":2,"method":"explode","params":[]}"#)
            .await
            .unwrap();
        expect_bytes(&mut remote, r#"{"id":2,"result":null,"error":"kaboom"}"#).await;
    }

    #[tokio::test]
    async fn requests_after_end_are_not_handled() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let (local, mut remote) = tokio::io::duplex(4096);
        let mut connection =
            Connection::from_transport(Transport::new(local, "test"), ConnectionConfig::default());
        connection.expose(ServiceBinding::function(
            "log",
            sync_fn(move |params| {
                let _ = seen_tx.send(params.into_inner());
                Ok(Value::Null)
            }),
        ));
        let handle = connection.spawn();

        let ending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.end().await }
        });

        let mut rest = Vec::new();
        tokio::time::timeout(WAIT, remote.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());

        remote
            .write_all(br#"{"id":1,"method":"log","params":["late"]}"#)
            .await
            .unwrap();
        remote.shutdown().await.unwrap();

        tokio::time::timeout(WAIT, ending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(seen_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn response_without_id_is_dropped() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let mut connection =
            Connection::from_transport(Transport::new(local, "test"), ConnectionConfig::default());
        connection.expose(demo_services());
        let mut events = connection.subscribe();
        let handle = connection.spawn();

        remote
            .write_all(br#"{"id":null,"result":null,"error":"Parse error"}"#)
            .await
            .unwrap();
        remote
            .write_all(br#"{"id":3,"method":"echo","params":["still here"]}"#)
            .await
            .unwrap();
        expect_bytes(&mut remote, r#"{"id":3,"result":"still here","error":null}"#).await;

        assert_eq!(handle.state(), ConnectionState::Connected);
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, ConnectionEvent::Error(_) | ConnectionEvent::Close),
                "unexpected event: {event:?}"
            );
        }
    }

    #[tokio::test]
    async fn client_reports_connect_drain_and_response() {
        let (connector, mut far_ends) = PipeConnector::new(0);
        let connection = Connection::with_connector(ConnectionConfig::default(), connector);
        let mut events = connection.subscribe();
        let handle = connection.spawn();

        handle.connect(Endpoint::local(DEFAULT_PORT)).await.unwrap();
        let mut far = far_ends.recv().await.unwrap();
        let connect = next_event(&mut events, |e| matches!(e, ConnectionEvent::Connect { .. })).await;
        assert!(matches!(connect, ConnectionEvent::Connect { peer } if peer == "pipe"));

        let pending = handle.start_call("echo", vec![json!(1)]).await.unwrap();
        expect_bytes(&mut far, r#"{"id":1,"method":"echo","params":[1]}"#).await;
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Drain)).await;

        far.write_all(br#"{"id":1,"result":1,"error":null}"#)
            .await
            .unwrap();
        let response = next_event(&mut events, |e| matches!(e, ConnectionEvent::Response(_))).await;
        assert!(matches!(
            response,
            ConnectionEvent::Response(r) if r == Response::success(1, json!(1))
        ));
        assert_eq!(tokio::time::timeout(WAIT, pending).await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn inbound_events_precede_handlers() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let mut connection =
            Connection::from_transport(Transport::new(local, "test"), ConnectionConfig::default());
        let observed = Arc::new(std::sync::Mutex::new(connection.subscribe()));
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        connection.expose(ServiceBinding::function(
            "record",
            sync_fn(move |params| {
                let mut events = observed.lock().unwrap();
                let mut before = Vec::new();
                while let Ok(event) = events.try_recv() {
                    before.push(event);
                }
                let _ = seen_tx.send(before);
                params.get::<Value>(0)
            }),
        ));
        let _handle = connection.spawn();

        remote
            .write_all(br#"{"id":1,"method":"record","params":["a"]}"#)
            .await
            .unwrap();
        expect_bytes(&mut remote, r#"{"id":1,"result":"a","error":null}"#).await;
        let before = tokio::time::timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
        assert!(before.iter().any(|e| matches!(
            e,
            ConnectionEvent::Request(r) if *r == Request::new(1, "record", vec![json!("a")])
        )));

        remote
            .write_all(br#"{"id":null,"method":"record","params":["b"]}"#)
            .await
            .unwrap();
        let before = tokio::time::timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
        assert!(before.iter().any(|e| matches!(
            e,
            ConnectionEvent::Notification(n) if *n == Notification::new("record", vec![json!("b")])
        )));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn inbound_messages_run_in_arrival_order() {
        const COUNT: u64 = 2000;

        let (local, mut remote) = tokio::io::duplex(4096);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let mut connection =
            Connection::from_transport(Transport::new(local, "test"), ConnectionConfig::default());
        connection.expose(ServiceBinding::function(
            "log",
            sync_fn(move |params| {
                let _ = seen_tx.send(params.get::<u64>(0)?);
                Ok(Value::Null)
            }),
        ));
        let _handle = connection.spawn();

        let mut batch = String::new();
        for i in 0..COUNT {
            batch.push_str(&format!(r#"{{"id":null,"method":"log","params":[{i}]}}"#));
        }
        remote.write_all(batch.as_bytes()).await.unwrap();

        let mut seen = Vec::new();
        while seen.len() < COUNT as usize {
            let n = tokio::time::timeout(WAIT, seen_rx.recv())
                .await
                .expect("handler ran in time")
                .unwrap();
            seen.push(n);
        }
        assert_eq!(seen, (0..COUNT).collect::<Vec<_>>());
    }
}
