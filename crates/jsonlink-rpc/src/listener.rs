//! TCP listener that serves every accepted stream as a [`Connection`].
//!
//! Bindings exposed on the listener are replicated onto each connection it
//! accepts afterwards. Connections that already exist keep their own table.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{RwLock, Semaphore, broadcast};
use tracing::{debug, error, info};

use crate::config::ListenerConfig;
use crate::connection::{Connection, ConnectionHandle};
use crate::error::{RpcError, RpcResult};
use crate::event::ListenerEvent;
use crate::registry::ServiceBinding;
use crate::transport::Transport;

/// Accepts inbound connections.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// Bound socket.
    listener: TcpListener,
    /// Bindings applied to every accepted connection, in order.
    bindings: RwLock<Vec<ServiceBinding>>,
    /// Semaphore for limiting concurrent connections.
    connection_semaphore: Arc<Semaphore>,
    events: broadcast::Sender<ListenerEvent>,
}

impl Listener {
    /// Binds to the configured address.
    pub async fn bind(config: ListenerConfig) -> RpcResult<Self> {
        if config.max_connections == 0 {
            return Err(RpcError::config("max_connections must be at least 1"));
        }

        let listener = TcpListener::bind(config.bind.authority()).await?;
        info!(addr = %listener.local_addr()?, "Listening");

        let connection_semaphore = Arc::new(Semaphore::new(config.max_connections));
        let (events, _) = broadcast::channel(config.connection.event_capacity.max(1));

        Ok(Self {
            config,
            listener,
            bindings: RwLock::new(Vec::new()),
            connection_semaphore,
            events,
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> RpcResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Records a binding for connections accepted from now on.
    pub async fn expose(&self, binding: impl Into<ServiceBinding>) {
        let binding = binding.into();
        debug!(binding = ?binding, "Listener binding added");
        self.bindings.write().await.push(binding);
    }

    /// Subscribes to listener events.
    pub fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.events.subscribe()
    }

    /// Accepts a single connection and starts serving it.
    ///
    /// Waits for a free slot first when `max_connections` are open.
    pub async fn accept(&self) -> RpcResult<ConnectionHandle> {
        let permit = self
            .connection_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RpcError::Closed)?;

        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!(%peer, "Accepted new connection");

        let mut connection = Connection::from_transport(
            Transport::new(stream, peer.to_string()),
            self.config.connection.clone(),
        )
        .with_permit(permit);
        for binding in self.bindings.read().await.iter() {
            connection.expose(binding.clone());
        }

        let handle = connection.spawn();
        let _ = self.events.send(ListenerEvent::Connection {
            handle: handle.clone(),
            peer,
        });
        Ok(handle)
    }

    /// Runs the accept loop.
    ///
    /// Accept errors are logged and the loop keeps going.
    pub async fn run(&self) -> RpcResult<()> {
        loop {
            if let Err(e) = self.accept().await {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }

    /// Runs the accept loop until `shutdown` completes.
    pub async fn run_until_shutdown<S>(&self, shutdown: S) -> RpcResult<()>
    where
        S: Future<Output = ()> + Send,
    {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown => {
                info!("Shutdown signal received");
                Ok(())
            }
        }
    }
}
