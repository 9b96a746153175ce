//! Byte-stream transports and the reader/writer tasks bound to them.

use std::fmt;
use std::io;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use jsonlink_core::Endpoint;
use jsonlink_protocol::StreamDecoder;

use crate::connection::Internal;

const READ_CHUNK: usize = 8 * 1024;

/// Any bidirectional byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type BoxStream = Box<dyn AsyncStream>;

/// An established stream together with a printable peer description.
pub struct Transport {
    stream: BoxStream,
    peer: String,
}

impl Transport {
    /// Wraps a stream.
    pub fn new(stream: impl AsyncStream, peer: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            peer: peer.into(),
        }
    }

    /// Returns the peer description.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Opens transports for client connections.
pub trait Connector: Send + Sync + 'static {
    /// Opens a stream to `endpoint`.
    fn connect(&self, endpoint: Endpoint) -> BoxFuture<'static, io::Result<Transport>>;
}

/// TCP connector used by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, endpoint: Endpoint) -> BoxFuture<'static, io::Result<Transport>> {
        Box::pin(async move {
            let stream = TcpStream::connect(endpoint.authority()).await?;
            stream.set_nodelay(true)?;
            let peer = stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| endpoint.to_string());
            Ok(Transport::new(stream, peer))
        })
    }
}

impl<C: Connector> Connector for Arc<C> {
    fn connect(&self, endpoint: Endpoint) -> BoxFuture<'static, io::Result<Transport>> {
        (**self).connect(endpoint)
    }
}

/// A transport attached to a connection.
///
/// Dropping `writer` lets the writer task flush what is queued and then
/// half-close the stream.
#[derive(Debug)]
pub(crate) struct Link {
    pub generation: u64,
    pub peer: String,
    /// The reader saw end of stream.
    pub read_closed: bool,
    /// The writer flushed and shut its half down.
    pub write_closed: bool,
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
    reader_task: AbortHandle,
    writer_task: AbortHandle,
}

impl Link {
    /// Splits the transport and starts its reader and writer tasks.
    pub(crate) fn spawn(
        transport: Transport,
        generation: u64,
        max_message_size: usize,
        events: mpsc::UnboundedSender<Internal>,
    ) -> Self {
        let Transport { stream, peer } = transport;
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(read_loop(
            read_half,
            generation,
            StreamDecoder::with_max_message_size(max_message_size),
            events.clone(),
        ))
        .abort_handle();
        let writer_task = tokio::spawn(write_loop(write_half, generation, rx, events)).abort_handle();

        Self {
            generation,
            peer,
            read_closed: false,
            write_closed: false,
            writer: Some(writer),
            reader_task,
            writer_task,
        }
    }

    /// Queues bytes for writing. Returns false once the link stopped accepting.
    pub(crate) fn write(&self, bytes: Vec<u8>) -> bool {
        match &self.writer {
            Some(writer) => writer.send(bytes).is_ok(),
            None => false,
        }
    }

    /// A sender handlers can use to write their responses later.
    pub(crate) fn writer(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.writer.clone()
    }

    /// Stops accepting writes; the stream half-closes after the queue drains.
    pub(crate) fn finish(&mut self) {
        self.writer = None;
    }

    /// Whether [`finish`](Self::finish) was called.
    pub(crate) fn is_finishing(&self) -> bool {
        self.writer.is_none()
    }

    /// Tears both tasks down immediately.
    pub(crate) fn abort(&self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn read_loop(
    mut reader: ReadHalf<BoxStream>,
    generation: u64,
    mut decoder: StreamDecoder,
    events: mpsc::UnboundedSender<Internal>,
) {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                debug!(generation, "Remote finished sending");
                let _ = events.send(Internal::Eof { generation });
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(generation, error = %e, "Transport read failed");
                let _ = events.send(Internal::TransportError {
                    generation,
                    error: e,
                });
                return;
            }
        };

        trace!(generation, bytes = n, "Read chunk");
        decoder.feed(&chunk[..n]);

        loop {
            match decoder.next_message() {
                Ok(Some(message)) => {
                    if events
                        .send(Internal::Inbound {
                            generation,
                            message,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(generation, error = %error, "Undecodable input");
                    let _ = events.send(Internal::DecodeError { generation, error });
                    return;
                }
            }
        }
    }
}

async fn write_loop(
    mut writer: WriteHalf<BoxStream>,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<Internal>,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = write_chunk(&mut writer, &bytes).await {
            warn!(generation, error = %e, "Transport write failed");
            let _ = events.send(Internal::TransportError {
                generation,
                error: e,
            });
            return;
        }

        if rx.is_empty() {
            let _ = events.send(Internal::Drained { generation });
        }
    }

    debug!(generation, "Write side closed");
    if let Err(e) = writer.shutdown().await {
        debug!(generation, error = %e, "Shutdown of write half failed");
    }
    let _ = events.send(Internal::WriterClosed { generation });
}

async fn write_chunk(writer: &mut WriteHalf<BoxStream>, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}
