//! Incremental decoding of concatenated JSON objects.
//!
//! Messages travel back to back on the byte stream with no length prefix and
//! no delimiter:
//!
//! ```text
//! {"id":1,"method":"ping","params":[]}{"id":2,"method":"ping","params":[]}
//! ```
//!
//! Bytes arrive in arbitrary chunks, so a [`StreamDecoder`] buffers whatever
//! has been fed so far and hands out each value once it is complete.

use serde::Serialize;
use serde_json::Value;

use crate::MAX_MESSAGE_SIZE;
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::Message;

/// Encodes a message as JSON bytes ready for the wire.
///
/// # Example
///
/// ```rust
/// use jsonlink_protocol::{encode_message, Response};
///
/// let bytes = encode_message(&Response::success(1, serde_json::json!("pong"))).unwrap();
/// assert_eq!(bytes, br#"{"id":1,"result":"pong","error":null}"#);
/// ```
pub fn encode_message<T: Serialize>(message: &T) -> ProtocolResult<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Buffers a byte stream and yields complete JSON values.
///
/// # Example
///
/// ```rust
/// use jsonlink_protocol::StreamDecoder;
///
/// let mut decoder = StreamDecoder::new();
/// decoder.feed(br#"{"id":1,"meth"#);
/// assert!(decoder.next_value().unwrap().is_none());
///
/// decoder.feed(br#"od":"ping"}"#);
/// let value = decoder.next_value().unwrap().unwrap();
/// assert_eq!(value["method"], "ping");
/// ```
#[derive(Debug)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    max_message_size: usize,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    /// Creates a decoder limited to [`MAX_MESSAGE_SIZE`] buffered bytes.
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_MESSAGE_SIZE)
    }

    /// Creates a decoder with a custom buffered size limit.
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_message_size,
        }
    }

    /// Appends bytes received from the transport.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drops everything buffered.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Decodes the next complete JSON value.
    ///
    /// Returns `Ok(None)` when the buffer holds only whitespace or an
    /// incomplete value. On a syntax error the buffer is discarded, since
    /// there is no way to find the next message boundary.
    pub fn next_value(&mut self) -> ProtocolResult<Option<Value>> {
        let mut stream = serde_json::Deserializer::from_slice(&self.buffer).into_iter::<Value>();

        match stream.next() {
            Some(Ok(value)) => {
                let consumed = stream.byte_offset();
                self.buffer.drain(..consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => {
                if self.buffer.len() > self.max_message_size {
                    let size = self.buffer.len();
                    self.buffer.clear();
                    return Err(ProtocolError::MessageTooLarge {
                        size,
                        max: self.max_message_size,
                    });
                }
                Ok(None)
            }
            Some(Err(e)) => {
                self.buffer.clear();
                Err(e.into())
            }
            None => {
                self.buffer.clear();
                Ok(None)
            }
        }
    }

    /// Decodes and classifies the next complete message.
    pub fn next_message(&mut self) -> ProtocolResult<Option<Message>> {
        match self.next_value()? {
            Some(value) => Message::from_value(value).map(Some),
            None => Ok(None),
        }
    }
}
