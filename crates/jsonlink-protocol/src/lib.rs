//! Wire messages and stream decoding for jsonlink.
//!
//! # Protocol Overview
//!
//! Peers exchange JSON objects written back to back on a byte stream, UTF-8
//! encoded, with no length prefix or delimiter:
//!
//! - Request: `{"id":1,"method":"math.add","params":[3,2]}`
//! - Notification: `{"id":null,"method":"log","params":["hi"]}`
//! - Response: `{"id":1,"result":5,"error":null}`
//!
//! Responses are matched to requests by `id`. Either side may send requests.
//!
//! # Example
//!
//! ```rust
//! use jsonlink_protocol::{encode_message, Message, Request, StreamDecoder};
//!
//! let bytes = encode_message(&Request::new(1, "ping", vec![])).unwrap();
//! let mut decoder = StreamDecoder::new();
//! decoder.feed(&bytes);
//! let message = decoder.next_message().unwrap().unwrap();
//! assert_eq!(message.method(), Some("ping"));
//! ```

mod decoder;
mod error;
mod message;

pub use decoder::{StreamDecoder, encode_message};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{Message, MessageKind, Notification, Request, RequestId, Response};

/// Default limit on bytes buffered for one incomplete message (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Error text sent when a request names a method nobody exposed.
pub const METHOD_NOT_FOUND: &str = "Method Not Found";
