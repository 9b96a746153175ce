//! Request, notification and response messages.
//!
//! The three message kinds share one wire shape family and are told apart by
//! which keys are present, not by a tag:
//!
//! - a `result` or `error` key (even when `null`) marks a [`Response`], or
//!   an orphan when its `id` cannot name a request;
//! - otherwise a non-null `id` marks a [`Request`];
//! - otherwise the message is a [`Notification`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProtocolError, ProtocolResult};

/// Correlation identifier carried by requests and responses.
pub type RequestId = u64;

/// An invocation that expects a [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, echoed back in the response.
    pub id: RequestId,
    /// Qualified method name.
    pub method: String,
    /// Positional parameters.
    #[serde(default)]
    pub params: Vec<Value>,
}

impl Request {
    /// Creates a request.
    pub fn new(id: RequestId, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// An invocation that never produces a response.
///
/// Serialized with an explicit `"id": null`.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Qualified method name.
    pub method: String,
    /// Positional parameters.
    pub params: Vec<Value>,
}

impl Notification {
    /// Creates a notification.
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

#[derive(Serialize)]
struct NotificationWire<'a> {
    id: Option<RequestId>,
    method: &'a str,
    params: &'a [Value],
}

impl Serialize for Notification {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        NotificationWire {
            id: None,
            method: &self.method,
            params: &self.params,
        }
        .serialize(serializer)
    }
}

/// The outcome of a previously issued [`Request`].
///
/// Build responses with [`Response::success`] or [`Response::failure`] so
/// that exactly one of `result` and `error` carries a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this answers.
    pub id: RequestId,
    /// Result value, `null` on failure.
    #[serde(default)]
    pub result: Value,
    /// Error message, `null` on success.
    #[serde(default)]
    pub error: Option<String>,
}

impl Response {
    /// Creates a successful response.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }

    /// Creates a failed response.
    pub fn failure(id: RequestId, message: impl Into<String>) -> Self {
        Self {
            id,
            result: Value::Null,
            error: Some(message.into()),
        }
    }

    /// Returns true if the response carries no error.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Converts into a `Result`, consuming the response.
    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(message) => Err(message),
            None => Ok(self.result),
        }
    }
}

/// Any message that can appear on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
    /// A response whose `id` is missing, `null` or not a request id. It can
    /// never match a pending call.
    Orphan(Value),
}

/// Discriminant of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
}

impl Message {
    /// Classifies a decoded JSON value.
    ///
    /// Values that are not objects, objects with neither a `method` nor a
    /// `result`/`error` key, and objects whose fields have the wrong types are
    /// rejected as [`ProtocolError::Malformed`]. A missing or `null` `params`
    /// is read as an empty list. A response whose `id` is unusable becomes
    /// [`Message::Orphan`] rather than an error.
    pub fn from_value(value: Value) -> ProtocolResult<Self> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::malformed("expected a JSON object"));
        };

        if map.contains_key("result") || map.contains_key("error") {
            let Some(id) = map.get("id").and_then(Value::as_u64) else {
                return Ok(Message::Orphan(Value::Object(map)));
            };
            map.remove("id");
            let result = map.remove("result").unwrap_or(Value::Null);
            let error = take_error(&mut map);
            return Ok(Message::Response(Response { id, result, error }));
        }

        let method = match map.remove("method") {
            Some(Value::String(method)) => method,
            Some(_) => return Err(ProtocolError::malformed("method must be a string")),
            None => {
                return Err(ProtocolError::malformed(
                    "neither a method nor a result/error",
                ));
            }
        };

        let params = match map.remove("params") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(params)) => params,
            Some(_) => return Err(ProtocolError::malformed("params must be an array")),
        };

        match take_id(&mut map)? {
            Some(id) => Ok(Message::Request(Request { id, method, params })),
            None => Ok(Message::Notification(Notification { method, params })),
        }
    }

    /// Returns the message kind.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request(_) => MessageKind::Request,
            Message::Notification(_) => MessageKind::Notification,
            Message::Response(_) | Message::Orphan(_) => MessageKind::Response,
        }
    }

    /// Returns the correlation id, if the message has one.
    pub fn id(&self) -> Option<RequestId> {
        match self {
            Message::Request(request) => Some(request.id),
            Message::Notification(_) | Message::Orphan(_) => None,
            Message::Response(response) => Some(response.id),
        }
    }

    /// Returns the method name of requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(request) => Some(&request.method),
            Message::Notification(notification) => Some(&notification.method),
            Message::Response(_) | Message::Orphan(_) => None,
        }
    }
}

impl TryFrom<Value> for Message {
    type Error = ProtocolError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Message::from_value(value)
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Notification> for Message {
    fn from(notification: Notification) -> Self {
        Message::Notification(notification)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

fn take_id(map: &mut Map<String, Value>) -> ProtocolResult<Option<RequestId>> {
    match map.remove("id") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| ProtocolError::malformed("id must be a non-negative integer")),
        Some(_) => Err(ProtocolError::malformed("id must be a non-negative integer")),
    }
}

// Peers that send structured errors still get their message through.
fn take_error(map: &mut Map<String, Value>) -> Option<String> {
    match map.remove("error")? {
        Value::Null => None,
        Value::String(message) => Some(message),
        Value::Object(mut object) => match object.remove("message") {
            Some(Value::String(message)) => Some(message),
            _ => Some(Value::Object(object).to_string()),
        },
        other => Some(other.to_string()),
    }
}
