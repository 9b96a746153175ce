//! Method registry and inbound call dispatch.
//!
//! Services are exposed as one of three [`ServiceBinding`] shapes and
//! flattened into a name → handler table at registration time:
//!
//! - [`ServiceBinding::Function`]: one handler at an exact name;
//! - [`ServiceBinding::Group`]: every method of a [`ServiceMap`] under
//!   `"<prefix>.<method>"`;
//! - [`ServiceBinding::Unnamed`]: every method of a [`ServiceMap`] under its
//!   bare name.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{self, BoxFuture};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::HandlerError;

/// Future returned by a handler.
pub type HandlerFuture = BoxFuture<'static, Result<Value, HandlerError>>;

/// A callable method.
pub type Handler = Arc<dyn Fn(Params) -> HandlerFuture + Send + Sync>;

/// Wraps an async closure as a [`Handler`].
///
/// ```rust
/// use jsonlink_rpc::{handler_fn, Params};
///
/// let echo = handler_fn(|params: Params| async move { params.get::<serde_json::Value>(0) });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(move |params: Params| -> HandlerFuture { Box::pin(f(params)) })
}

/// Wraps a synchronous closure as a [`Handler`].
pub fn sync_fn<F>(f: F) -> Handler
where
    F: Fn(Params) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    Arc::new(move |params: Params| -> HandlerFuture {
        let result = f(params);
        Box::pin(async move { result })
    })
}

/// Positional parameters of an inbound call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Vec<Value>);

impl Params {
    /// Wraps a parameter list.
    pub fn new(params: Vec<Value>) -> Self {
        Self(params)
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true when no parameters were passed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw value at `index`.
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Deserializes the parameter at `index`.
    ///
    /// A missing parameter is read as `null`, so `Option<T>` targets accept
    /// omitted trailing arguments.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, HandlerError> {
        let value = self.0.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| HandlerError::invalid_param(index, e))
    }

    /// Iterates over the raw values.
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.0.iter()
    }

    /// Returns the underlying list.
    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Params {
    fn from(params: Vec<Value>) -> Self {
        Self(params)
    }
}

/// An ordered set of named handlers sharing whatever state they capture.
#[derive(Clone, Default)]
pub struct ServiceMap {
    methods: Vec<(String, Handler)>,
}

impl ServiceMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a method.
    pub fn method(mut self, name: impl Into<String>, handler: Handler) -> Self {
        self.insert(name, handler);
        self
    }

    /// Adds or replaces a method.
    pub fn insert(&mut self, name: impl Into<String>, handler: Handler) {
        let name = name.into();
        if let Some(slot) = self.methods.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = handler;
        } else {
            self.methods.push((name, handler));
        }
    }

    /// Number of methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Returns true if the map has no methods.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Method names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|(name, _)| name.as_str())
    }
}

impl fmt::Debug for ServiceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// A unit of registration for [`MethodRegistry::register`].
#[derive(Clone)]
pub enum ServiceBinding {
    /// One handler at an exact name.
    Function { name: String, handler: Handler },
    /// A map registered under `"<prefix>.<method>"`.
    Group { prefix: String, methods: ServiceMap },
    /// A map registered under bare method names.
    Unnamed(ServiceMap),
}

impl ServiceBinding {
    /// Binds one handler.
    pub fn function(name: impl Into<String>, handler: Handler) -> Self {
        Self::Function {
            name: name.into(),
            handler,
        }
    }

    /// Binds a map under a prefix.
    pub fn group(prefix: impl Into<String>, methods: ServiceMap) -> Self {
        Self::Group {
            prefix: prefix.into(),
            methods,
        }
    }

    /// Binds a map without a prefix.
    pub fn unnamed(methods: ServiceMap) -> Self {
        Self::Unnamed(methods)
    }

    /// Qualified names and handlers this binding resolves to.
    fn resolve(&self) -> Vec<(String, Handler)> {
        match self {
            Self::Function { name, handler } => vec![(name.clone(), handler.clone())],
            Self::Group { prefix, methods } => methods
                .methods
                .iter()
                .map(|(name, handler)| (format!("{}.{}", prefix, name), handler.clone()))
                .collect(),
            Self::Unnamed(methods) => methods.methods.clone(),
        }
    }
}

impl From<ServiceMap> for ServiceBinding {
    fn from(methods: ServiceMap) -> Self {
        Self::Unnamed(methods)
    }
}

impl fmt::Debug for ServiceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function { name, .. } => f.debug_struct("Function").field("name", name).finish(),
            Self::Group { prefix, methods } => f
                .debug_struct("Group")
                .field("prefix", prefix)
                .field("methods", methods)
                .finish(),
            Self::Unnamed(methods) => f.debug_tuple("Unnamed").field(methods).finish(),
        }
    }
}

/// Flat name → handler table owned by one connection.
#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<String, Handler>,
}

impl MethodRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a binding, replacing handlers already stored under the same
    /// names. Returns the qualified names that were registered.
    pub fn register(&mut self, binding: &ServiceBinding) -> Vec<String> {
        binding
            .resolve()
            .into_iter()
            .map(|(name, handler)| {
                if self.methods.insert(name.clone(), handler).is_some() {
                    debug!(method = %name, "Replaced handler");
                }
                name
            })
            .collect()
    }

    /// Looks up a handler.
    pub fn get(&self, method: &str) -> Option<Handler> {
        self.methods.get(method).cloned()
    }

    /// Returns true if a handler is registered under `method`.
    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names())
            .finish()
    }
}

/// Runs a handler, or reports "Method Not Found" when there is none.
///
/// A panic, whether raised while building the future or while polling it,
/// becomes a [`HandlerError`] carrying the panic message.
pub async fn invoke(handler: Option<Handler>, params: Params) -> Result<Value, HandlerError> {
    start(handler, params).await
}

/// Calls `handler` now and returns the rest of its work as a future.
///
/// The synchronous part of the handler has already run when this returns.
pub(crate) fn start(handler: Option<Handler>, params: Params) -> HandlerFuture {
    let Some(handler) = handler else {
        return future::ready(Err(HandlerError::not_found())).boxed();
    };

    match std::panic::catch_unwind(AssertUnwindSafe(|| handler(params))) {
        Ok(pending) => AssertUnwindSafe(pending)
            .catch_unwind()
            .map(|outcome| outcome.unwrap_or_else(|panic| Err(HandlerError::from_panic(panic))))
            .boxed(),
        Err(panic) => future::ready(Err(HandlerError::from_panic(panic))).boxed(),
    }
}
