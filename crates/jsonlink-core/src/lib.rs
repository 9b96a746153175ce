//! Core types: endpoints, tracing setup

pub mod endpoint;
pub mod tracing;

pub use endpoint::{DEFAULT_HOST, Endpoint, EndpointError};
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
