//! CLI, configuration, demo services
//!
//! This crate provides the `jsonlink` command-line interface.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod services;
pub mod signals;

pub use cli::Cli;
pub use config::CliConfig;
pub use error::{CliError, CliResult};
