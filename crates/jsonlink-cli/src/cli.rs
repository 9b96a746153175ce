//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

use jsonlink_core::Endpoint;

/// jsonlink - bidirectional JSON-RPC over TCP
#[derive(Debug, Parser)]
#[command(name = "jsonlink")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "JSONLINK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v', global = true)]
    pub debug: bool,

    /// Call timeout in milliseconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the demo services until interrupted
    Serve {
        /// Address to listen on (host:port)
        #[arg(long, short)]
        listen: Option<Endpoint>,
    },

    /// Call a remote method and print its result
    Call {
        /// Qualified method name
        method: String,

        /// Positional parameters, each parsed as JSON (plain text becomes a string)
        params: Vec<String>,

        /// Address to connect to (host:port)
        #[arg(long, short = 'C')]
        connect: Option<Endpoint>,
    },

    /// Send a notification
    Notify {
        /// Qualified method name
        method: String,

        /// Positional parameters, each parsed as JSON (plain text becomes a string)
        params: Vec<String>,

        /// Address to connect to (host:port)
        #[arg(long, short = 'C')]
        connect: Option<Endpoint>,
    },
}

/// Parses positional parameters given on the command line.
pub fn parse_params(raw: &[String]) -> Vec<Value> {
    raw.iter()
        .map(|arg| serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.clone())))
        .collect()
}
