//! jsonlink CLI entry point.

use std::process::ExitCode;

use clap::Parser;

use jsonlink_cli::cli::{Cli, Command, parse_params};
use jsonlink_cli::commands;
use jsonlink_cli::config::CliConfig;
use jsonlink_cli::error::CliResult;
use jsonlink_cli::signals::shutdown_signal;
use jsonlink_core::{TracingConfig, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let tracing = if cli.debug || config.debug {
        TracingConfig::cli_debug()
    } else if matches!(cli.command, Command::Serve { .. }) {
        TracingConfig::daemon()
    } else {
        TracingConfig::default()
    };
    if let Err(e) = init_tracing(tracing) {
        eprintln!("warning: {}", e);
    }

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> CliResult<CliConfig> {
    match cli.config {
        Some(ref path) => CliConfig::load_from(path),
        None => CliConfig::load(),
    }
}

async fn run(cli: Cli, config: CliConfig) -> CliResult<()> {
    let mut connection = config.connection.to_connection_config();
    if let Some(millis) = cli.timeout {
        connection = connection.with_call_timeout(commands::call::timeout_from_millis(millis));
    }

    match cli.command {
        Command::Serve { listen } => {
            let mut server = config.server;
            if let Some(listen) = listen {
                server.listen = listen;
            }
            commands::serve::run(&server, connection, shutdown_signal()).await
        }
        Command::Call {
            method,
            params,
            connect,
        } => {
            let endpoint = connect.unwrap_or(config.connection.endpoint);
            let result =
                commands::call::call(&endpoint, connection, &method, parse_params(&params)).await?;
            println!("{}", commands::call::render(&result)?);
            Ok(())
        }
        Command::Notify {
            method,
            params,
            connect,
        } => {
            let endpoint = connect.unwrap_or(config.connection.endpoint);
            commands::call::notify(&endpoint, connection, &method, parse_params(&params)).await
        }
    }
}
