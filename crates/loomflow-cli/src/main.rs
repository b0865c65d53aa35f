//! Loomflow command-line entry point.
//!
//! Binary name: `loomflow`
//!
//! Parses CLI arguments, sets up tracing, then dispatches to the command
//! handler.

mod cli;
mod config;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use loomflow_observe::{TracingOptions, init_tracing, shutdown_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need tracing
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "loomflow", &mut std::io::stdout());
        return Ok(());
    }

    let mut options = TracingOptions::from_verbosity(cli.verbose)
        .with_json(cli.log_json)
        .with_otel(cli.otel);
    if cli.quiet && cli.verbose == 0 {
        options.default_directive = "error".to_string();
    }
    if let Err(err) = init_tracing(&options) {
        eprintln!("warning: failed to initialise tracing: {err}");
    }

    let result = match cli.command {
        Commands::Run(args) => cli::run::handle_run(args, cli.json, cli.quiet).await,
        Commands::Validate { file, library } => {
            cli::validate::handle_validate(&file, &library, cli.json, cli.quiet).await
        }
        Commands::Trace {
            file,
            library,
            max_depth,
        } => cli::trace::handle_trace(&file, &library, max_depth, cli.json).await,
        Commands::Completions { .. } => Ok(()),
    };

    shutdown_tracing();
    result
}

/// Resolves on Ctrl+C or SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
