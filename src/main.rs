use std::process::ExitCode;

use clap::Parser;

use chronostore::cli::Cli;
use chronostore::lifecycle::{startup, StartupError};
use chronostore::observability::logging;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    let debug_env = std::env::var("DEBUG").ok();
    let config = match cli.config(debug_env.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let span = match logging::init(&config.log) {
        Ok(span) => span,
        Err(e) => {
            eprintln!("error: {}", StartupError::from(e));
            return ExitCode::FAILURE;
        }
    };

    let service = cli.command.service();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %StartupError::Runtime(e), "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    let _entered = span.clone().entered();
    match runtime.block_on(startup::run(service, config, span)) {
        Ok(Ok(())) => {
            tracing::info!("Exiting");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "{service} command failed");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = %e, "{service} command failed to start");
            ExitCode::FAILURE
        }
    }
}
