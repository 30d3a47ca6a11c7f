//! funchost CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Host stopped gracefully or exited with code 0
//! - 1: General error
//! - 2: Invalid arguments
//! - 3: Validation failure (launch rejected before any process was created)
//! - 4: Runtime error (spawn failure, forced stop, abnormal host exit)

use std::process::ExitCode;

use clap::Parser;
use funchost_core::{CoreError, ErrorClass};
use funchost_runner::RunnerError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::{Cli, Commands};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const VALIDATION_FAILURE: u8 = 3;
    pub const RUNTIME_ERROR: u8 = 4;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "funchost=debug,funchost_core=debug,funchost_runner=debug,warn"
    } else if cli.quiet {
        "warn"
    } else {
        "funchost=info,funchost_core=info,funchost_runner=info,warn"
    };

    // RUST_LOG wins over the flags
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let log_result = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();

    if log_result.is_err() {
        // Logging already initialized, continue
    }

    let result = match cli.command {
        Commands::Start(args) => commands::start::execute(args, cli.verbose).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

/// Categorize error to determine exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    let class = if let Some(core) = e.downcast_ref::<CoreError>() {
        core.class()
    } else if let Some(runner) = e.downcast_ref::<RunnerError>() {
        runner.class()
    } else if e.downcast_ref::<commands::start::HostRunError>().is_some() {
        ErrorClass::Runtime
    } else {
        ErrorClass::General
    };

    match class {
        ErrorClass::InvalidArgument => ExitCodes::INVALID_ARGS,
        ErrorClass::Validation => ExitCodes::VALIDATION_FAILURE,
        ErrorClass::Runtime => ExitCodes::RUNTIME_ERROR,
        ErrorClass::General => ExitCodes::GENERAL_ERROR,
    }
}
