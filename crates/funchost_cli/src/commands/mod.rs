//! CLI command definitions.

use clap::{Parser, Subcommand};

pub mod start;

/// funchost - local launcher for the functions host
#[derive(Parser)]
#[command(name = "funchost")]
#[command(version, about = "funchost - local launcher for the functions host")]
#[command(long_about = r#"
funchost picks the right functions host build for a project, validates the
project before anything is started, then runs and supervises the host.

COMMANDS:
  start         → Resolve, validate and run the host for a project

EXIT CODES:
  0 - Host stopped gracefully or exited with code 0
  1 - General error
  2 - Invalid arguments
  3 - Validation failure
  4 - Runtime error
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output (also passed to the host)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the functions host for a project
    Start(start::StartArgs),
}
