use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pandemic")]
#[command(version)]
#[command(about = "Edge daemon that installs and supervises infections", long_about = None)]
pub(crate) struct Cli {
    /// Daemon config file. Can also be set via PANDEMIC_CONFIG env var.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the daemon in the foreground (default)
    Run,

    /// Validate the config and print it with defaults filled in
    CheckConfig,
}
