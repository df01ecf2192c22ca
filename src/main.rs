mod args;

use anyhow::Context;
use args::{Cli, Commands};
use clap::Parser;
use pandemic::config::{DaemonConfig, LoggingSection};
use pandemic::daemon::{self, Backends, DaemonServer};
use pandemic::clienv;
use tracing_subscriber::EnvFilter;

/// RUST_LOG wins over the configured level.
fn init_tracing(logging: &LoggingSection) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.to_ascii_lowercase()));
    if logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(clienv::config_path);
    let config = DaemonConfig::load(&config_path)?;
    let errors = config.validate();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            println!("{}", config.to_toml()?);
            if !errors.is_empty() {
                for error in &errors {
                    eprintln!("error: {error}");
                }
                anyhow::bail!("{} problem(s) in {}", errors.len(), config_path.display());
            }
        }
        Commands::Run => {
            if !errors.is_empty() {
                anyhow::bail!("Invalid config {}: {}", config_path.display(), errors.join("; "));
            }
            init_tracing(&config.logging);
            tracing::info!(config = %config_path.display(), "Configuration loaded");

            let backends = Backends::system(&config)?;
            let ctx = daemon::assemble(config, backends).context("Failed to load infection state")?;
            DaemonServer::new(ctx).run().await?;
        }
    }

    Ok(())
}
