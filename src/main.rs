use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use almanac::app::AppContext;
use almanac::cli::{commands, Cli, Commands};
use almanac::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let ctx = AppContext::new(config)?;

    match cli.command {
        Commands::Refresh { source, deadline } => {
            commands::refresh(&ctx, &source, deadline).await?;
        }
        Commands::Events { days, cancelled } => {
            commands::list_events(&ctx, days, cancelled)?;
        }
        Commands::Status => {
            commands::show_status(&ctx)?;
        }
        Commands::Cleanup => {
            commands::cleanup(&ctx)?;
        }
        Commands::Runs { limit } => {
            commands::list_runs(&ctx, limit)?;
        }
    }

    Ok(())
}
