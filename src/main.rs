use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use reservoir::config;
use reservoir::logging::{init_tracing, LoggingConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    // Config errors are reported by the command itself, so fall back to default logging
    let logging = config::load_config(&args.config)
        .map(|cfg| cfg.logging)
        .unwrap_or_else(|_| LoggingConfig::default());
    init_tracing(&logging);

    match args.command {
        cli::Commands::Health => commands::health::execute(&args.config).await?,
        cli::Commands::Init => commands::schema::init(&args.config).await?,
        cli::Commands::Migrate { to } => commands::schema::migrate(&args.config, to).await?,
        cli::Commands::Retention(retention) => {
            commands::retention::execute(&args.config, retention).await?
        }
        cli::Commands::Segments { dataset, days } => {
            commands::segments::execute(&args.config, dataset, days).await?
        }
        cli::Commands::Config { action } => match action {
            cli::ConfigCommands::Show => commands::config::show(&args.config)?,
            cli::ConfigCommands::Validate => commands::config::validate(&args.config)?,
        },
    }

    Ok(())
}
