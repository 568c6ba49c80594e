//! Schema initialization and migration commands

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;
use tracing::info;

/// Execute the init command
pub async fn init(config_path: &Path) -> Result<()> {
    let (config, reservoir) = super::connect(config_path).await?;

    if config.storage.skip_initialize {
        println!(
            "{}",
            "storage.skip_initialize is set; schema left untouched".yellow()
        );
        return Ok(());
    }

    println!("{}", "Initializing schema...".yellow());
    reservoir
        .initialize()
        .await
        .context("Schema initialization failed")?;

    info!(engine = %config.storage.engine, "Schema initialized");
    println!("{}", "✓ Schema is up to date".green());

    reservoir.disconnect().await?;
    Ok(())
}

/// Execute the migrate command
pub async fn migrate(config_path: &Path, target: Option<u32>) -> Result<()> {
    let (config, reservoir) = super::connect(config_path).await?;

    match target {
        Some(version) => println!("{} {}...", "Migrating schema to version".yellow(), version),
        None => println!("{}", "Migrating schema to latest version...".yellow()),
    }

    let version = reservoir
        .migrate(target)
        .await
        .context("Schema migration failed")?;

    info!(engine = %config.storage.engine, version, "Schema migrated");
    println!(
        "{} {}",
        "✓ Schema is at version".green(),
        version.to_string().bold()
    );

    reservoir.disconnect().await?;
    Ok(())
}
