//! Command implementations for the CLI
//!
//! - health: Probe the backend and print capabilities
//! - schema: Initialize or migrate the schema
//! - retention: Run a retention sweep
//! - segments: List chunks or partitions
//! - config: Configuration display and validation

pub mod config;
pub mod health;
pub mod retention;
pub mod schema;
pub mod segments;

use anyhow::{Context, Result};
use reservoir::config::{self as cfg, Config};
use reservoir::Reservoir;
use std::path::Path;

/// Load configuration and connect, without touching the schema
pub(crate) async fn connect(path: &Path) -> Result<(Config, Reservoir)> {
    let config = cfg::load_config(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

    let reservoir = Reservoir::from_config(&config.storage);
    reservoir
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {} backend", config.storage.engine))?;

    Ok((config, reservoir))
}
