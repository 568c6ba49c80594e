use anyhow::Result;
use colored::Colorize;
use reservoir::config::{self, Config};
use std::path::Path;
use tracing::info;

/// Execute the config show command
///
/// Displays the current configuration with the backend password masked
pub fn show(path: &Path) -> Result<()> {
    println!("{}", "Loading configuration...".yellow());
    info!("Loading configuration for display");

    let cfg = config::load_config(path)?;
    let sanitized = sanitize_secrets(&cfg);

    println!("{}", "Current Configuration:".green().bold());
    println!();

    let toml_string = toml::to_string_pretty(&sanitized)?;
    println!("{}", toml_string);

    Ok(())
}

/// Execute the config validate command
pub fn validate(path: &Path) -> Result<()> {
    println!("{}", "Validating configuration...".yellow());

    let cfg = config::load_config(path)?;

    println!("{}", "✓ Configuration is valid".green());
    println!();
    println!("{}", "Summary:".bold());
    println!("  Engine: {}", cfg.storage.engine);
    println!(
        "  Backend: {}:{}/{}",
        cfg.storage.connection.host,
        cfg.storage.port(),
        cfg.storage.connection.database
    );
    println!(
        "  Tables: {}, {}, {}",
        cfg.storage.tables.logs, cfg.storage.tables.spans, cfg.storage.tables.traces
    );
    println!("  Retention window: {}h", cfg.retention.window_hours);

    info!("Configuration validation successful");
    Ok(())
}

fn sanitize_secrets(cfg: &Config) -> Config {
    let mut sanitized = cfg.clone();
    sanitized.storage.connection.password = mask_secret(&cfg.storage.connection.password);
    sanitized
}

/// Mask a secret for safe display
///
/// Example: "hunter2-long-password" -> "hu...rd"
fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        // Too short to mask meaningfully
        return "***".to_string();
    }

    let prefix: String = chars[..2].iter().collect();
    let suffix: String = chars[chars.len() - 2..].iter().collect();
    format!("{}...{}", prefix, suffix)
}
