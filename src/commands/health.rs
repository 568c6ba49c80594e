use anyhow::Result;
use colored::Colorize;
use reservoir::models::{EngineCapabilities, HealthState};
use std::path::Path;

/// Execute the health command
pub async fn execute(config_path: &Path) -> Result<()> {
    println!("{}", "Checking storage backend...".yellow());

    let (config, reservoir) = super::connect(config_path).await?;
    let status = reservoir.health_check().await;

    let state = match status.status {
        HealthState::Healthy => "healthy".green(),
        HealthState::Degraded => "degraded".yellow(),
        HealthState::Unhealthy => "unhealthy".red(),
    };

    println!();
    println!("{}", "Health:".bold());
    println!("  {}: {}", "Engine".cyan(), config.storage.engine);
    println!(
        "  {}: {}:{}/{}",
        "Backend".cyan(),
        config.storage.connection.host,
        config.storage.port(),
        config.storage.connection.database
    );
    println!("  {}: {}", "Status".cyan(), state);
    println!("  {}: {}ms", "Response Time".cyan(), status.response_time_ms);
    if let Some(error) = &status.error {
        println!("  {}: {}", "Error".cyan(), error.red());
    }
    println!();

    print_capabilities(&reservoir.capabilities());

    reservoir.disconnect().await?;
    Ok(())
}

fn print_capabilities(caps: &EngineCapabilities) {
    println!("{}", "Capabilities:".bold());
    for (name, supported) in [
        ("Full-text search", caps.supports_full_text_search),
        ("Aggregations", caps.supports_aggregations),
        ("Streaming ingestion", caps.supports_streaming),
        ("Transactions", caps.supports_transactions),
        ("Native compression", caps.native_compression),
        ("Native tiering", caps.native_tiering),
        ("Asynchronous deletes", caps.async_deletes),
        ("Segment drops", caps.supports_segment_drop),
    ] {
        println!("  {:<24} {}", name, flag(supported));
    }
    println!("  {:<24} {}", "Max batch size", caps.max_batch_size);
    let intervals: Vec<&str> = caps
        .supported_intervals
        .iter()
        .map(|interval| interval.as_str())
        .collect();
    println!("  {:<24} {}", "Intervals", intervals.join(", "));
}

fn flag(supported: bool) -> colored::ColoredString {
    if supported {
        "yes".green()
    } else {
        "no".dimmed()
    }
}
