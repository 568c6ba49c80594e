use anyhow::Result;
use chrono::{Duration, Utc};
use colored::Colorize;
use reservoir::models::{Dataset, TimeRange};
use std::path::Path;

/// Execute the segments command
pub async fn execute(config_path: &Path, dataset: Dataset, days: u32) -> Result<()> {
    let (_, reservoir) = super::connect(config_path).await?;

    let now = Utc::now();
    let range = TimeRange::new(now - Duration::days(i64::from(days)), now);
    let segments = reservoir.list_segments(dataset, &range).await?;

    println!(
        "{}",
        format!("{} segments ({} days)", dataset, days)
            .bold()
            .underline()
    );
    println!();

    if segments.is_empty() {
        println!("{}", "No segments found".yellow());
    } else {
        println!(
            "{:<40} {:<20} {:<20} {:>12} {:>14}",
            "Name".bold(),
            "Start".bold(),
            "End".bold(),
            "Rows".bold(),
            "Size".bold()
        );
        for segment in &segments {
            let name = if segment.compressed {
                segment.name.cyan()
            } else {
                segment.name.normal()
            };
            println!(
                "{:<40} {:<20} {:<20} {:>12} {:>14}",
                name,
                segment.range_start.format("%Y-%m-%d %H:%M"),
                segment.range_end.format("%Y-%m-%d %H:%M"),
                segment.rows.map_or("-".to_string(), format_number),
                segment.bytes.map_or("-".to_string(), format_bytes),
            );
        }
        println!();
        println!("{} {}", "Total:".bold(), segments.len());
    }

    reservoir.disconnect().await?;
    Ok(())
}

/// Format number with thousand separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
