use crate::cli::RetentionArgs;
use anyhow::{Context, Result};
use chrono::Utc;
use colored::Colorize;
use reservoir::models::Dataset;
use reservoir::retention::{self, RetentionRule, RetentionSchedule, RetentionSweeper};
use std::path::Path;

/// Execute the retention command
pub async fn execute(config_path: &Path, args: RetentionArgs) -> Result<()> {
    if let Some(global_days) = args.global_days {
        if global_days < args.days {
            anyhow::bail!(
                "--global-days ({}) cannot be shorter than --days ({})",
                global_days,
                args.days
            );
        }
    }

    let (config, reservoir) = super::connect(config_path).await?;
    let schedule = RetentionSchedule {
        rules: vec![RetentionRule {
            project_ids: args.projects.clone(),
            retention_days: args.days,
        }],
        global_retention_days: args.global_days,
        datasets: match args.dataset {
            Some(dataset) => vec![dataset],
            None => vec![Dataset::Logs, Dataset::Spans],
        },
    };

    println!(
        "{} {} project(s), keeping {} days...",
        "Sweeping".yellow(),
        args.projects.len(),
        args.days
    );

    let sweeper = RetentionSweeper::new(reservoir.clone(), config.retention.clone());
    let reports = retention::run_sweep_now(&sweeper, &schedule, Utc::now())
        .await
        .context("Retention sweep failed")?;

    println!();
    for (dataset, report) in schedule.datasets.iter().zip(&reports) {
        println!("{}", format!("{}:", dataset).bold());
        println!("  {:<22} {}", "Segments dropped:", report.segments_dropped);
        println!("  {:<22} {}", "Segments decompressed:", report.segments_decompressed);
        println!("  {:<22} {}", "Delete windows:", report.windows);
        let rows = if report.estimated {
            format!("~{} (estimated)", report.rows_deleted)
        } else {
            report.rows_deleted.to_string()
        };
        println!("  {:<22} {}", "Rows deleted:", rows);
        if report.mutations_settled == Some(false) {
            println!(
                "  {}",
                "Background deletes still running at timeout".yellow()
            );
        }
    }

    reservoir.disconnect().await?;
    Ok(())
}
