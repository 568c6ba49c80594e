//! Retention sweeps
//!
//! A sweep first drops whole segments older than the global cutoff when the
//! engine can, then deletes what remains of each project's expired range in
//! bounded windows, one window per delete call. Compressed segments overlapping
//! a project's range are decompressed first.
//!
//! Engines with asynchronous deletes report `deleted = 0`; there the sweeper
//! counts each window before deleting, reports the total as an estimate and
//! waits for the engine's mutation queue to drain.

use crate::config::RetentionConfig;
use crate::error::{StorageError, StorageResult};
use crate::metrics;
use crate::models::{
    CountParams, Dataset, DeleteParams, LogFilters, SpanQueryParams, TimeRange,
};
use crate::reservoir::Reservoir;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time;

/// Rows of `project_ids` in `[from, cutoff)` are expired
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub project_ids: Vec<String>,
    pub from: DateTime<Utc>,
    pub cutoff: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepPlan {
    pub dataset: Dataset,
    /// Every project's rows older than this are expired; enables segment drops
    pub global_cutoff: Option<DateTime<Utc>>,
    pub policies: Vec<RetentionPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub segments_dropped: u64,
    pub segments_decompressed: u64,
    /// Delete calls issued
    pub windows: u64,
    pub rows_deleted: u64,
    /// `rows_deleted` was counted before deleting rather than reported by the engine
    pub estimated: bool,
    /// `Some(false)` when background deletes were still running at the timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutations_settled: Option<bool>,
}

/// Split `[from, to)` into consecutive windows of at most `width`
pub fn windows(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    width: Duration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut windows = Vec::new();
    if width <= Duration::zero() {
        return windows;
    }

    let mut start = from;
    while start < to {
        let end = (start + width).min(to);
        windows.push((start, end));
        start = end;
    }
    windows
}

pub struct RetentionSweeper {
    reservoir: Reservoir,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(reservoir: Reservoir, config: RetentionConfig) -> Self {
        Self { reservoir, config }
    }

    pub async fn sweep(&self, plan: &SweepPlan) -> StorageResult<SweepReport> {
        let capabilities = self.reservoir.capabilities();
        let dataset = plan.dataset;
        let mut report = SweepReport {
            estimated: capabilities.async_deletes,
            ..Default::default()
        };

        let mut covered_until = None;
        if let Some(cutoff) = plan.global_cutoff {
            if capabilities.supports_segment_drop {
                report.segments_dropped = self
                    .reservoir
                    .drop_segments_before(dataset, cutoff)
                    .await?;
                if report.segments_dropped > 0 {
                    covered_until = self.earliest_remaining(plan).await?;
                }
            }
        }

        for policy in &plan.policies {
            if policy.project_ids.is_empty() {
                continue;
            }
            let from = covered_until.map_or(policy.from, |covered| policy.from.max(covered));
            if from >= policy.cutoff {
                tracing::debug!(%dataset, projects = ?policy.project_ids, "Range already covered by dropped segments");
                continue;
            }

            if capabilities.native_compression {
                report.segments_decompressed += self
                    .decompress(dataset, TimeRange::half_open(from, policy.cutoff))
                    .await;
            }

            for (start, end) in windows(from, policy.cutoff, self.config.window()) {
                let params = DeleteParams::new(policy.project_ids.clone(), start, end);
                let estimate = if capabilities.async_deletes {
                    self.count_window(dataset, &params).await?
                } else {
                    0
                };

                let deleted = match dataset {
                    Dataset::Logs => self.reservoir.delete_by_time_range(&params).await?,
                    Dataset::Spans => self.reservoir.delete_spans_by_time_range(&params).await?,
                };

                report.windows += 1;
                report.rows_deleted += if capabilities.async_deletes {
                    estimate
                } else {
                    deleted.deleted
                };
            }
        }

        if capabilities.async_deletes && report.windows > 0 {
            report.mutations_settled = Some(
                self.reservoir
                    .wait_for_mutations(self.config.mutation_timeout())
                    .await?,
            );
        }

        metrics::record_retention(self.reservoir.kind(), dataset, report.rows_deleted);
        tracing::info!(
            engine = %self.reservoir.kind(),
            %dataset,
            segments_dropped = report.segments_dropped,
            windows = report.windows,
            rows_deleted = report.rows_deleted,
            estimated = report.estimated,
            "Retention sweep completed"
        );

        Ok(report)
    }

    /// Start of the oldest segment left in the plan's range after a drop
    async fn earliest_remaining(&self, plan: &SweepPlan) -> StorageResult<Option<DateTime<Utc>>> {
        let (Some(from), Some(to)) = (
            plan.policies.iter().map(|p| p.from).min(),
            plan.policies.iter().map(|p| p.cutoff).max(),
        ) else {
            return Ok(None);
        };
        if from >= to {
            return Ok(None);
        }

        match self
            .reservoir
            .list_segments(plan.dataset, &TimeRange::half_open(from, to))
            .await
        {
            Ok(segments) => Ok(Some(
                segments
                    .iter()
                    .map(|segment| segment.range_start)
                    .min()
                    .unwrap_or(to),
            )),
            Err(e) if matches!(e.root(), StorageError::Unsupported(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn decompress(&self, dataset: Dataset, range: TimeRange) -> u64 {
        match self.reservoir.decompress_segments(dataset, &range).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(%dataset, error = %e, "Segment decompression failed, deleting anyway");
                0
            }
        }
    }

    async fn count_window(&self, dataset: Dataset, params: &DeleteParams) -> StorageResult<u64> {
        match dataset {
            Dataset::Logs => {
                let count = CountParams {
                    range: params.range(),
                    filters: LogFilters {
                        project_ids: params.project_ids.clone(),
                        ..Default::default()
                    },
                };
                Ok(self.reservoir.count(&count).await?.count)
            }
            Dataset::Spans => {
                let mut query = SpanQueryParams::new(params.range());
                query.project_ids = params.project_ids.clone();
                query.limit = 1;
                Ok(self.reservoir.query_spans(&query).await?.total)
            }
        }
    }
}

/// Retention period for a group of projects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionRule {
    pub project_ids: Vec<String>,
    pub retention_days: u32,
}

/// What a scheduled sweep covers; turned into concrete plans at run time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionSchedule {
    pub rules: Vec<RetentionRule>,
    /// Longest retention of any project; data older than this is dropped by segment
    #[serde(default)]
    pub global_retention_days: Option<u32>,
    pub datasets: Vec<Dataset>,
}

impl RetentionSchedule {
    /// Plans relative to `now`, looking back `lookback_days` before each cutoff
    pub fn plan(&self, now: DateTime<Utc>, lookback_days: u32) -> Vec<SweepPlan> {
        let lookback = Duration::days(i64::from(lookback_days));
        let policies: Vec<RetentionPolicy> = self
            .rules
            .iter()
            .map(|rule| {
                let cutoff = now - Duration::days(i64::from(rule.retention_days));
                RetentionPolicy {
                    project_ids: rule.project_ids.clone(),
                    from: cutoff - lookback,
                    cutoff,
                }
            })
            .collect();

        self.datasets
            .iter()
            .map(|dataset| SweepPlan {
                dataset: *dataset,
                global_cutoff: self
                    .global_retention_days
                    .map(|days| now - Duration::days(i64::from(days))),
                policies: policies.clone(),
            })
            .collect()
    }
}

/// Spawn the scheduled retention task
///
/// Checks every `check_interval_secs` whether the UTC hour equals
/// `cleanup_hour`, and sweeps at most once per day.
pub fn spawn_retention_task(
    sweeper: Arc<RetentionSweeper>,
    schedule: RetentionSchedule,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        retention_loop(sweeper, schedule).await;
    })
}

async fn retention_loop(sweeper: Arc<RetentionSweeper>, schedule: RetentionSchedule) {
    let mut interval = time::interval(std::time::Duration::from_secs(
        sweeper.config.check_interval_secs.max(1),
    ));
    let mut last_sweep_day: Option<u32> = None;

    loop {
        interval.tick().await;

        let now = Utc::now();
        let current_day = now.ordinal();
        if now.hour() != sweeper.config.cleanup_hour || Some(current_day) == last_sweep_day {
            continue;
        }

        tracing::info!(cleanup_hour = sweeper.config.cleanup_hour, "Starting scheduled retention sweep");
        match run_sweep_now(&sweeper, &schedule, now).await {
            Ok(reports) => {
                tracing::info!(
                    rows_deleted = reports.iter().map(|r| r.rows_deleted).sum::<u64>(),
                    segments_dropped = reports.iter().map(|r| r.segments_dropped).sum::<u64>(),
                    "Scheduled retention sweep completed"
                );
                last_sweep_day = Some(current_day);
            }
            Err(e) => {
                tracing::error!(error = %e, "Scheduled retention sweep failed");
            }
        }
    }
}

/// Sweep every dataset of `schedule` immediately, in order
pub async fn run_sweep_now(
    sweeper: &RetentionSweeper,
    schedule: &RetentionSchedule,
    now: DateTime<Utc>,
) -> StorageResult<Vec<SweepReport>> {
    let mut reports = Vec::new();
    for plan in schedule.plan(now, sweeper.config.lookback_days) {
        reports.push(sweeper.sweep(&plan).await?);
    }
    Ok(reports)
}
