use crate::engine::EngineKind;
use crate::models::Dataset;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;

/// Register metric descriptions with whatever recorder the host installed
/// (can be called multiple times safely)
pub fn describe_metrics() {
    describe_counter!(
        "reservoir_operations_total",
        "Total number of storage operations by outcome"
    );
    describe_histogram!(
        "reservoir_operation_duration_seconds",
        "Storage operation duration in seconds"
    );
    describe_counter!(
        "reservoir_rows_ingested_total",
        "Total number of rows accepted by the storage engine"
    );
    describe_counter!(
        "reservoir_retention_deleted_total",
        "Rows removed by retention sweeps (estimated on async-delete engines)"
    );
}

/// Record one storage call
pub fn record_operation(engine: EngineKind, operation: &'static str, ok: bool, duration: Duration) {
    counter!(
        "reservoir_operations_total",
        "engine" => engine.as_str(),
        "operation" => operation,
        "outcome" => if ok { "success" } else { "error" },
    )
    .increment(1);

    histogram!(
        "reservoir_operation_duration_seconds",
        "engine" => engine.as_str(),
        "operation" => operation,
    )
    .record(duration.as_secs_f64());
}

/// Record rows accepted by an ingest call
pub fn record_ingested(engine: EngineKind, dataset: Dataset, rows: usize) {
    counter!(
        "reservoir_rows_ingested_total",
        "engine" => engine.as_str(),
        "dataset" => dataset.to_string(),
    )
    .increment(rows as u64);
}

/// Record rows removed by a retention sweep
pub fn record_retention(engine: EngineKind, dataset: Dataset, rows: u64) {
    counter!(
        "reservoir_retention_deleted_total",
        "engine" => engine.as_str(),
        "dataset" => dataset.to_string(),
    )
    .increment(rows);
}
