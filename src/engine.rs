use crate::error::{StorageError, StorageResult};
use crate::models::{
    AggregateParams, AggregateResult, CountParams, CountResult, Dataset, DeleteParams,
    DeleteResult, DistinctParams, DistinctResult, EngineCapabilities, HealthStatus, IngestResult,
    IngestReturningResult, LogQueryParams, LogQueryResult, LogRecord, SegmentInfo,
    ServiceDependencies, ServiceDependencyParams, SpanQueryParams, SpanQueryResult, SpanRecord,
    StoredLogRecord, TimeRange, TopValuesParams, TopValuesResult, TraceQueryParams,
    TraceQueryResult, TraceRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Backend family, chosen once at process start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// PostgreSQL + TimescaleDB hypertables
    Timescale,
    /// ClickHouse MergeTree tables over the HTTP interface
    #[serde(rename = "clickhouse")]
    ClickHouse,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timescale => "timescale",
            Self::ClickHouse => "clickhouse",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "timescale" | "timescaledb" | "postgres" => Ok(Self::Timescale),
            "clickhouse" => Ok(Self::ClickHouse),
            other => Err(format!("unknown storage engine '{}'", other)),
        }
    }
}

/// Uniform log/span/trace persistence contract.
///
/// Each implementation owns its connection lifecycle, translates parameter
/// objects into native queries and maps native rows back into the shared
/// record types. Implementations share no behavior, only this contract.
#[async_trait]
pub trait StorageEngine: Send + Sync + 'static {
    fn kind(&self) -> EngineKind;

    fn capabilities(&self) -> EngineCapabilities;

    async fn connect(&self) -> StorageResult<()>;

    async fn disconnect(&self) -> StorageResult<()>;

    /// Create or upgrade the schema to the latest version
    async fn initialize(&self) -> StorageResult<()>;

    /// Apply schema steps up to `target_version` (latest when `None`), returning the
    /// version now in place
    async fn migrate(&self, target_version: Option<u32>) -> StorageResult<u32>;

    /// Cheap round-trip probe; never fails, errors are reported in the status
    async fn health_check(&self) -> HealthStatus;

    async fn ingest(&self, records: &[LogRecord]) -> StorageResult<IngestResult>;

    async fn ingest_returning(&self, records: &[LogRecord])
        -> StorageResult<IngestReturningResult>;

    async fn query(&self, params: &LogQueryParams) -> StorageResult<LogQueryResult>;

    async fn get_by_id(&self, id: Uuid, project_id: &str)
        -> StorageResult<Option<StoredLogRecord>>;

    async fn get_by_ids(&self, ids: &[Uuid], project_id: &str)
        -> StorageResult<Vec<StoredLogRecord>>;

    async fn count(&self, params: &CountParams) -> StorageResult<CountResult>;

    async fn distinct(&self, params: &DistinctParams) -> StorageResult<DistinctResult>;

    async fn top_values(&self, params: &TopValuesParams) -> StorageResult<TopValuesResult>;

    async fn aggregate(&self, params: &AggregateParams) -> StorageResult<AggregateResult>;

    async fn delete_by_time_range(&self, params: &DeleteParams) -> StorageResult<DeleteResult>;

    /// Insert spans and fold them into their trace aggregates
    async fn ingest_spans(&self, spans: &[SpanRecord]) -> StorageResult<IngestResult>;

    /// Merge `trace` into the stored aggregate for its `(project_id, trace_id)`
    async fn upsert_trace(&self, trace: &TraceRecord) -> StorageResult<()>;

    async fn query_spans(&self, params: &SpanQueryParams) -> StorageResult<SpanQueryResult>;

    async fn query_traces(&self, params: &TraceQueryParams) -> StorageResult<TraceQueryResult>;

    async fn get_spans_by_trace_id(
        &self,
        trace_id: &str,
        project_id: &str,
    ) -> StorageResult<Vec<SpanRecord>>;

    async fn get_trace_by_id(
        &self,
        trace_id: &str,
        project_id: &str,
    ) -> StorageResult<Option<TraceRecord>>;

    async fn get_service_dependencies(
        &self,
        params: &ServiceDependencyParams,
    ) -> StorageResult<ServiceDependencies>;

    async fn delete_spans_by_time_range(
        &self,
        params: &DeleteParams,
    ) -> StorageResult<DeleteResult>;

    /// Segments of `dataset` overlapping `range`
    async fn list_segments(
        &self,
        _dataset: Dataset,
        _range: &TimeRange,
    ) -> StorageResult<Vec<SegmentInfo>> {
        Err(StorageError::Unsupported("segment introspection".to_string()))
    }

    /// Drop every segment of `dataset` entirely older than `older_than`, for all projects
    async fn drop_segments_before(
        &self,
        _dataset: Dataset,
        _older_than: DateTime<Utc>,
    ) -> StorageResult<u64> {
        Err(StorageError::Unsupported("segment drop".to_string()))
    }

    /// Best-effort decompression of compressed segments overlapping `range`.
    /// Returns the number of segments decompressed by this call.
    async fn decompress_segments(
        &self,
        _dataset: Dataset,
        _range: &TimeRange,
    ) -> StorageResult<u64> {
        Ok(0)
    }

    /// Wait for background delete mutations; `true` when none are pending
    async fn wait_for_mutations(&self, _timeout: Duration) -> StorageResult<bool> {
        Ok(true)
    }
}
