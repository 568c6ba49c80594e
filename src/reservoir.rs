//! The single storage entry point
//!
//! [`Reservoir`] picks one engine from configuration at startup and forwards every
//! call to it. On the way it validates parameters before any backend round trip,
//! splits ingest batches to the engine's maximum batch size, records metrics and
//! tags engine errors with the engine name.

use crate::clickhouse::ClickHouseEngine;
use crate::config::StorageConfig;
use crate::engine::{EngineKind, StorageEngine};
use crate::error::{StorageError, StorageResult};
use crate::metrics;
use crate::models::{
    AggregateParams, AggregateResult, CountParams, CountResult, Dataset, DeleteParams,
    DeleteResult, DistinctParams, DistinctResult, EngineCapabilities, HealthStatus, IngestError,
    IngestResult, IngestReturningResult, LogQueryParams, LogQueryResult, LogRecord, SegmentInfo,
    ServiceDependencies, ServiceDependencyParams, SpanQueryParams, SpanQueryResult, SpanRecord,
    StoredLogRecord, TimeRange, TopValuesParams, TopValuesResult, TraceQueryParams,
    TraceQueryResult, TraceRecord,
};
use crate::timescale::TimescaleEngine;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Clone)]
pub struct Reservoir {
    engine: Arc<dyn StorageEngine>,
    skip_initialize: bool,
}

impl Reservoir {
    /// Build the engine selected by `config.engine`; nothing is connected yet
    pub fn from_config(config: &StorageConfig) -> Self {
        metrics::describe_metrics();

        let engine: Arc<dyn StorageEngine> = match config.engine {
            EngineKind::Timescale => Arc::new(TimescaleEngine::new(config.clone())),
            EngineKind::ClickHouse => Arc::new(ClickHouseEngine::new(config.clone())),
        };

        Self {
            engine,
            skip_initialize: config.skip_initialize,
        }
    }

    pub fn with_engine(engine: Arc<dyn StorageEngine>) -> Self {
        Self {
            engine,
            skip_initialize: false,
        }
    }

    /// Connect, then create or upgrade the schema unless `skip_initialize` is set
    pub async fn open(config: &StorageConfig) -> StorageResult<Self> {
        let reservoir = Self::from_config(config);
        reservoir.connect().await?;
        reservoir.initialize().await?;
        Ok(reservoir)
    }

    pub fn kind(&self) -> EngineKind {
        self.engine.kind()
    }

    pub fn capabilities(&self) -> EngineCapabilities {
        self.engine.capabilities()
    }

    async fn observe<T, F>(&self, operation: &'static str, call: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        let kind = self.kind();
        let started = Instant::now();
        let result = call.await;
        let elapsed = started.elapsed();

        metrics::record_operation(kind, operation, result.is_ok(), elapsed);
        match result {
            Ok(value) => {
                tracing::debug!(
                    engine = %kind,
                    operation,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Storage call completed"
                );
                Ok(value)
            }
            Err(e) => {
                tracing::debug!(
                    engine = %kind,
                    operation,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "Storage call failed"
                );
                Err(e.tagged(kind))
            }
        }
    }

    fn batch_size(&self) -> usize {
        self.capabilities().max_batch_size.max(1)
    }

    pub async fn connect(&self) -> StorageResult<()> {
        self.observe("connect", self.engine.connect()).await?;
        tracing::info!(engine = %self.kind(), "Storage engine connected");
        Ok(())
    }

    pub async fn disconnect(&self) -> StorageResult<()> {
        self.observe("disconnect", self.engine.disconnect()).await
    }

    pub async fn initialize(&self) -> StorageResult<()> {
        if self.skip_initialize {
            tracing::info!(engine = %self.kind(), "Schema initialization skipped");
            return Ok(());
        }
        self.observe("initialize", self.engine.initialize()).await
    }

    pub async fn migrate(&self, target_version: Option<u32>) -> StorageResult<u32> {
        self.observe("migrate", self.engine.migrate(target_version))
            .await
    }

    pub async fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        let status = self.engine.health_check().await;
        metrics::record_operation(
            self.kind(),
            "health_check",
            status.connected,
            started.elapsed(),
        );
        status
    }

    pub async fn ingest(&self, records: &[LogRecord]) -> StorageResult<IngestResult> {
        self.ingest_returning_inner("ingest", records)
            .await
            .map(IngestResult::from)
    }

    pub async fn ingest_returning(
        &self,
        records: &[LogRecord],
    ) -> StorageResult<IngestReturningResult> {
        self.ingest_returning_inner("ingest_returning", records)
            .await
    }

    async fn ingest_returning_inner(
        &self,
        operation: &'static str,
        records: &[LogRecord],
    ) -> StorageResult<IngestReturningResult> {
        let mut total = IngestReturningResult::default();

        for (index, chunk) in records.chunks(self.batch_size()).enumerate() {
            let offset = index * self.batch_size();
            let chunk: Vec<LogRecord> = chunk.iter().map(LogRecord::at_storage_precision).collect();
            let result = self
                .observe(operation, self.engine.ingest_returning(&chunk))
                .await?;

            total.ingested += result.ingested;
            total.failed += result.failed;
            total.duration_ms += result.duration_ms;
            total.errors.extend(shift_errors(result.errors, offset));
            total.rows.extend(result.rows);
        }

        metrics::record_ingested(self.kind(), Dataset::Logs, total.ingested);
        Ok(total)
    }

    pub async fn query(&self, params: &LogQueryParams) -> StorageResult<LogQueryResult> {
        params.validate()?;
        self.observe("query", self.engine.query(params)).await
    }

    pub async fn get_by_id(
        &self,
        id: Uuid,
        project_id: &str,
    ) -> StorageResult<Option<StoredLogRecord>> {
        require_project(project_id)?;
        self.observe("get_by_id", self.engine.get_by_id(id, project_id))
            .await
    }

    pub async fn get_by_ids(
        &self,
        ids: &[Uuid],
        project_id: &str,
    ) -> StorageResult<Vec<StoredLogRecord>> {
        require_project(project_id)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.observe("get_by_ids", self.engine.get_by_ids(ids, project_id))
            .await
    }

    pub async fn count(&self, params: &CountParams) -> StorageResult<CountResult> {
        params.validate()?;
        self.observe("count", self.engine.count(params)).await
    }

    pub async fn distinct(&self, params: &DistinctParams) -> StorageResult<DistinctResult> {
        params.validate()?;
        self.observe("distinct", self.engine.distinct(params)).await
    }

    pub async fn top_values(&self, params: &TopValuesParams) -> StorageResult<TopValuesResult> {
        params.validate()?;
        self.observe("top_values", self.engine.top_values(params))
            .await
    }

    pub async fn aggregate(&self, params: &AggregateParams) -> StorageResult<AggregateResult> {
        params.validate()?;
        if !self.capabilities().supports_interval(params.interval) {
            return Err(StorageError::Unsupported(format!(
                "aggregation interval '{}'",
                params.interval.as_str()
            ))
            .tagged(self.kind()));
        }
        self.observe("aggregate", self.engine.aggregate(params)).await
    }

    pub async fn delete_by_time_range(&self, params: &DeleteParams) -> StorageResult<DeleteResult> {
        params.validate()?;
        self.observe("delete_by_time_range", self.engine.delete_by_time_range(params))
            .await
    }

    pub async fn ingest_spans(&self, spans: &[SpanRecord]) -> StorageResult<IngestResult> {
        let mut total = IngestResult::default();

        for (index, chunk) in spans.chunks(self.batch_size()).enumerate() {
            let offset = index * self.batch_size();
            let chunk: Vec<SpanRecord> = chunk.iter().map(SpanRecord::at_storage_precision).collect();
            let result = self
                .observe("ingest_spans", self.engine.ingest_spans(&chunk))
                .await?;

            total.ingested += result.ingested;
            total.failed += result.failed;
            total.duration_ms += result.duration_ms;
            total.errors.extend(shift_errors(result.errors, offset));
        }

        metrics::record_ingested(self.kind(), Dataset::Spans, total.ingested);
        Ok(total)
    }

    pub async fn upsert_trace(&self, trace: &TraceRecord) -> StorageResult<()> {
        if trace.start_time > trace.end_time {
            return Err(StorageError::InvalidParams(format!(
                "trace {} ends before it starts",
                trace.trace_id
            )));
        }
        require_project(&trace.project_id)?;
        self.observe("upsert_trace", self.engine.upsert_trace(trace))
            .await
    }

    pub async fn query_spans(&self, params: &SpanQueryParams) -> StorageResult<SpanQueryResult> {
        params.validate()?;
        self.observe("query_spans", self.engine.query_spans(params))
            .await
    }

    pub async fn query_traces(&self, params: &TraceQueryParams) -> StorageResult<TraceQueryResult> {
        params.validate()?;
        self.observe("query_traces", self.engine.query_traces(params))
            .await
    }

    pub async fn get_spans_by_trace_id(
        &self,
        trace_id: &str,
        project_id: &str,
    ) -> StorageResult<Vec<SpanRecord>> {
        require_project(project_id)?;
        self.observe(
            "get_spans_by_trace_id",
            self.engine.get_spans_by_trace_id(trace_id, project_id),
        )
        .await
    }

    pub async fn get_trace_by_id(
        &self,
        trace_id: &str,
        project_id: &str,
    ) -> StorageResult<Option<TraceRecord>> {
        require_project(project_id)?;
        self.observe(
            "get_trace_by_id",
            self.engine.get_trace_by_id(trace_id, project_id),
        )
        .await
    }

    pub async fn get_service_dependencies(
        &self,
        params: &ServiceDependencyParams,
    ) -> StorageResult<ServiceDependencies> {
        params.validate()?;
        self.observe(
            "get_service_dependencies",
            self.engine.get_service_dependencies(params),
        )
        .await
    }

    pub async fn delete_spans_by_time_range(
        &self,
        params: &DeleteParams,
    ) -> StorageResult<DeleteResult> {
        params.validate()?;
        self.observe(
            "delete_spans_by_time_range",
            self.engine.delete_spans_by_time_range(params),
        )
        .await
    }

    pub async fn list_segments(
        &self,
        dataset: Dataset,
        range: &TimeRange,
    ) -> StorageResult<Vec<SegmentInfo>> {
        range.validate()?;
        self.observe("list_segments", self.engine.list_segments(dataset, range))
            .await
    }

    pub async fn drop_segments_before(
        &self,
        dataset: Dataset,
        older_than: DateTime<Utc>,
    ) -> StorageResult<u64> {
        self.observe(
            "drop_segments_before",
            self.engine.drop_segments_before(dataset, older_than),
        )
        .await
    }

    pub async fn decompress_segments(
        &self,
        dataset: Dataset,
        range: &TimeRange,
    ) -> StorageResult<u64> {
        range.validate()?;
        self.observe(
            "decompress_segments",
            self.engine.decompress_segments(dataset, range),
        )
        .await
    }

    pub async fn wait_for_mutations(&self, timeout: Duration) -> StorageResult<bool> {
        self.observe("wait_for_mutations", self.engine.wait_for_mutations(timeout))
            .await
    }
}

fn require_project(project_id: &str) -> StorageResult<()> {
    if project_id.trim().is_empty() {
        return Err(StorageError::InvalidParams(
            "project_id is required".to_string(),
        ));
    }
    Ok(())
}

/// Re-base per-chunk row indices onto the caller's batch
fn shift_errors(errors: Vec<IngestError>, offset: usize) -> impl Iterator<Item = IngestError> {
    errors.into_iter().map(move |error| IngestError {
        index: error.index.map(|index| index + offset),
        ..error
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::create_test_config;

    #[test]
    fn test_from_config_selects_engine() {
        let config = create_test_config(EngineKind::ClickHouse);
        let reservoir = Reservoir::from_config(&config.storage);
        assert_eq!(reservoir.kind(), EngineKind::ClickHouse);
        assert!(reservoir.capabilities().async_deletes);

        let config = create_test_config(EngineKind::Timescale);
        let reservoir = Reservoir::from_config(&config.storage);
        assert_eq!(reservoir.kind(), EngineKind::Timescale);
        assert!(reservoir.capabilities().supports_full_text_search);
    }

    #[derive(Default)]
    struct DescriptionRecorder {
        described: std::sync::Mutex<Vec<String>>,
    }

    impl DescriptionRecorder {
        fn note(&self, key: ::metrics::KeyName) {
            if let Ok(mut described) = self.described.lock() {
                described.push(key.as_str().to_string());
            }
        }
    }

    impl ::metrics::Recorder for DescriptionRecorder {
        fn describe_counter(&self, key: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {
            self.note(key);
        }

        fn describe_gauge(&self, key: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {
            self.note(key);
        }

        fn describe_histogram(&self, key: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {
            self.note(key);
        }

        fn register_counter(&self, _: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Counter {
            ::metrics::Counter::noop()
        }

        fn register_gauge(&self, _: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Gauge {
            ::metrics::Gauge::noop()
        }

        fn register_histogram(&self, _: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Histogram {
            ::metrics::Histogram::noop()
        }
    }

    #[test]
    fn test_from_config_describes_metrics() {
        let recorder = DescriptionRecorder::default();
        let config = create_test_config(EngineKind::Timescale);

        ::metrics::with_local_recorder(&recorder, || Reservoir::from_config(&config.storage));

        let described = recorder.described.lock().unwrap();
        assert!(described.iter().any(|name| name == "reservoir_operations_total"));
        assert!(described.iter().any(|name| name == "reservoir_rows_ingested_total"));
    }

    #[test]
    fn test_shift_errors_rebases_indices() {
        let errors = vec![
            IngestError {
                index: Some(2),
                message: "bad".to_string(),
            },
            IngestError {
                index: None,
                message: "chunk failed".to_string(),
            },
        ];
        let shifted: Vec<_> = shift_errors(errors, 100).collect();
        assert_eq!(shifted[0].index, Some(102));
        assert_eq!(shifted[1].index, None);
    }

    #[tokio::test]
    async fn test_not_connected_is_tagged() {
        let config = create_test_config(EngineKind::Timescale);
        let reservoir = Reservoir::from_config(&config.storage);

        let err = reservoir.migrate(None).await.unwrap_err();
        assert!(err.is_not_connected());
        assert_eq!(err.engine(), Some(EngineKind::Timescale));
    }

    #[tokio::test]
    async fn test_invalid_params_fail_before_engine() {
        let config = create_test_config(EngineKind::ClickHouse);
        let reservoir = Reservoir::from_config(&config.storage);
        let now = Utc::now();

        // Not connected, so reaching the engine would report NotConnected instead
        let err = reservoir
            .delete_by_time_range(&DeleteParams::new(vec![], now - chrono::Duration::days(1), now))
            .await
            .unwrap_err();
        assert!(err.is_invalid_params());
        assert!(err.engine().is_none());
    }
}
