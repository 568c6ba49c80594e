//! ClickHouse engine
//!
//! Statements travel over the HTTP interface. Deletes are `ALTER TABLE .. DELETE`
//! mutations that run in the background, so they report `deleted = 0` and
//! callers wait on [`StorageEngine::wait_for_mutations`]. Trace aggregates are
//! computed client-side and written as a new row version.

use super::client::ClickHouseClient;
use super::rows::{
    parse_level, BucketRow, CountRow, EdgeRow, LogRow, PartitionRow, SpanKeyRow, SpanRow,
    TopValueRow, TraceRow, TraceVersionRow, ValueRow, VersionRecord, VersionRow,
};
use super::schema;
use super::translator::{partition_day, ClickHouseTranslator};
use crate::config::StorageConfig;
use crate::cursor;
use crate::engine::{EngineKind, StorageEngine};
use crate::error::{StorageError, StorageResult};
use crate::models::capabilities::ALL_OPERATORS;
use crate::models::{
    partition_valid, AggregateParams, AggregateResult, AggregationInterval, CountParams,
    CountResult, Dataset, DeleteParams, DeleteResult, DistinctParams, DistinctResult,
    EngineCapabilities, HealthStatus, IngestError, IngestResult, IngestReturningResult,
    LogQueryParams, LogQueryResult, LogRecord, SegmentInfo, ServiceDependencies,
    ServiceDependencyParams, SpanQueryParams, SpanQueryResult, SpanRecord, StoredLogRecord,
    TimeBucket, TimeRange, TopValue, TopValuesParams, TopValuesResult, TraceQueryParams,
    TraceQueryResult, TraceRecord,
};
use crate::rollup;
use crate::translate::NativeQuery;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const CAPABILITIES: EngineCapabilities = EngineCapabilities {
    engine: EngineKind::ClickHouse,
    supports_full_text_search: false,
    supports_aggregations: true,
    supports_streaming: true,
    supports_transactions: false,
    max_batch_size: 100_000,
    native_compression: true,
    native_tiering: true,
    async_deletes: true,
    supports_segment_drop: true,
    supported_operators: ALL_OPERATORS,
    supported_intervals: &AggregationInterval::ALL,
};

/// Rows per `INSERT`; each insert is atomic on its own
const ROWS_PER_INSERT: usize = 10_000;

const MUTATION_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

type TraceKey = (String, String);

pub struct ClickHouseEngine {
    config: StorageConfig,
    translator: ClickHouseTranslator,
    client: ArcSwapOption<ClickHouseClient>,
    base_url: Option<String>,
}

impl ClickHouseEngine {
    pub fn new(config: StorageConfig) -> Self {
        let translator =
            ClickHouseTranslator::new(config.connection.database.clone(), config.tables.clone());
        Self {
            config,
            translator,
            client: ArcSwapOption::empty(),
            base_url: None,
        }
    }

    /// Engine talking to an explicit HTTP endpoint instead of `host:port`
    pub fn with_base_url(config: StorageConfig, base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..Self::new(config)
        }
    }

    fn client(&self) -> StorageResult<Arc<ClickHouseClient>> {
        self.client.load_full().ok_or(StorageError::NotConnected)
    }

    fn table(&self, dataset: Dataset) -> &str {
        match dataset {
            Dataset::Logs => &self.translator.tables().logs,
            Dataset::Spans => &self.translator.tables().spans,
        }
    }

    async fn segments(
        &self,
        client: &ClickHouseClient,
        dataset: Dataset,
    ) -> StorageResult<Vec<SegmentInfo>> {
        let native = self.translator.list_partitions(self.table(dataset));
        let rows: Vec<PartitionRow> = client.fetch(&native).await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let (range_start, range_end) = partition_day(&row.partition_id)?;
                Some(SegmentInfo {
                    name: row.partition_id,
                    range_start,
                    range_end,
                    compressed: true,
                    rows: Some(row.rows),
                    bytes: Some(row.bytes),
                })
            })
            .collect())
    }

    /// Insert chunk by chunk; a failed chunk is reported against its own rows only
    async fn write_logs(&self, records: &[LogRecord]) -> StorageResult<IngestReturningResult> {
        let started = Instant::now();
        let client = self.client()?;

        let (accepted, mut errors) = partition_valid(records, LogRecord::validate);
        let mut failed = errors.len();
        let stored: Vec<StoredLogRecord> = accepted
            .into_iter()
            .map(|record| record.clone().with_id(Uuid::new_v4()))
            .collect();

        let insert = self.translator.insert_logs();
        let mut rows = Vec::with_capacity(stored.len());
        for (index, chunk) in stored.chunks(ROWS_PER_INSERT).enumerate() {
            let batch: Vec<LogRow> = chunk.iter().map(LogRow::from).collect();
            match client.insert_rows(&insert, &batch).await {
                Ok(()) => rows.extend_from_slice(chunk),
                Err(e) => {
                    tracing::warn!(error = %e, chunk = index, rows = chunk.len(), "Log chunk insert failed");
                    failed += chunk.len();
                    errors.push(IngestError {
                        index: None,
                        message: format!(
                            "rows {}..{} of accepted batch: {}",
                            index * ROWS_PER_INSERT,
                            index * ROWS_PER_INSERT + chunk.len(),
                            e
                        ),
                    });
                }
            }
        }

        tracing::debug!(ingested = rows.len(), failed, "Inserted log batch");
        Ok(IngestReturningResult {
            ingested: rows.len(),
            failed,
            duration_ms: elapsed_ms(started),
            errors,
            rows,
        })
    }

    /// Spans of the batch whose keys are not stored yet, first occurrence wins
    async fn new_spans<'a>(
        &self,
        client: &ClickHouseClient,
        spans: &[&'a SpanRecord],
    ) -> StorageResult<Vec<&'a SpanRecord>> {
        let (Some(from), Some(to)) = (
            spans.iter().map(|span| span.start_time).min(),
            spans.iter().map(|span| span.start_time).max(),
        ) else {
            return Ok(Vec::new());
        };

        let projects: Vec<String> = unique(spans.iter().map(|span| span.project_id.as_str()));
        let traces: Vec<String> = unique(spans.iter().map(|span| span.trace_id.as_str()));
        let native = self
            .translator
            .existing_span_keys(&projects, &traces, from, to);
        let existing: Vec<SpanKeyRow> = client.fetch(&native).await?;

        let mut seen: HashSet<(String, String, String)> = existing
            .into_iter()
            .map(|key| (key.project_id, key.trace_id, key.span_id))
            .collect();

        Ok(spans
            .iter()
            .copied()
            .filter(|span| {
                seen.insert((
                    span.project_id.clone(),
                    span.trace_id.clone(),
                    span.span_id.clone(),
                ))
            })
            .collect())
    }

    /// Recompute the aggregate of every trace in `spans` from all of its stored
    /// spans and write it as a new version.
    ///
    /// Folding only the spans a call inserted would lose them for good when the
    /// trace write fails, since a retry finds them stored and skips them.
    async fn rebuild_traces(
        &self,
        client: &ClickHouseClient,
        spans: &[&SpanRecord],
    ) -> StorageResult<()> {
        let touched: HashSet<TraceKey> = spans
            .iter()
            .map(|span| (span.project_id.clone(), span.trace_id.clone()))
            .collect();
        let projects = unique(spans.iter().map(|span| span.project_id.as_str()));
        let trace_ids = unique(spans.iter().map(|span| span.trace_id.as_str()));

        let stored_spans = client
            .fetch::<SpanRow>(&self.translator.spans_of_traces(&projects, &trace_ids))
            .await?
            .into_iter()
            .map(SpanRecord::try_from)
            .collect::<StorageResult<Vec<_>>>()?;
        let stored: Vec<TraceRow> = client
            .fetch(&self.translator.traces_by_keys(&projects, &trace_ids))
            .await?;
        let mut previous: BTreeMap<TraceKey, TraceRecord> = stored
            .into_iter()
            .map(TraceRecord::from)
            .map(|trace| ((trace.project_id.clone(), trace.trace_id.clone()), trace))
            .collect();

        let rebuilt: Vec<TraceRecord> = rollup::fold_spans(&stored_spans)
            .into_iter()
            .filter_map(|mut trace| {
                let key = (trace.project_id.clone(), trace.trace_id.clone());
                if !touched.contains(&key) {
                    return None;
                }
                if let Some(previous) = previous.remove(&key) {
                    trace.reconcile(&previous);
                }
                Some(trace)
            })
            .collect();
        if rebuilt.is_empty() {
            return Ok(());
        }

        let updated_at = Utc::now();
        let versions: Vec<TraceVersionRow<'_>> = rebuilt
            .iter()
            .map(|trace| TraceVersionRow::new(trace, updated_at))
            .collect();

        tracing::debug!(traces = versions.len(), "Rebuilt trace aggregates");
        client
            .insert_rows(&self.translator.insert_traces(), &versions)
            .await
    }

    /// Merge partial aggregates into their stored versions and write the results
    async fn merge_traces(
        &self,
        client: &ClickHouseClient,
        partials: Vec<TraceRecord>,
    ) -> StorageResult<()> {
        if partials.is_empty() {
            return Ok(());
        }

        let projects = unique(partials.iter().map(|t| t.project_id.as_str()));
        let trace_ids = unique(partials.iter().map(|t| t.trace_id.as_str()));
        let stored: Vec<TraceRow> = client
            .fetch(&self.translator.traces_by_keys(&projects, &trace_ids))
            .await?;

        let mut merged: BTreeMap<TraceKey, TraceRecord> = stored
            .into_iter()
            .map(TraceRecord::from)
            .map(|trace| ((trace.project_id.clone(), trace.trace_id.clone()), trace))
            .collect();
        let mut touched: Vec<TraceKey> = Vec::with_capacity(partials.len());

        for partial in partials {
            let key = (partial.project_id.clone(), partial.trace_id.clone());
            match merged.get_mut(&key) {
                Some(existing) => existing.merge(&partial),
                None => {
                    merged.insert(key.clone(), partial);
                }
            }
            touched.push(key);
        }

        let updated_at = Utc::now();
        let versions: Vec<TraceVersionRow<'_>> = touched
            .iter()
            .filter_map(|key| merged.get(key))
            .map(|trace| TraceVersionRow::new(trace, updated_at))
            .collect();

        client
            .insert_rows(&self.translator.insert_traces(), &versions)
            .await
    }
}

fn unique<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .filter(|value| seen.insert(*value))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl StorageEngine for ClickHouseEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::ClickHouse
    }

    fn capabilities(&self) -> EngineCapabilities {
        CAPABILITIES
    }

    async fn connect(&self) -> StorageResult<()> {
        if self.client.load().is_some() {
            return Ok(());
        }

        let client = match &self.base_url {
            Some(url) => ClickHouseClient::with_base_url(&self.config, url.clone())?,
            None => ClickHouseClient::new(&self.config)?,
        };
        client.ping().await?;

        tracing::info!(
            url = %client.base_url(),
            database = %self.translator.database(),
            "Connected to ClickHouse"
        );

        self.client.store(Some(Arc::new(client)));
        Ok(())
    }

    async fn disconnect(&self) -> StorageResult<()> {
        if self.client.swap(None).is_some() {
            tracing::info!("Disconnected from ClickHouse");
        }
        Ok(())
    }

    async fn initialize(&self) -> StorageResult<()> {
        self.migrate(None).await.map(|_| ())
    }

    async fn migrate(&self, target_version: Option<u32>) -> StorageResult<u32> {
        let client = self.client()?;
        let latest = schema::latest_version();
        let target = target_version.unwrap_or(latest);
        if target > latest {
            return Err(StorageError::InvalidParams(format!(
                "schema version {} does not exist (latest is {})",
                target, latest
            )));
        }

        client
            .execute(&NativeQuery::new(schema::create_database(&self.translator)))
            .await?;
        client
            .execute(&NativeQuery::new(schema::version_table_ddl(&self.translator)))
            .await?;
        let current = client
            .fetch_one::<VersionRow>(&NativeQuery::new(schema::current_version_query(
                &self.translator,
            )))
            .await?
            .map_or(0, |row| row.version as u32);

        if target < current {
            return Err(StorageError::InvalidParams(format!(
                "schema is at version {}, downgrading to {} is not supported",
                current, target
            )));
        }

        // Statements are idempotent, a half-applied step reruns cleanly
        for migration in schema::pending(current, target) {
            for statement in (migration.statements)(&self.translator) {
                client.execute(&NativeQuery::new(statement)).await?;
            }
            client
                .insert_rows(
                    &schema::record_version(&self.translator),
                    &[VersionRecord {
                        version: migration.version,
                        description: migration.description,
                    }],
                )
                .await?;

            tracing::info!(
                version = migration.version,
                description = migration.description,
                "Applied schema migration"
            );
        }

        Ok(target.max(current))
    }

    async fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        let client = match self.client() {
            Ok(client) => client,
            Err(e) => return HealthStatus::failed(started.elapsed(), e),
        };

        match client.ping().await {
            Ok(()) => HealthStatus::from_latency(started.elapsed()),
            Err(e) => HealthStatus::failed(started.elapsed(), e),
        }
    }

    async fn ingest(&self, records: &[LogRecord]) -> StorageResult<IngestResult> {
        self.write_logs(records).await.map(IngestResult::from)
    }

    async fn ingest_returning(
        &self,
        records: &[LogRecord],
    ) -> StorageResult<IngestReturningResult> {
        self.write_logs(records).await
    }

    async fn query(&self, params: &LogQueryParams) -> StorageResult<LogQueryResult> {
        let client = self.client()?;
        let native = self.translator.query_logs(params)?;

        let logs = client
            .fetch::<LogRow>(&native)
            .await?
            .into_iter()
            .map(StoredLogRecord::try_from)
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(cursor::into_page(logs, params))
    }

    async fn get_by_id(
        &self,
        id: Uuid,
        project_id: &str,
    ) -> StorageResult<Option<StoredLogRecord>> {
        let client = self.client()?;
        let native = self.translator.get_log_by_id(id, project_id);

        client
            .fetch_one::<LogRow>(&native)
            .await?
            .map(StoredLogRecord::try_from)
            .transpose()
    }

    async fn get_by_ids(
        &self,
        ids: &[Uuid],
        project_id: &str,
    ) -> StorageResult<Vec<StoredLogRecord>> {
        let client = self.client()?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let native = self.translator.get_logs_by_ids(ids, project_id);

        client
            .fetch::<LogRow>(&native)
            .await?
            .into_iter()
            .map(StoredLogRecord::try_from)
            .collect()
    }

    async fn count(&self, params: &CountParams) -> StorageResult<CountResult> {
        let client = self.client()?;
        let native = self.translator.count_logs(params);

        let count = client
            .fetch_one::<CountRow>(&native)
            .await?
            .map_or(0, |row| row.count);
        Ok(CountResult { count })
    }

    async fn distinct(&self, params: &DistinctParams) -> StorageResult<DistinctResult> {
        let client = self.client()?;
        let native = self.translator.distinct_values(params);

        let values = client
            .fetch::<ValueRow>(&native)
            .await?
            .into_iter()
            .filter_map(|row| row.value)
            .collect();

        Ok(DistinctResult { values })
    }

    async fn top_values(&self, params: &TopValuesParams) -> StorageResult<TopValuesResult> {
        let client = self.client()?;
        let native = self.translator.top_values(params);

        let values = client
            .fetch::<TopValueRow>(&native)
            .await?
            .into_iter()
            .filter_map(|row| {
                row.value.map(|value| TopValue {
                    value,
                    count: row.count,
                })
            })
            .collect();

        Ok(TopValuesResult { values })
    }

    async fn aggregate(&self, params: &AggregateParams) -> StorageResult<AggregateResult> {
        let client = self.client()?;
        let native = self.translator.aggregate(params);

        let rows = client
            .fetch::<BucketRow>(&native)
            .await?
            .into_iter()
            .map(|row| Ok((row.bucket, parse_level(&row.level)?, row.count)))
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(AggregateResult::from_buckets(TimeBucket::fold(rows)))
    }

    async fn delete_by_time_range(&self, params: &DeleteParams) -> StorageResult<DeleteResult> {
        let client = self.client()?;
        let native = self.translator.delete_logs(params);

        client.execute(&native).await?;
        tracing::debug!(projects = params.project_ids.len(), "Scheduled log delete mutation");
        Ok(DeleteResult { deleted: 0 })
    }

    async fn ingest_spans(&self, spans: &[SpanRecord]) -> StorageResult<IngestResult> {
        let started = Instant::now();
        let client = self.client()?;

        let (accepted, rejected) = partition_valid(spans, SpanRecord::validate);
        if accepted.is_empty() {
            return Ok(IngestResult {
                failed: rejected.len(),
                duration_ms: elapsed_ms(started),
                errors: rejected,
                ..Default::default()
            });
        }

        let attempted = accepted.len();
        let written = async {
            let new_spans = self.new_spans(&client, &accepted).await?;
            let rows = new_spans
                .iter()
                .map(|span| SpanRow::from_span(span))
                .collect::<StorageResult<Vec<_>>>()?;
            let insert = self.translator.insert_spans();
            for chunk in rows.chunks(ROWS_PER_INSERT) {
                client.insert_rows(&insert, chunk).await?;
            }
            Ok::<_, StorageError>(())
        }
        .await;

        if let Err(e) = written {
            tracing::warn!(error = %e, spans = attempted, "Span batch insert failed");
            return Ok(IngestResult::batch_failed(
                rejected,
                attempted,
                e.to_string(),
                elapsed_ms(started),
            ));
        }

        if let Err(e) = self.rebuild_traces(&client, &accepted).await {
            tracing::warn!(error = %e, "Trace aggregate rebuild failed");
            return Ok(IngestResult::batch_failed(
                rejected,
                attempted,
                format!("spans stored but traces not rebuilt: {}", e),
                elapsed_ms(started),
            ));
        }

        Ok(IngestResult {
            ingested: attempted,
            failed: rejected.len(),
            duration_ms: elapsed_ms(started),
            errors: rejected,
        })
    }

    async fn upsert_trace(&self, trace: &TraceRecord) -> StorageResult<()> {
        let client = self.client()?;
        self.merge_traces(&client, vec![trace.clone()]).await
    }

    async fn query_spans(&self, params: &SpanQueryParams) -> StorageResult<SpanQueryResult> {
        let client = self.client()?;
        let (page, count) = self.translator.query_spans(params);

        let spans = client
            .fetch::<SpanRow>(&page)
            .await?
            .into_iter()
            .map(SpanRecord::try_from)
            .collect::<StorageResult<Vec<_>>>()?;
        let total = client
            .fetch_one::<CountRow>(&count)
            .await?
            .map_or(0, |row| row.count);

        Ok(SpanQueryResult {
            has_more: (params.offset + spans.len()) < total as usize,
            spans,
            total,
            limit: params.limit,
            offset: params.offset,
        })
    }

    async fn query_traces(&self, params: &TraceQueryParams) -> StorageResult<TraceQueryResult> {
        let client = self.client()?;
        let (page, count) = self.translator.query_traces(params);

        let traces: Vec<TraceRecord> = client
            .fetch::<TraceRow>(&page)
            .await?
            .into_iter()
            .map(TraceRecord::from)
            .collect();
        let total = client
            .fetch_one::<CountRow>(&count)
            .await?
            .map_or(0, |row| row.count);

        Ok(TraceQueryResult {
            has_more: (params.offset + traces.len()) < total as usize,
            traces,
            total,
            limit: params.limit,
            offset: params.offset,
        })
    }

    async fn get_spans_by_trace_id(
        &self,
        trace_id: &str,
        project_id: &str,
    ) -> StorageResult<Vec<SpanRecord>> {
        let client = self.client()?;
        let native = self.translator.spans_by_trace_id(trace_id, project_id);

        client
            .fetch::<SpanRow>(&native)
            .await?
            .into_iter()
            .map(SpanRecord::try_from)
            .collect()
    }

    async fn get_trace_by_id(
        &self,
        trace_id: &str,
        project_id: &str,
    ) -> StorageResult<Option<TraceRecord>> {
        let client = self.client()?;
        let native = self.translator.trace_by_id(trace_id, project_id);

        Ok(client
            .fetch_one::<TraceRow>(&native)
            .await?
            .map(TraceRecord::from))
    }

    async fn get_service_dependencies(
        &self,
        params: &ServiceDependencyParams,
    ) -> StorageResult<ServiceDependencies> {
        let client = self.client()?;
        let native = self.translator.service_dependencies(params);

        let edges = client
            .fetch::<EdgeRow>(&native)
            .await?
            .into_iter()
            .map(|row| (row.source, row.target, row.call_count));

        Ok(rollup::dependency_graph(edges))
    }

    async fn delete_spans_by_time_range(
        &self,
        params: &DeleteParams,
    ) -> StorageResult<DeleteResult> {
        let client = self.client()?;
        let (spans, traces) = self.translator.delete_spans(params);

        client.execute(&spans).await?;
        client.execute(&traces).await?;
        tracing::debug!(projects = params.project_ids.len(), "Scheduled span delete mutations");
        Ok(DeleteResult { deleted: 0 })
    }

    async fn list_segments(
        &self,
        dataset: Dataset,
        range: &TimeRange,
    ) -> StorageResult<Vec<SegmentInfo>> {
        let client = self.client()?;
        Ok(self
            .segments(&client, dataset)
            .await?
            .into_iter()
            .filter(|segment| segment.range_start <= range.to && segment.range_end > range.from)
            .collect())
    }

    async fn drop_segments_before(
        &self,
        dataset: Dataset,
        older_than: DateTime<Utc>,
    ) -> StorageResult<u64> {
        let client = self.client()?;
        let table = self.table(dataset);

        let mut dropped = 0;
        for segment in self.segments(&client, dataset).await? {
            if segment.range_end > older_than {
                continue;
            }
            let native = self.translator.drop_partition(table, &segment.name)?;
            client.execute(&native).await?;
            dropped += 1;
        }

        // Trace aggregates are not partitioned; they follow their spans by mutation
        if dataset == Dataset::Spans && dropped > 0 {
            client
                .execute(&self.translator.delete_traces_before(older_than))
                .await?;
        }

        tracing::info!(%dataset, dropped, older_than = %older_than, "Dropped partitions");
        Ok(dropped)
    }

    async fn wait_for_mutations(&self, timeout: Duration) -> StorageResult<bool> {
        let client = self.client()?;
        let native = self.translator.pending_mutations();
        let deadline = Instant::now() + timeout;

        loop {
            let pending = client
                .fetch_one::<CountRow>(&native)
                .await?
                .map_or(0, |row| row.count);
            if pending == 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                tracing::warn!(pending, timeout_secs = timeout.as_secs(), "Mutations still running");
                return Ok(false);
            }
            tracing::debug!(pending, "Waiting for mutations");
            tokio::time::sleep(MUTATION_POLL_INTERVAL.min(timeout)).await;
        }
    }
}
