//! PostgreSQL + TimescaleDB engine
//!
//! Runs statements built by [`TimescaleTranslator`] on a sqlx connection pool.
//! Deletes are synchronous and report exact counts; trace aggregates are
//! merged in place with `INSERT .. ON CONFLICT DO UPDATE`.

use super::schema::{self, VERSION_TABLE};
use super::translator::{
    TimescaleTranslator, LOG_ROWS_PER_STATEMENT, SPAN_ROWS_PER_STATEMENT,
};
use crate::config::StorageConfig;
use crate::cursor;
use crate::engine::{EngineKind, StorageEngine};
use crate::error::{StorageError, StorageResult};
use crate::models::capabilities::ALL_OPERATORS;
use crate::models::{
    partition_valid, AggregateParams, AggregateResult, AggregationInterval, CountParams,
    CountResult, Dataset, DeleteParams, DeleteResult, DistinctParams, DistinctResult,
    EngineCapabilities, HealthStatus, IngestResult, IngestReturningResult, LogLevel,
    LogQueryParams, LogQueryResult, LogRecord, SegmentInfo, ServiceDependencies,
    ServiceDependencyParams, SpanEvent, SpanLink, SpanQueryParams, SpanQueryResult, SpanRecord,
    StoredLogRecord, TimeBucket, TimeRange, TopValue, TopValuesParams, TopValuesResult,
    TraceQueryParams, TraceQueryResult, TraceRecord,
};
use crate::rollup;
use crate::translate::{NativeQuery, SqlValue};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::query::Query;
use sqlx::Row;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

const CAPABILITIES: EngineCapabilities = EngineCapabilities {
    engine: EngineKind::Timescale,
    supports_full_text_search: true,
    supports_aggregations: true,
    supports_streaming: false,
    supports_transactions: true,
    max_batch_size: 50_000,
    native_compression: true,
    native_tiering: false,
    async_deletes: false,
    supports_segment_drop: true,
    supported_operators: ALL_OPERATORS,
    supported_intervals: &AggregationInterval::ALL,
};

type PgQuery<'q> = Query<'q, sqlx::Postgres, PgArguments>;

fn bind_params<'q>(mut query: PgQuery<'q>, params: &[SqlValue]) -> PgQuery<'q> {
    for value in params {
        query = match value {
            SqlValue::Text(v) => query.bind(v.clone()),
            SqlValue::NullableText(v) => query.bind(v.clone()),
            SqlValue::TextArray(v) => query.bind(v.clone()),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::Timestamp(v) => query.bind(*v),
            SqlValue::Uuid(v) => query.bind(*v),
            SqlValue::UuidArray(v) => query.bind(v.clone()),
            SqlValue::Json(v) => query.bind(v.clone().map(sqlx::types::Json)),
        };
    }
    query
}

fn prepare(native: &NativeQuery) -> PgQuery<'_> {
    bind_params(sqlx::query(&native.text), &native.params)
}

fn decode_error(column: &str, message: impl std::fmt::Display) -> StorageError {
    StorageError::Database(sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: message.to_string().into(),
    })
}

fn parse_column<T>(row: &PgRow, column: &str) -> StorageResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e| decode_error(column, e))
}

fn parse_optional<T>(row: &PgRow, column: &str) -> StorageResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| value.parse().map_err(|e| decode_error(column, e)))
        .transpose()
}

fn log_from_row(row: &PgRow) -> StorageResult<StoredLogRecord> {
    Ok(StoredLogRecord {
        id: row.try_get("id")?,
        record: LogRecord {
            time: row.try_get("time")?,
            project_id: row.try_get("project_id")?,
            service: row.try_get("service")?,
            level: parse_column(row, "level")?,
            message: row.try_get("message")?,
            metadata: row.try_get("metadata")?,
            trace_id: row.try_get("trace_id")?,
            span_id: row.try_get("span_id")?,
            hostname: row.try_get("hostname")?,
        },
    })
}

fn span_from_row(row: &PgRow) -> StorageResult<SpanRecord> {
    let events: Option<serde_json::Value> = row.try_get("events")?;
    let links: Option<serde_json::Value> = row.try_get("links")?;
    let events: Vec<SpanEvent> = match events {
        Some(value) => serde_json::from_value(value)?,
        None => Vec::new(),
    };
    let links: Vec<SpanLink> = match links {
        Some(value) => serde_json::from_value(value)?,
        None => Vec::new(),
    };

    Ok(SpanRecord {
        project_id: row.try_get("project_id")?,
        trace_id: row.try_get("trace_id")?,
        span_id: row.try_get("span_id")?,
        parent_span_id: row.try_get("parent_span_id")?,
        service_name: row.try_get("service_name")?,
        operation_name: row.try_get("operation_name")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        duration_ms: row.try_get("duration_ms")?,
        kind: parse_optional(row, "kind")?,
        status_code: parse_optional(row, "status_code")?,
        status_message: row.try_get("status_message")?,
        attributes: row.try_get("attributes")?,
        events,
        links,
        resource_attributes: row.try_get("resource_attributes")?,
    })
}

fn trace_from_row(row: &PgRow) -> StorageResult<TraceRecord> {
    Ok(TraceRecord {
        project_id: row.try_get("project_id")?,
        trace_id: row.try_get("trace_id")?,
        service_name: row.try_get("service_name")?,
        root_service_name: row.try_get("root_service_name")?,
        root_operation_name: row.try_get("root_operation_name")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        duration_ms: row.try_get("duration_ms")?,
        span_count: row.try_get("span_count")?,
        error: row.try_get("error")?,
    })
}

fn count_from_row(row: &PgRow) -> StorageResult<u64> {
    let count: i64 = row.try_get("count")?;
    Ok(count.max(0) as u64)
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

pub struct TimescaleEngine {
    config: StorageConfig,
    translator: TimescaleTranslator,
    pool: ArcSwapOption<PgPool>,
}

impl TimescaleEngine {
    pub fn new(config: StorageConfig) -> Self {
        let translator = TimescaleTranslator::new(config.tables.clone());
        Self {
            config,
            translator,
            pool: ArcSwapOption::empty(),
        }
    }

    fn pool(&self) -> StorageResult<Arc<PgPool>> {
        self.pool.load_full().ok_or(StorageError::NotConnected)
    }

    fn connect_options(&self) -> PgConnectOptions {
        let connection = &self.config.connection;
        let ssl_mode = if connection.secure {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };

        PgConnectOptions::new()
            .host(&connection.host)
            .port(self.config.port())
            .database(&connection.database)
            .username(&connection.username)
            .password(&connection.password)
            .ssl_mode(ssl_mode)
            .application_name("reservoir")
    }

    fn hypertable(&self, dataset: Dataset) -> &str {
        match dataset {
            Dataset::Logs => &self.translator.tables().logs,
            Dataset::Spans => &self.translator.tables().spans,
        }
    }

    async fn current_version(&self, pool: &PgPool) -> StorageResult<u32> {
        sqlx::query(&schema::version_table_ddl())
            .execute(pool)
            .await?;

        let version: Option<i32> =
            sqlx::query_scalar(&format!("SELECT MAX(version) FROM {VERSION_TABLE}"))
                .fetch_one(pool)
                .await?;

        Ok(version.unwrap_or(0).max(0) as u32)
    }

    async fn write_logs(
        &self,
        records: &[LogRecord],
    ) -> StorageResult<IngestReturningResult> {
        let started = Instant::now();
        let pool = self.pool()?;

        let (accepted, rejected) = partition_valid(records, LogRecord::validate);
        if accepted.is_empty() {
            return Ok(IngestReturningResult {
                failed: rejected.len(),
                duration_ms: elapsed_ms(started),
                errors: rejected,
                ..Default::default()
            });
        }

        let stored: Vec<StoredLogRecord> = accepted
            .into_iter()
            .map(|record| record.clone().with_id(Uuid::new_v4()))
            .collect();

        match self.insert_log_chunks(&pool, &stored).await {
            Ok(rows) => {
                tracing::debug!(
                    ingested = rows.len(),
                    rejected = rejected.len(),
                    "Inserted log batch"
                );
                Ok(IngestReturningResult {
                    ingested: rows.len(),
                    failed: rejected.len(),
                    duration_ms: elapsed_ms(started),
                    errors: rejected,
                    rows,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, rows = stored.len(), "Log batch insert failed");
                Ok(IngestReturningResult::batch_failed(
                    rejected,
                    stored.len(),
                    e.to_string(),
                    elapsed_ms(started),
                ))
            }
        }
    }

    /// All chunks commit together or not at all
    async fn insert_log_chunks(
        &self,
        pool: &PgPool,
        stored: &[StoredLogRecord],
    ) -> StorageResult<Vec<StoredLogRecord>> {
        let mut tx = pool.begin().await?;
        let mut rows = Vec::with_capacity(stored.len());

        for chunk in stored.chunks(LOG_ROWS_PER_STATEMENT) {
            let native = self.translator.insert_logs(chunk);
            for row in prepare(&native).fetch_all(&mut *tx).await? {
                rows.push(log_from_row(&row)?);
            }
        }

        tx.commit().await?;
        Ok(rows)
    }

    /// Insert the spans not stored yet and merge their trace aggregates.
    ///
    /// Spans and merges share one transaction, so a failed merge leaves nothing
    /// behind and a retry folds the same spans again.
    async fn write_spans(&self, pool: &PgPool, spans: &[&SpanRecord]) -> StorageResult<usize> {
        let mut seen: HashSet<SpanKey> = HashSet::with_capacity(spans.len());
        let unique: Vec<&SpanRecord> = spans
            .iter()
            .copied()
            .filter(|span| seen.insert(span_key(span)))
            .collect();

        let mut tx = pool.begin().await?;
        let mut inserted: HashSet<SpanKey> = HashSet::with_capacity(unique.len());

        for chunk in unique.chunks(SPAN_ROWS_PER_STATEMENT) {
            let owned: Vec<SpanRecord> = chunk.iter().map(|span| (*span).clone()).collect();
            let native = self.translator.insert_spans(&owned)?;
            for row in prepare(&native).fetch_all(&mut *tx).await? {
                inserted.insert((
                    row.try_get("project_id")?,
                    row.try_get("trace_id")?,
                    row.try_get("span_id")?,
                ));
            }
        }

        // Replayed spans were skipped by the insert, so they never count twice
        let new_spans = unique
            .iter()
            .copied()
            .filter(|span| inserted.contains(&span_key(span)));
        let traces = rollup::fold_spans(new_spans);
        for trace in &traces {
            let native = self.translator.upsert_trace(trace);
            prepare(&native).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        tracing::debug!(spans = inserted.len(), traces = traces.len(), "Inserted span batch");
        Ok(inserted.len())
    }
}

type SpanKey = (String, String, String);

fn span_key(span: &SpanRecord) -> SpanKey {
    (
        span.project_id.clone(),
        span.trace_id.clone(),
        span.span_id.clone(),
    )
}

#[async_trait]
impl StorageEngine for TimescaleEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Timescale
    }

    fn capabilities(&self) -> EngineCapabilities {
        CAPABILITIES
    }

    async fn connect(&self) -> StorageResult<()> {
        if self.pool.load().is_some() {
            return Ok(());
        }

        let connection = &self.config.connection;
        let pool = PgPoolOptions::new()
            .max_connections(connection.pool_size)
            .acquire_timeout(connection.connect_timeout())
            .connect_with(self.connect_options())
            .await?;

        tracing::info!(
            host = %connection.host,
            port = self.config.port(),
            database = %connection.database,
            pool_size = connection.pool_size,
            "Connected to TimescaleDB"
        );

        self.pool.store(Some(Arc::new(pool)));
        Ok(())
    }

    async fn disconnect(&self) -> StorageResult<()> {
        if let Some(pool) = self.pool.swap(None) {
            pool.close().await;
            tracing::info!("Disconnected from TimescaleDB");
        }
        Ok(())
    }

    async fn initialize(&self) -> StorageResult<()> {
        self.migrate(None).await.map(|_| ())
    }

    async fn migrate(&self, target_version: Option<u32>) -> StorageResult<u32> {
        let pool = self.pool()?;
        let latest = schema::latest_version();
        let target = target_version.unwrap_or(latest);
        if target > latest {
            return Err(StorageError::InvalidParams(format!(
                "schema version {} does not exist (latest is {})",
                target, latest
            )));
        }

        let current = self.current_version(&pool).await?;
        if target < current {
            return Err(StorageError::InvalidParams(format!(
                "schema is at version {}, downgrading to {} is not supported",
                current, target
            )));
        }

        for migration in schema::pending(current, target) {
            let mut tx = pool.begin().await?;
            for statement in (migration.statements)(self.translator.tables()) {
                sqlx::query(&statement).execute(&mut *tx).await?;
            }
            sqlx::query(&format!(
                "INSERT INTO {VERSION_TABLE} (version, description) VALUES ($1, $2)"
            ))
            .bind(migration.version as i32)
            .bind(migration.description)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

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
        let pool = match self.pool() {
            Ok(pool) => pool,
            Err(e) => return HealthStatus::failed(started.elapsed(), e),
        };

        match sqlx::query("SELECT 1").execute(pool.as_ref()).await {
            Ok(_) => HealthStatus::from_latency(started.elapsed()),
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
        let pool = self.pool()?;
        let native = self.translator.query_logs(params)?;

        let rows = prepare(&native).fetch_all(pool.as_ref()).await?;
        let logs = rows
            .iter()
            .map(log_from_row)
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(cursor::into_page(logs, params))
    }

    async fn get_by_id(
        &self,
        id: Uuid,
        project_id: &str,
    ) -> StorageResult<Option<StoredLogRecord>> {
        let pool = self.pool()?;
        let native = self.translator.get_log_by_id(id, project_id);

        prepare(&native)
            .fetch_optional(pool.as_ref())
            .await?
            .as_ref()
            .map(log_from_row)
            .transpose()
    }

    async fn get_by_ids(
        &self,
        ids: &[Uuid],
        project_id: &str,
    ) -> StorageResult<Vec<StoredLogRecord>> {
        let pool = self.pool()?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let native = self.translator.get_logs_by_ids(ids, project_id);

        prepare(&native)
            .fetch_all(pool.as_ref())
            .await?
            .iter()
            .map(log_from_row)
            .collect()
    }

    async fn count(&self, params: &CountParams) -> StorageResult<CountResult> {
        let pool = self.pool()?;
        let native = self.translator.count_logs(params);

        let row = prepare(&native).fetch_one(pool.as_ref()).await?;
        Ok(CountResult {
            count: count_from_row(&row)?,
        })
    }

    async fn distinct(&self, params: &DistinctParams) -> StorageResult<DistinctResult> {
        let pool = self.pool()?;
        let native = self.translator.distinct_values(params);

        let values = prepare(&native)
            .fetch_all(pool.as_ref())
            .await?
            .iter()
            .map(|row| row.try_get::<String, _>("value"))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DistinctResult { values })
    }

    async fn top_values(&self, params: &TopValuesParams) -> StorageResult<TopValuesResult> {
        let pool = self.pool()?;
        let native = self.translator.top_values(params);

        let values = prepare(&native)
            .fetch_all(pool.as_ref())
            .await?
            .iter()
            .map(|row| {
                Ok(TopValue {
                    value: row.try_get("value")?,
                    count: count_from_row(row)?,
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(TopValuesResult { values })
    }

    async fn aggregate(&self, params: &AggregateParams) -> StorageResult<AggregateResult> {
        let pool = self.pool()?;
        let native = self.translator.aggregate(params);

        let rows = prepare(&native)
            .fetch_all(pool.as_ref())
            .await?
            .iter()
            .map(|row| {
                let bucket: DateTime<Utc> = row.try_get("bucket")?;
                let level: LogLevel = parse_column(row, "level")?;
                Ok((bucket, level, count_from_row(row)?))
            })
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(AggregateResult::from_buckets(TimeBucket::fold(rows)))
    }

    async fn delete_by_time_range(&self, params: &DeleteParams) -> StorageResult<DeleteResult> {
        let pool = self.pool()?;
        let native = self.translator.delete_logs(params);

        let result = prepare(&native).execute(pool.as_ref()).await?;
        tracing::debug!(
            projects = params.project_ids.len(),
            deleted = result.rows_affected(),
            "Deleted logs"
        );

        Ok(DeleteResult {
            deleted: result.rows_affected(),
        })
    }

    async fn ingest_spans(&self, spans: &[SpanRecord]) -> StorageResult<IngestResult> {
        let started = Instant::now();
        let pool = self.pool()?;

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
        if let Err(e) = self.write_spans(&pool, &accepted).await {
            tracing::warn!(error = %e, spans = attempted, "Span batch insert failed");
            return Ok(IngestResult::batch_failed(
                rejected,
                attempted,
                e.to_string(),
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
        let pool = self.pool()?;
        let native = self.translator.upsert_trace(trace);
        prepare(&native).execute(pool.as_ref()).await?;
        Ok(())
    }

    async fn query_spans(&self, params: &SpanQueryParams) -> StorageResult<SpanQueryResult> {
        let pool = self.pool()?;
        let (page, count) = self.translator.query_spans(params);

        let spans = prepare(&page)
            .fetch_all(pool.as_ref())
            .await?
            .iter()
            .map(span_from_row)
            .collect::<StorageResult<Vec<_>>>()?;
        let total = count_from_row(&prepare(&count).fetch_one(pool.as_ref()).await?)?;

        Ok(SpanQueryResult {
            has_more: (params.offset + spans.len()) < total as usize,
            spans,
            total,
            limit: params.limit,
            offset: params.offset,
        })
    }

    async fn query_traces(&self, params: &TraceQueryParams) -> StorageResult<TraceQueryResult> {
        let pool = self.pool()?;
        let (page, count) = self.translator.query_traces(params);

        let traces = prepare(&page)
            .fetch_all(pool.as_ref())
            .await?
            .iter()
            .map(trace_from_row)
            .collect::<StorageResult<Vec<_>>>()?;
        let total = count_from_row(&prepare(&count).fetch_one(pool.as_ref()).await?)?;

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
        let pool = self.pool()?;
        let native = self.translator.spans_by_trace_id(trace_id, project_id);

        prepare(&native)
            .fetch_all(pool.as_ref())
            .await?
            .iter()
            .map(span_from_row)
            .collect()
    }

    async fn get_trace_by_id(
        &self,
        trace_id: &str,
        project_id: &str,
    ) -> StorageResult<Option<TraceRecord>> {
        let pool = self.pool()?;
        let native = self.translator.trace_by_id(trace_id, project_id);

        prepare(&native)
            .fetch_optional(pool.as_ref())
            .await?
            .as_ref()
            .map(trace_from_row)
            .transpose()
    }

    async fn get_service_dependencies(
        &self,
        params: &ServiceDependencyParams,
    ) -> StorageResult<ServiceDependencies> {
        let pool = self.pool()?;
        let native = self.translator.service_dependencies(params);

        let edges = prepare(&native)
            .fetch_all(pool.as_ref())
            .await?
            .iter()
            .map(|row| {
                let calls: i64 = row.try_get("call_count")?;
                Ok((
                    row.try_get("source")?,
                    row.try_get("target")?,
                    calls.max(0) as u64,
                ))
            })
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(rollup::dependency_graph(edges))
    }

    async fn delete_spans_by_time_range(
        &self,
        params: &DeleteParams,
    ) -> StorageResult<DeleteResult> {
        let pool = self.pool()?;
        let (spans, traces) = self.translator.delete_spans(params);

        let mut tx = pool.begin().await?;
        let deleted = prepare(&spans).execute(&mut *tx).await?.rows_affected();
        let traces_deleted = prepare(&traces).execute(&mut *tx).await?.rows_affected();
        tx.commit().await?;

        tracing::debug!(deleted, traces_deleted, "Deleted spans");
        Ok(DeleteResult { deleted })
    }

    async fn list_segments(
        &self,
        dataset: Dataset,
        range: &TimeRange,
    ) -> StorageResult<Vec<SegmentInfo>> {
        let pool = self.pool()?;
        let native = self.translator.list_chunks(self.hypertable(dataset), range);

        prepare(&native)
            .fetch_all(pool.as_ref())
            .await?
            .iter()
            .map(|row| {
                Ok(SegmentInfo {
                    name: row.try_get("name")?,
                    range_start: row.try_get("range_start")?,
                    range_end: row.try_get("range_end")?,
                    compressed: row.try_get::<Option<bool>, _>("is_compressed")?.unwrap_or(false),
                    rows: None,
                    bytes: None,
                })
            })
            .collect()
    }

    async fn drop_segments_before(
        &self,
        dataset: Dataset,
        older_than: DateTime<Utc>,
    ) -> StorageResult<u64> {
        let pool = self.pool()?;
        let native = self
            .translator
            .drop_chunks(self.hypertable(dataset), older_than);

        let dropped = prepare(&native).fetch_all(pool.as_ref()).await?.len() as u64;
        tracing::info!(%dataset, dropped, older_than = %older_than, "Dropped chunks");
        Ok(dropped)
    }

    async fn decompress_segments(
        &self,
        dataset: Dataset,
        range: &TimeRange,
    ) -> StorageResult<u64> {
        let pool = self.pool()?;
        let native = self
            .translator
            .decompress_chunks(self.hypertable(dataset), range);

        match prepare(&native).fetch_all(pool.as_ref()).await {
            Ok(rows) => Ok(rows.len() as u64),
            Err(e) => {
                // Another worker may have decompressed the same chunk first
                tracing::warn!(%dataset, error = %e, "Chunk decompression skipped");
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, TableNames};

    fn engine() -> TimescaleEngine {
        TimescaleEngine::new(StorageConfig {
            engine: EngineKind::Timescale,
            connection: ConnectionConfig {
                host: "localhost".to_string(),
                port: None,
                database: "reservoir".to_string(),
                username: "reservoir".to_string(),
                password: String::new(),
                pool_size: 2,
                connect_timeout_secs: 1,
                secure: false,
            },
            tables: TableNames::default(),
            skip_initialize: false,
        })
    }

    #[test]
    fn test_capabilities() {
        let caps = engine().capabilities();
        assert!(caps.supports_full_text_search);
        assert!(caps.supports_transactions);
        assert!(!caps.async_deletes);
        assert!(caps.supports_interval(AggregationInterval::Week));
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let engine = engine();
        let params = CountParams {
            range: TimeRange::new(Utc::now() - chrono::Duration::hours(1), Utc::now()),
            filters: Default::default(),
        };
        assert!(matches!(
            engine.count(&params).await,
            Err(StorageError::NotConnected)
        ));
        assert!(matches!(
            engine.ingest(&[]).await,
            Err(StorageError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_health_check_without_pool_is_unhealthy() {
        let status = engine().health_check().await;
        assert!(!status.connected);
        assert_eq!(status.status, crate::models::HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let engine = engine();
        assert!(engine.disconnect().await.is_ok());
        assert!(engine.disconnect().await.is_ok());
    }
}
