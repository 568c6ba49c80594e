//! In-memory engine for facade and retention tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use reservoir::cursor::{self, Cursor};
use reservoir::models::capabilities::ALL_OPERATORS;
use reservoir::models::{
    partition_valid, AggregateParams, AggregateResult, AggregationInterval, CountParams,
    CountResult, Dataset, DeleteParams, DeleteResult, DistinctParams, DistinctResult,
    EngineCapabilities, HealthStatus, IngestResult, IngestReturningResult, LogField, LogFilters,
    LogQueryParams, LogQueryResult, LogRecord, SegmentInfo, ServiceDependencies,
    ServiceDependencyParams, SortOrder, SpanQueryParams, SpanQueryResult, SpanRecord,
    StoredLogRecord, TimeBucket, TimeRange, TopValue, TopValuesParams, TopValuesResult,
    TraceQueryParams, TraceQueryResult, TraceRecord,
};
use reservoir::{rollup, EngineKind, StorageEngine, StorageError, StorageResult};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration as StdDuration;
use uuid::Uuid;

pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

pub fn log_at(time: DateTime<Utc>, project: &str, level: reservoir::models::LogLevel) -> LogRecord {
    LogRecord::new(time, project, "api", level, format!("event at {}", time.to_rfc3339()))
}

/// Capabilities of a relational-style engine: sync deletes, segment drops, compression
pub fn sync_capabilities() -> EngineCapabilities {
    EngineCapabilities {
        engine: EngineKind::Timescale,
        supports_full_text_search: false,
        supports_aggregations: true,
        supports_streaming: false,
        supports_transactions: true,
        max_batch_size: 1_000,
        native_compression: true,
        native_tiering: false,
        async_deletes: false,
        supports_segment_drop: true,
        supported_operators: ALL_OPERATORS,
        supported_intervals: &AggregationInterval::ALL,
    }
}

/// Capabilities of a columnar-style engine: background deletes, no compression step
pub fn async_capabilities() -> EngineCapabilities {
    EngineCapabilities {
        engine: EngineKind::ClickHouse,
        async_deletes: true,
        native_compression: false,
        supports_transactions: false,
        ..sync_capabilities()
    }
}

#[derive(Default)]
struct State {
    logs: Vec<StoredLogRecord>,
    spans: Vec<SpanRecord>,
    traces: BTreeMap<(String, String), TraceRecord>,
}

/// Keeps everything in memory and records every maintenance call in order
pub struct MemoryEngine {
    capabilities: EngineCapabilities,
    connected: AtomicBool,
    state: Mutex<State>,
    calls: Mutex<Vec<String>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_capabilities(sync_capabilities())
    }

    pub fn with_capabilities(capabilities: EngineCapabilities) -> Self {
        Self {
            capabilities,
            connected: AtomicBool::new(false),
            state: Mutex::new(State::default()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn log_count(&self) -> usize {
        self.state.lock().unwrap().logs.len()
    }

    pub fn span_count(&self) -> usize {
        self.state.lock().unwrap().spans.len()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn ensure_connected(&self) -> StorageResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::NotConnected)
        }
    }

    fn write_logs(&self, records: &[LogRecord]) -> StorageResult<IngestReturningResult> {
        self.ensure_connected()?;
        let (accepted, errors) = partition_valid(records, LogRecord::validate);
        let rows: Vec<StoredLogRecord> = accepted
            .into_iter()
            .map(|record| record.clone().with_id(Uuid::new_v4()))
            .collect();

        self.state.lock().unwrap().logs.extend(rows.iter().cloned());
        Ok(IngestReturningResult {
            ingested: rows.len(),
            failed: errors.len(),
            duration_ms: 0,
            errors,
            rows,
        })
    }

    fn filtered_logs(&self, range: &TimeRange, filters: &LogFilters) -> Vec<StoredLogRecord> {
        self.state
            .lock()
            .unwrap()
            .logs
            .iter()
            .filter(|log| matches_log(log, range, filters))
            .cloned()
            .collect()
    }
}

fn one_of(values: &[String], value: &str) -> bool {
    values.is_empty() || values.iter().any(|v| v == value)
}

fn one_of_or_unknown(values: &[String], value: Option<&str>) -> bool {
    values.is_empty()
        || value.map_or(false, |value| value == "unknown" || values.iter().any(|v| v == value))
}

/// Same predicate rules the translators apply; `fulltext` runs as substring here
fn matches_log(log: &StoredLogRecord, range: &TimeRange, filters: &LogFilters) -> bool {
    let record = &log.record;
    range.contains(record.time)
        && one_of(&filters.project_ids, &record.project_id)
        && one_of_or_unknown(&filters.services, Some(&record.service))
        && one_of_or_unknown(&filters.hostnames, record.hostname.as_deref())
        && (filters.levels.is_empty() || filters.levels.contains(&record.level))
        && filters
            .trace_id
            .as_ref()
            .map_or(true, |trace_id| record.trace_id.as_ref() == Some(trace_id))
        && filters.search.as_ref().map_or(true, |search| {
            record
                .message
                .to_lowercase()
                .contains(&search.term.to_lowercase())
        })
}

fn field_value(log: &StoredLogRecord, field: &LogField) -> Option<String> {
    let record = &log.record;
    match field {
        LogField::ProjectId => Some(record.project_id.clone()),
        LogField::Service => Some(record.service.clone()),
        LogField::Level => Some(record.level.to_string()),
        LogField::Hostname => record.hostname.clone(),
        LogField::TraceId => record.trace_id.clone(),
        LogField::Metadata(path) => {
            let mut value = record.metadata.as_ref()?;
            for key in path {
                value = value.get(key)?;
            }
            match value {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            }
        }
    }
}

fn day_start(time: DateTime<Utc>) -> DateTime<Utc> {
    time.date_naive().and_time(NaiveTime::MIN).and_utc()
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    fn kind(&self) -> EngineKind {
        self.capabilities.engine
    }

    fn capabilities(&self) -> EngineCapabilities {
        self.capabilities.clone()
    }

    async fn connect(&self) -> StorageResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> StorageResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn initialize(&self) -> StorageResult<()> {
        self.ensure_connected()?;
        self.record("initialize".to_string());
        Ok(())
    }

    async fn migrate(&self, target_version: Option<u32>) -> StorageResult<u32> {
        self.ensure_connected()?;
        Ok(target_version.unwrap_or(1))
    }

    async fn health_check(&self) -> HealthStatus {
        match self.ensure_connected() {
            Ok(()) => HealthStatus::from_latency(StdDuration::from_millis(1)),
            Err(e) => HealthStatus::failed(StdDuration::ZERO, e),
        }
    }

    async fn ingest(&self, records: &[LogRecord]) -> StorageResult<IngestResult> {
        self.write_logs(records).map(IngestResult::from)
    }

    async fn ingest_returning(
        &self,
        records: &[LogRecord],
    ) -> StorageResult<IngestReturningResult> {
        self.write_logs(records)
    }

    async fn query(&self, params: &LogQueryParams) -> StorageResult<LogQueryResult> {
        self.ensure_connected()?;
        let cursor = params.cursor.as_deref().map(Cursor::decode).transpose()?;

        let mut rows = self.filtered_logs(&params.range, &params.filters);
        rows.sort_by_key(|log| (log.time(), log.id));
        if params.order == SortOrder::Desc {
            rows.reverse();
        }
        if let Some(cursor) = cursor {
            let key = (cursor.time, cursor.id);
            rows.retain(|log| match params.order {
                SortOrder::Asc => (log.time(), log.id) > key,
                SortOrder::Desc => (log.time(), log.id) < key,
            });
        }

        let skip = if params.cursor.is_some() { 0 } else { params.offset };
        let page: Vec<StoredLogRecord> = rows.into_iter().skip(skip).take(params.limit + 1).collect();
        Ok(cursor::into_page(page, params))
    }

    async fn get_by_id(
        &self,
        id: Uuid,
        project_id: &str,
    ) -> StorageResult<Option<StoredLogRecord>> {
        self.ensure_connected()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .logs
            .iter()
            .find(|log| log.id == id && log.record.project_id == project_id)
            .cloned())
    }

    async fn get_by_ids(
        &self,
        ids: &[Uuid],
        project_id: &str,
    ) -> StorageResult<Vec<StoredLogRecord>> {
        self.ensure_connected()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .logs
            .iter()
            .filter(|log| ids.contains(&log.id) && log.record.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn count(&self, params: &CountParams) -> StorageResult<CountResult> {
        self.ensure_connected()?;
        Ok(CountResult {
            count: self.filtered_logs(&params.range, &params.filters).len() as u64,
        })
    }

    async fn distinct(&self, params: &DistinctParams) -> StorageResult<DistinctResult> {
        self.ensure_connected()?;
        let values: std::collections::BTreeSet<String> = self
            .filtered_logs(&params.range, &params.filters)
            .iter()
            .filter_map(|log| field_value(log, &params.field))
            .collect();
        Ok(DistinctResult {
            values: values.into_iter().take(params.limit).collect(),
        })
    }

    async fn top_values(&self, params: &TopValuesParams) -> StorageResult<TopValuesResult> {
        self.ensure_connected()?;
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for log in self.filtered_logs(&params.range, &params.filters) {
            if let Some(value) = field_value(&log, &params.field) {
                *counts.entry(value).or_insert(0) += 1;
            }
        }
        let mut values: Vec<TopValue> = counts
            .into_iter()
            .map(|(value, count)| TopValue { value, count })
            .collect();
        values.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
        values.truncate(params.limit);
        Ok(TopValuesResult { values })
    }

    async fn aggregate(&self, params: &AggregateParams) -> StorageResult<AggregateResult> {
        self.ensure_connected()?;
        let rows = self
            .filtered_logs(&params.range, &params.filters)
            .iter()
            .map(|log| (params.interval.bucket_start(log.time()), log.record.level, 1))
            .collect::<Vec<_>>();
        Ok(AggregateResult::from_buckets(TimeBucket::fold(rows)))
    }

    async fn delete_by_time_range(&self, params: &DeleteParams) -> StorageResult<DeleteResult> {
        self.ensure_connected()?;
        self.record(format!("delete:logs:{}", params.from.to_rfc3339()));
        let range = params.range();
        let mut state = self.state.lock().unwrap();
        let before = state.logs.len();
        state.logs.retain(|log| {
            !(range.contains(log.time()) && params.project_ids.contains(&log.record.project_id))
        });
        let deleted = (before - state.logs.len()) as u64;

        Ok(DeleteResult {
            deleted: if self.capabilities.async_deletes { 0 } else { deleted },
        })
    }

    async fn ingest_spans(&self, spans: &[SpanRecord]) -> StorageResult<IngestResult> {
        self.ensure_connected()?;
        let (accepted, errors) = partition_valid(spans, SpanRecord::validate);

        let new_spans: Vec<SpanRecord> = {
            let mut state = self.state.lock().unwrap();
            let mut seen: HashSet<(String, String, String)> = state
                .spans
                .iter()
                .map(|s| (s.project_id.clone(), s.trace_id.clone(), s.span_id.clone()))
                .collect();
            let new_spans: Vec<SpanRecord> = accepted
                .iter()
                .filter(|s| seen.insert((s.project_id.clone(), s.trace_id.clone(), s.span_id.clone())))
                .map(|s| (*s).clone())
                .collect();
            state.spans.extend(new_spans.iter().cloned());
            new_spans
        };

        for trace in rollup::fold_spans(&new_spans) {
            self.upsert_trace(&trace).await?;
        }

        Ok(IngestResult {
            ingested: accepted.len(),
            failed: errors.len(),
            duration_ms: 0,
            errors,
        })
    }

    async fn upsert_trace(&self, trace: &TraceRecord) -> StorageResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock().unwrap();
        let key = (trace.project_id.clone(), trace.trace_id.clone());
        match state.traces.get_mut(&key) {
            Some(existing) => existing.merge(trace),
            None => {
                state.traces.insert(key, trace.clone());
            }
        }
        Ok(())
    }

    async fn query_spans(&self, params: &SpanQueryParams) -> StorageResult<SpanQueryResult> {
        self.ensure_connected()?;
        let mut spans: Vec<SpanRecord> = self
            .state
            .lock()
            .unwrap()
            .spans
            .iter()
            .filter(|span| {
                params.range.contains(span.start_time)
                    && one_of(&params.project_ids, &span.project_id)
                    && one_of(&params.services, &span.service_name)
                    && params
                        .trace_id
                        .as_ref()
                        .map_or(true, |trace_id| &span.trace_id == trace_id)
            })
            .cloned()
            .collect();
        spans.sort_by_key(|span| (span.start_time, span.span_id.clone()));

        let total = spans.len() as u64;
        let page: Vec<SpanRecord> = spans
            .into_iter()
            .skip(params.offset)
            .take(params.limit)
            .collect();
        Ok(SpanQueryResult {
            has_more: params.offset + page.len() < total as usize,
            spans: page,
            total,
            limit: params.limit,
            offset: params.offset,
        })
    }

    async fn query_traces(&self, params: &TraceQueryParams) -> StorageResult<TraceQueryResult> {
        self.ensure_connected()?;
        let mut traces: Vec<TraceRecord> = self
            .state
            .lock()
            .unwrap()
            .traces
            .values()
            .filter(|trace| {
                params.range.contains(trace.start_time)
                    && one_of(&params.project_ids, &trace.project_id)
                    && params.error.map_or(true, |error| trace.error == error)
            })
            .cloned()
            .collect();
        traces.sort_by(|a, b| b.start_time.cmp(&a.start_time));

        let total = traces.len() as u64;
        let page: Vec<TraceRecord> = traces
            .into_iter()
            .skip(params.offset)
            .take(params.limit)
            .collect();
        Ok(TraceQueryResult {
            has_more: params.offset + page.len() < total as usize,
            traces: page,
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
        self.ensure_connected()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .spans
            .iter()
            .filter(|span| span.trace_id == trace_id && span.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn get_trace_by_id(
        &self,
        trace_id: &str,
        project_id: &str,
    ) -> StorageResult<Option<TraceRecord>> {
        self.ensure_connected()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .traces
            .get(&(project_id.to_string(), trace_id.to_string()))
            .cloned())
    }

    async fn get_service_dependencies(
        &self,
        params: &ServiceDependencyParams,
    ) -> StorageResult<ServiceDependencies> {
        self.ensure_connected()?;
        let spans: Vec<SpanRecord> = self
            .state
            .lock()
            .unwrap()
            .spans
            .iter()
            .filter(|span| {
                params.range.contains(span.start_time)
                    && one_of(&params.project_ids, &span.project_id)
            })
            .cloned()
            .collect();
        Ok(rollup::dependency_graph(rollup::dependency_edges(&spans)))
    }

    async fn delete_spans_by_time_range(
        &self,
        params: &DeleteParams,
    ) -> StorageResult<DeleteResult> {
        self.ensure_connected()?;
        self.record(format!("delete:spans:{}", params.from.to_rfc3339()));
        let range = params.range();
        let mut state = self.state.lock().unwrap();
        let before = state.spans.len();
        state.spans.retain(|span| {
            !(range.contains(span.start_time) && params.project_ids.contains(&span.project_id))
        });
        state.traces.retain(|_, trace| {
            !(range.contains(trace.start_time) && params.project_ids.contains(&trace.project_id))
        });
        let deleted = (before - state.spans.len()) as u64;

        Ok(DeleteResult {
            deleted: if self.capabilities.async_deletes { 0 } else { deleted },
        })
    }

    async fn list_segments(
        &self,
        dataset: Dataset,
        range: &TimeRange,
    ) -> StorageResult<Vec<SegmentInfo>> {
        self.ensure_connected()?;
        let times: Vec<DateTime<Utc>> = {
            let state = self.state.lock().unwrap();
            match dataset {
                Dataset::Logs => state.logs.iter().map(|log| log.time()).collect(),
                Dataset::Spans => state.spans.iter().map(|span| span.start_time).collect(),
            }
        };

        let mut days: BTreeMap<DateTime<Utc>, u64> = BTreeMap::new();
        for time in times {
            *days.entry(day_start(time)).or_insert(0) += 1;
        }
        Ok(days
            .into_iter()
            .map(|(start, rows)| SegmentInfo {
                name: start.format("%Y%m%d").to_string(),
                range_start: start,
                range_end: start + Duration::days(1),
                compressed: false,
                rows: Some(rows),
                bytes: None,
            })
            .filter(|segment| segment.range_start <= range.to && segment.range_end > range.from)
            .collect())
    }

    async fn drop_segments_before(
        &self,
        dataset: Dataset,
        older_than: DateTime<Utc>,
    ) -> StorageResult<u64> {
        self.ensure_connected()?;
        self.record(format!("drop_segments_before:{}", dataset));
        let mut state = self.state.lock().unwrap();
        let mut dropped_days = HashSet::new();
        match dataset {
            Dataset::Logs => state.logs.retain(|log| {
                let day = day_start(log.time());
                let expired = day + Duration::days(1) <= older_than;
                if expired {
                    dropped_days.insert(day);
                }
                !expired
            }),
            Dataset::Spans => state.spans.retain(|span| {
                let day = day_start(span.start_time);
                let expired = day + Duration::days(1) <= older_than;
                if expired {
                    dropped_days.insert(day);
                }
                !expired
            }),
        }
        Ok(dropped_days.len() as u64)
    }

    async fn decompress_segments(
        &self,
        dataset: Dataset,
        _range: &TimeRange,
    ) -> StorageResult<u64> {
        self.ensure_connected()?;
        self.record(format!("decompress_segments:{}", dataset));
        Ok(0)
    }

    async fn wait_for_mutations(&self, _timeout: StdDuration) -> StorageResult<bool> {
        self.ensure_connected()?;
        self.record("wait_for_mutations".to_string());
        Ok(true)
    }
}
