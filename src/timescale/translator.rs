//! Parameter objects to PostgreSQL/TimescaleDB statements

use crate::config::TableNames;
use crate::cursor::Cursor;
use crate::error::StorageResult;
use crate::models::{
    AggregateParams, AggregationInterval, CountParams, DeleteParams, DistinctParams, LogField,
    LogQueryParams, ServiceDependencyParams, SpanQueryParams, StoredLogRecord, TimeRange,
    TopValuesParams, TraceQueryParams, TraceRecord, SpanRecord,
};
use crate::translate::{escape_like, Dialect, NativeQuery, SqlBuilder, SqlValue};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub const LOG_COLUMNS: &str =
    "id, time, project_id, service, level, message, metadata, trace_id, span_id, hostname";

pub const SPAN_COLUMNS: &str = "project_id, trace_id, span_id, parent_span_id, service_name, \
     operation_name, start_time, end_time, duration_ms, kind, status_code, status_message, \
     attributes, events, links, resource_attributes";

pub const TRACE_COLUMNS: &str = "project_id, trace_id, service_name, root_service_name, \
     root_operation_name, start_time, end_time, duration_ms, span_count, error";

const LOG_COLUMN_COUNT: usize = 10;
const SPAN_COLUMN_COUNT: usize = 16;

/// PostgreSQL caps a statement at 65535 bind parameters
const MAX_BIND_PARAMS: usize = 65_535;

/// Largest log batch that fits in one multi-row `INSERT`
pub const LOG_ROWS_PER_STATEMENT: usize = MAX_BIND_PARAMS / LOG_COLUMN_COUNT;

/// Largest span batch that fits in one multi-row `INSERT`
pub const SPAN_ROWS_PER_STATEMENT: usize = MAX_BIND_PARAMS / SPAN_COLUMN_COUNT;

/// `$n` placeholders, `= ANY` arrays, `ILIKE` substring, `tsvector` full text
pub struct Postgres;

impl Dialect for Postgres {
    const SUPPORTS_FULLTEXT: bool = true;

    fn placeholder(index: usize, _value: &SqlValue) -> String {
        format!("${}", index + 1)
    }

    fn in_list(column: &str, placeholder: &str) -> String {
        format!("{column} = ANY({placeholder})")
    }

    fn substring_param(term: &str) -> SqlValue {
        SqlValue::Text(format!("%{}%", escape_like(term)))
    }

    fn substring_match(column: &str, placeholder: &str) -> String {
        format!("{column} ILIKE {placeholder}")
    }

    fn fulltext_match(column: &str, placeholder: &str) -> String {
        format!("to_tsvector('english', {column}) @@ plainto_tsquery('english', {placeholder})")
    }
}

fn time_bucket(interval: AggregationInterval) -> &'static str {
    match interval {
        AggregationInterval::Minute => "time_bucket(INTERVAL '1 minute', time)",
        AggregationInterval::Hour => "time_bucket(INTERVAL '1 hour', time)",
        AggregationInterval::Day => "time_bucket(INTERVAL '1 day', time)",
        // Week buckets are anchored on Monday 2000-01-03
        AggregationInterval::Week => "time_bucket(INTERVAL '1 week', time)",
    }
}

/// Builds every statement the Timescale engine runs. Pure: no I/O.
#[derive(Debug, Clone)]
pub struct TimescaleTranslator {
    tables: TableNames,
}

impl TimescaleTranslator {
    pub fn new(tables: TableNames) -> Self {
        Self { tables }
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    /// Expression selecting `field`; metadata paths bind the path as a `text[]`
    fn field_expr(builder: &mut SqlBuilder<Postgres>, field: &LogField) -> String {
        match field {
            LogField::ProjectId => "project_id".to_string(),
            LogField::Service => "service".to_string(),
            LogField::Level => "level".to_string(),
            LogField::Hostname => "hostname".to_string(),
            LogField::TraceId => "trace_id".to_string(),
            LogField::Metadata(path) => {
                let placeholder = builder.bind(SqlValue::TextArray(path.clone()));
                format!("(metadata #>> {placeholder})")
            }
        }
    }

    /// One page of logs, fetching `limit + 1` rows so the caller can detect more
    pub fn query_logs(&self, params: &LogQueryParams) -> StorageResult<NativeQuery> {
        let cursor = params.cursor.as_deref().map(Cursor::decode).transpose()?;

        let mut builder = SqlBuilder::<Postgres>::new();
        builder.log_filters(&params.range, &params.filters);
        if let Some(cursor) = &cursor {
            let time = builder.bind(SqlValue::Timestamp(cursor.time));
            let id = builder.bind(SqlValue::Uuid(cursor.id));
            builder.push(format!(
                "(time, id) {} ({time}, {id})",
                params.order.keyset_operator()
            ));
        }

        let order = params.order.as_sql();
        let mut text = format!(
            "SELECT {LOG_COLUMNS} FROM {}{} ORDER BY time {order}, id {order} LIMIT {}",
            self.tables.logs,
            builder.where_clause(),
            params.limit + 1
        );
        if cursor.is_none() && params.offset > 0 {
            text.push_str(&format!(" OFFSET {}", params.offset));
        }

        Ok(builder.finish(text))
    }

    pub fn get_log_by_id(&self, id: Uuid, project_id: &str) -> NativeQuery {
        let mut builder = SqlBuilder::<Postgres>::new();
        let id = builder.bind(SqlValue::Uuid(id));
        let project = builder.bind(SqlValue::Text(project_id.to_string()));
        let text = format!(
            "SELECT {LOG_COLUMNS} FROM {} WHERE id = {id} AND project_id = {project} LIMIT 1",
            self.tables.logs
        );
        builder.finish(text)
    }

    pub fn get_logs_by_ids(&self, ids: &[Uuid], project_id: &str) -> NativeQuery {
        let mut builder = SqlBuilder::<Postgres>::new();
        let ids = builder.bind(SqlValue::UuidArray(ids.to_vec()));
        let project = builder.bind(SqlValue::Text(project_id.to_string()));
        let text = format!(
            "SELECT {LOG_COLUMNS} FROM {} WHERE id = ANY({ids}) AND project_id = {project} \
             ORDER BY time DESC, id DESC",
            self.tables.logs
        );
        builder.finish(text)
    }

    pub fn count_logs(&self, params: &CountParams) -> NativeQuery {
        let mut builder = SqlBuilder::<Postgres>::new();
        builder.log_filters(&params.range, &params.filters);
        let text = format!(
            "SELECT count(*) AS count FROM {}{}",
            self.tables.logs,
            builder.where_clause()
        );
        builder.finish(text)
    }

    pub fn distinct_values(&self, params: &DistinctParams) -> NativeQuery {
        let mut builder = SqlBuilder::<Postgres>::new();
        let expr = Self::field_expr(&mut builder, &params.field);
        builder.log_filters(&params.range, &params.filters);
        builder.push(format!("{expr} IS NOT NULL"));
        let text = format!(
            "SELECT DISTINCT {expr} AS value FROM {}{} ORDER BY value ASC LIMIT {}",
            self.tables.logs,
            builder.where_clause(),
            params.limit
        );
        builder.finish(text)
    }

    pub fn top_values(&self, params: &TopValuesParams) -> NativeQuery {
        let mut builder = SqlBuilder::<Postgres>::new();
        let expr = Self::field_expr(&mut builder, &params.field);
        builder.log_filters(&params.range, &params.filters);
        builder.push(format!("{expr} IS NOT NULL"));
        let text = format!(
            "SELECT {expr} AS value, count(*) AS count FROM {}{} \
             GROUP BY value ORDER BY count DESC, value ASC LIMIT {}",
            self.tables.logs,
            builder.where_clause(),
            params.limit
        );
        builder.finish(text)
    }

    /// `(bucket, level, count)` rows; the interval is inlined from a closed enum
    pub fn aggregate(&self, params: &AggregateParams) -> NativeQuery {
        let mut builder = SqlBuilder::<Postgres>::new();
        builder.log_filters(&params.range, &params.filters);
        let text = format!(
            "SELECT {} AS bucket, level, count(*) AS count FROM {}{} \
             GROUP BY bucket, level ORDER BY bucket ASC",
            time_bucket(params.interval),
            self.tables.logs,
            builder.where_clause()
        );
        builder.finish(text)
    }

    fn delete_where(column: &str, params: &DeleteParams) -> SqlBuilder<Postgres> {
        let mut builder = SqlBuilder::<Postgres>::new();
        builder.one_or_many("project_id", &params.project_ids);
        builder.time_range(column, &params.range());
        builder
    }

    pub fn delete_logs(&self, params: &DeleteParams) -> NativeQuery {
        let builder = Self::delete_where("time", params);
        let text = format!("DELETE FROM {}{}", self.tables.logs, builder.where_clause());
        builder.finish(text)
    }

    /// Multi-row insert returning the stored rows
    pub fn insert_logs(&self, rows: &[StoredLogRecord]) -> NativeQuery {
        let mut builder = SqlBuilder::<Postgres>::new();
        let mut tuples = Vec::with_capacity(rows.len());

        for row in rows {
            let log = &row.record;
            let values = [
                builder.bind(SqlValue::Uuid(row.id)),
                builder.bind(SqlValue::Timestamp(log.time)),
                builder.bind(SqlValue::Text(log.project_id.clone())),
                builder.bind(SqlValue::Text(log.service.clone())),
                builder.bind(SqlValue::Text(log.level.as_str().to_string())),
                builder.bind(SqlValue::Text(log.message.clone())),
                builder.bind(SqlValue::Json(log.metadata.clone())),
                builder.bind(SqlValue::NullableText(log.trace_id.clone())),
                builder.bind(SqlValue::NullableText(log.span_id.clone())),
                builder.bind(SqlValue::NullableText(log.hostname.clone())),
            ];
            tuples.push(format!("({})", values.join(", ")));
        }

        let text = format!(
            "INSERT INTO {} ({LOG_COLUMNS}) VALUES {} RETURNING {LOG_COLUMNS}",
            self.tables.logs,
            tuples.join(", ")
        );
        builder.finish(text)
    }

    /// Multi-row insert; spans already stored are skipped and not returned
    pub fn insert_spans(&self, spans: &[SpanRecord]) -> StorageResult<NativeQuery> {
        let mut builder = SqlBuilder::<Postgres>::new();
        let mut tuples = Vec::with_capacity(spans.len());

        for span in spans {
            let events = serde_json::to_value(&span.events)?;
            let links = serde_json::to_value(&span.links)?;
            let values = [
                builder.bind(SqlValue::Text(span.project_id.clone())),
                builder.bind(SqlValue::Text(span.trace_id.clone())),
                builder.bind(SqlValue::Text(span.span_id.clone())),
                builder.bind(SqlValue::NullableText(span.parent_span_id.clone())),
                builder.bind(SqlValue::Text(span.service_name.clone())),
                builder.bind(SqlValue::Text(span.operation_name.clone())),
                builder.bind(SqlValue::Timestamp(span.start_time)),
                builder.bind(SqlValue::Timestamp(span.end_time)),
                builder.bind(SqlValue::Int(span.duration_ms)),
                builder.bind(SqlValue::NullableText(
                    span.kind.map(|kind| kind.as_str().to_string()),
                )),
                builder.bind(SqlValue::NullableText(
                    span.status_code.map(|status| status.as_str().to_string()),
                )),
                builder.bind(SqlValue::NullableText(span.status_message.clone())),
                builder.bind(SqlValue::Json(span.attributes.clone())),
                builder.bind(SqlValue::Json(Some(events))),
                builder.bind(SqlValue::Json(Some(links))),
                builder.bind(SqlValue::Json(span.resource_attributes.clone())),
            ];
            tuples.push(format!("({})", values.join(", ")));
        }

        let text = format!(
            "INSERT INTO {} ({SPAN_COLUMNS}) VALUES {} \
             ON CONFLICT (project_id, trace_id, span_id, start_time) DO NOTHING \
             RETURNING project_id, trace_id, span_id",
            self.tables.spans,
            tuples.join(", ")
        );
        Ok(builder.finish(text))
    }

    /// Insert or monotonically merge a trace aggregate
    ///
    /// Bounds widen, counts add, the error flag is sticky and the first root
    /// seen keeps its names.
    pub fn upsert_trace(&self, trace: &TraceRecord) -> NativeQuery {
        let mut builder = SqlBuilder::<Postgres>::new();
        let values = [
            builder.bind(SqlValue::Text(trace.project_id.clone())),
            builder.bind(SqlValue::Text(trace.trace_id.clone())),
            builder.bind(SqlValue::Text(trace.service_name.clone())),
            builder.bind(SqlValue::NullableText(trace.root_service_name.clone())),
            builder.bind(SqlValue::NullableText(trace.root_operation_name.clone())),
            builder.bind(SqlValue::Timestamp(trace.start_time)),
            builder.bind(SqlValue::Timestamp(trace.end_time)),
            builder.bind(SqlValue::Int(trace.duration_ms)),
            builder.bind(SqlValue::Int(trace.span_count)),
            builder.bind(SqlValue::Bool(trace.error)),
        ];

        let t = &self.tables.traces;
        let text = format!(
            "INSERT INTO {t} ({TRACE_COLUMNS}) VALUES ({values}) \
             ON CONFLICT (project_id, trace_id) DO UPDATE SET \
             service_name = CASE WHEN {t}.root_service_name IS NULL \
             AND EXCLUDED.root_service_name IS NOT NULL \
             THEN EXCLUDED.service_name ELSE {t}.service_name END, \
             root_service_name = COALESCE({t}.root_service_name, EXCLUDED.root_service_name), \
             root_operation_name = COALESCE({t}.root_operation_name, EXCLUDED.root_operation_name), \
             start_time = LEAST({t}.start_time, EXCLUDED.start_time), \
             end_time = GREATEST({t}.end_time, EXCLUDED.end_time), \
             duration_ms = (EXTRACT(EPOCH FROM (GREATEST({t}.end_time, EXCLUDED.end_time) \
             - LEAST({t}.start_time, EXCLUDED.start_time))) * 1000)::BIGINT, \
             span_count = {t}.span_count + EXCLUDED.span_count, \
             error = {t}.error OR EXCLUDED.error",
            values = values.join(", ")
        );
        builder.finish(text)
    }

    fn span_where(params: &SpanQueryParams) -> SqlBuilder<Postgres> {
        let mut builder = SqlBuilder::<Postgres>::new();
        builder.time_range("start_time", &params.range);
        builder.one_or_many("project_id", &params.project_ids);
        if let Some(trace_id) = &params.trace_id {
            let placeholder = builder.bind(SqlValue::Text(trace_id.clone()));
            builder.push(format!("trace_id = {placeholder}"));
        }
        builder.one_or_many("service_name", &params.services);
        if let Some(operation) = &params.operation_name {
            let placeholder = builder.bind(SqlValue::Text(operation.clone()));
            builder.push(format!("operation_name = {placeholder}"));
        }
        let kinds: Vec<String> = params.kinds.iter().map(|k| k.as_str().to_string()).collect();
        builder.one_or_many("kind", &kinds);
        let statuses: Vec<String> = params
            .status_codes
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        builder.one_or_many("status_code", &statuses);
        builder
    }

    /// Page query and matching total
    pub fn query_spans(&self, params: &SpanQueryParams) -> (NativeQuery, NativeQuery) {
        let order = params.order.as_sql();
        let builder = Self::span_where(params);
        let page = format!(
            "SELECT {SPAN_COLUMNS} FROM {}{} ORDER BY start_time {order}, span_id {order} \
             LIMIT {} OFFSET {}",
            self.tables.spans,
            builder.where_clause(),
            params.limit,
            params.offset
        );
        let page = builder.finish(page);

        let builder = Self::span_where(params);
        let count = format!(
            "SELECT count(*) AS count FROM {}{}",
            self.tables.spans,
            builder.where_clause()
        );
        (page, builder.finish(count))
    }

    fn trace_where(params: &TraceQueryParams) -> SqlBuilder<Postgres> {
        let mut builder = SqlBuilder::<Postgres>::new();
        builder.time_range("start_time", &params.range);
        builder.one_or_many("project_id", &params.project_ids);
        builder.one_or_many("service_name", &params.services);
        if let Some(error) = params.error {
            let placeholder = builder.bind(SqlValue::Bool(error));
            builder.push(format!("error = {placeholder}"));
        }
        if let Some(min) = params.min_duration_ms {
            let placeholder = builder.bind(SqlValue::Int(min));
            builder.push(format!("duration_ms >= {placeholder}"));
        }
        if let Some(max) = params.max_duration_ms {
            let placeholder = builder.bind(SqlValue::Int(max));
            builder.push(format!("duration_ms <= {placeholder}"));
        }
        builder
    }

    pub fn query_traces(&self, params: &TraceQueryParams) -> (NativeQuery, NativeQuery) {
        let builder = Self::trace_where(params);
        let page = format!(
            "SELECT {TRACE_COLUMNS} FROM {}{} ORDER BY start_time DESC, trace_id DESC \
             LIMIT {} OFFSET {}",
            self.tables.traces,
            builder.where_clause(),
            params.limit,
            params.offset
        );
        let page = builder.finish(page);

        let builder = Self::trace_where(params);
        let count = format!(
            "SELECT count(*) AS count FROM {}{}",
            self.tables.traces,
            builder.where_clause()
        );
        (page, builder.finish(count))
    }

    pub fn spans_by_trace_id(&self, trace_id: &str, project_id: &str) -> NativeQuery {
        let mut builder = SqlBuilder::<Postgres>::new();
        let trace = builder.bind(SqlValue::Text(trace_id.to_string()));
        let project = builder.bind(SqlValue::Text(project_id.to_string()));
        let text = format!(
            "SELECT {SPAN_COLUMNS} FROM {} WHERE trace_id = {trace} AND project_id = {project} \
             ORDER BY start_time ASC, span_id ASC",
            self.tables.spans
        );
        builder.finish(text)
    }

    pub fn trace_by_id(&self, trace_id: &str, project_id: &str) -> NativeQuery {
        let mut builder = SqlBuilder::<Postgres>::new();
        let trace = builder.bind(SqlValue::Text(trace_id.to_string()));
        let project = builder.bind(SqlValue::Text(project_id.to_string()));
        let text = format!(
            "SELECT {TRACE_COLUMNS} FROM {} WHERE trace_id = {trace} AND project_id = {project}",
            self.tables.traces
        );
        builder.finish(text)
    }

    /// Caller/callee service pairs from parent-child span links across services
    pub fn service_dependencies(&self, params: &ServiceDependencyParams) -> NativeQuery {
        let mut builder = SqlBuilder::<Postgres>::new();
        builder.time_range("child.start_time", &params.range);
        builder.one_or_many("child.project_id", &params.project_ids);
        builder.push("parent.service_name <> child.service_name");
        let text = format!(
            "SELECT parent.service_name AS source, child.service_name AS target, \
             count(*) AS call_count \
             FROM {spans} child JOIN {spans} parent \
             ON parent.project_id = child.project_id \
             AND parent.trace_id = child.trace_id \
             AND parent.span_id = child.parent_span_id{} \
             GROUP BY source, target ORDER BY call_count DESC, source ASC, target ASC",
            builder.where_clause(),
            spans = self.tables.spans
        );
        builder.finish(text)
    }

    /// Span delete and the matching trace delete, run together
    pub fn delete_spans(&self, params: &DeleteParams) -> (NativeQuery, NativeQuery) {
        let builder = Self::delete_where("start_time", params);
        let spans = format!(
            "DELETE FROM {}{}",
            self.tables.spans,
            builder.where_clause()
        );
        let spans = builder.finish(spans);

        let builder = Self::delete_where("start_time", params);
        let traces = format!(
            "DELETE FROM {}{}",
            self.tables.traces,
            builder.where_clause()
        );
        (spans, builder.finish(traces))
    }

    pub fn list_chunks(&self, hypertable: &str, range: &TimeRange) -> NativeQuery {
        let mut builder = SqlBuilder::<Postgres>::new();
        let name = builder.bind(SqlValue::Text(hypertable.to_string()));
        let from = builder.bind(SqlValue::Timestamp(range.from));
        let to = builder.bind(SqlValue::Timestamp(range.to));
        let text = format!(
            "SELECT chunk_schema || '.' || chunk_name AS name, range_start, range_end, \
             is_compressed FROM timescaledb_information.chunks \
             WHERE hypertable_name = {name} AND range_end > {from} AND range_start <= {to} \
             ORDER BY range_start ASC"
        );
        builder.finish(text)
    }

    /// `hypertable` must already be a validated identifier
    pub fn drop_chunks(&self, hypertable: &str, older_than: DateTime<Utc>) -> NativeQuery {
        let mut builder = SqlBuilder::<Postgres>::new();
        let cutoff = builder.bind(SqlValue::Timestamp(older_than));
        let text = format!("SELECT drop_chunks('{hypertable}', older_than => {cutoff})");
        builder.finish(text)
    }

    pub fn decompress_chunks(&self, hypertable: &str, range: &TimeRange) -> NativeQuery {
        let mut builder = SqlBuilder::<Postgres>::new();
        let name = builder.bind(SqlValue::Text(hypertable.to_string()));
        let from = builder.bind(SqlValue::Timestamp(range.from));
        let to = builder.bind(SqlValue::Timestamp(range.to));
        let text = format!(
            "SELECT decompress_chunk(format('%I.%I', chunk_schema, chunk_name)::regclass, \
             if_compressed => true) FROM timescaledb_information.chunks \
             WHERE hypertable_name = {name} AND is_compressed \
             AND range_end > {from} AND range_start <= {to}"
        );
        builder.finish(text)
    }
}
