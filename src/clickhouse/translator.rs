//! Parameter objects to ClickHouse SQL with typed query parameters
//!
//! Placeholders are `{pN:Type}` and travel as `param_pN` on the HTTP request.
//! Because parameters are named, one placeholder may appear several times in a
//! statement.

use crate::config::TableNames;
use crate::cursor::Cursor;
use crate::error::{StorageError, StorageResult};
use crate::models::{
    AggregateParams, AggregationInterval, CountParams, DeleteParams, DistinctParams, LogField,
    LogQueryParams, ServiceDependencyParams, SpanQueryParams, TopValuesParams, TraceQueryParams,
};
use crate::translate::{Dialect, NativeQuery, SqlBuilder, SqlValue};
use chrono::{DateTime, NaiveDate, Utc};

pub const LOG_COLUMNS: &str =
    "id, time, project_id, service, level, message, metadata, trace_id, span_id, hostname";

pub const SPAN_COLUMNS: &str = "project_id, trace_id, span_id, parent_span_id, service_name, \
     operation_name, start_time, end_time, duration_ms, kind, status_code, status_message, \
     attributes, events, links, resource_attributes";

pub const TRACE_COLUMNS: &str = "project_id, trace_id, service_name, root_service_name, \
     root_operation_name, start_time, end_time, duration_ms, span_count, error";

/// Format used for `DateTime64(6, 'UTC')` values in parameters and row payloads
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

pub struct ClickHouse;

impl Dialect for ClickHouse {
    const SUPPORTS_FULLTEXT: bool = false;

    fn placeholder(index: usize, value: &SqlValue) -> String {
        format!("{{p{}:{}}}", index, param_type(value))
    }

    fn in_list(column: &str, placeholder: &str) -> String {
        format!("has({placeholder}, {column})")
    }

    fn substring_param(term: &str) -> SqlValue {
        SqlValue::Text(term.to_string())
    }

    fn substring_match(column: &str, placeholder: &str) -> String {
        format!("positionCaseInsensitiveUTF8({column}, {placeholder}) > 0")
    }
}

pub fn param_type(value: &SqlValue) -> &'static str {
    match value {
        SqlValue::Text(_) => "String",
        SqlValue::NullableText(_) | SqlValue::Json(None) => "Nullable(String)",
        SqlValue::Json(Some(_)) => "String",
        SqlValue::TextArray(_) => "Array(String)",
        SqlValue::Int(_) => "Int64",
        SqlValue::Bool(_) => "Bool",
        SqlValue::Timestamp(_) => "DateTime64(6, 'UTC')",
        SqlValue::Uuid(_) => "UUID",
        SqlValue::UuidArray(_) => "Array(UUID)",
    }
}

/// Backslash escaping for text parameters, as the HTTP interface parses them
fn escape_text(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\t' => escaped.push_str("\\t"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn quote_element(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '\'' => quoted.push_str("\\'"),
            other => quoted.push(other),
        }
    }
    quoted.push('\'');
    quoted
}

pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.format(DATETIME_FORMAT).to_string()
}

/// Text form of a parameter value for `param_pN`
pub fn param_value(value: &SqlValue) -> String {
    match value {
        SqlValue::Text(v) => escape_text(v),
        SqlValue::NullableText(Some(v)) => escape_text(v),
        SqlValue::NullableText(None) | SqlValue::Json(None) => "\\N".to_string(),
        SqlValue::Json(Some(v)) => escape_text(&v.to_string()),
        SqlValue::TextArray(values) => {
            let items: Vec<String> = values.iter().map(|v| quote_element(v)).collect();
            format!("[{}]", items.join(","))
        }
        SqlValue::Int(v) => v.to_string(),
        SqlValue::Bool(v) => v.to_string(),
        SqlValue::Timestamp(v) => format_datetime(v),
        SqlValue::Uuid(v) => v.to_string(),
        SqlValue::UuidArray(values) => {
            let items: Vec<String> = values.iter().map(|v| format!("'{}'", v)).collect();
            format!("[{}]", items.join(","))
        }
    }
}

/// `(name, value)` pairs for the HTTP query string
pub fn http_params(query: &NativeQuery) -> Vec<(String, String)> {
    query
        .params
        .iter()
        .enumerate()
        .map(|(index, value)| (format!("param_p{}", index), param_value(value)))
        .collect()
}

fn time_bucket(interval: AggregationInterval) -> &'static str {
    match interval {
        AggregationInterval::Minute => "toStartOfInterval(time, INTERVAL 1 MINUTE)",
        AggregationInterval::Hour => "toStartOfInterval(time, INTERVAL 1 HOUR)",
        AggregationInterval::Day => "toStartOfInterval(time, INTERVAL 1 DAY)",
        AggregationInterval::Week => "toDateTime(toMonday(time), 'UTC')",
    }
}

/// Day covered by a `toYYYYMMDD` partition id, as `[start, end)`
pub fn partition_day(partition_id: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    if partition_id.len() != 8 || !partition_id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let day = NaiveDate::parse_from_str(partition_id, "%Y%m%d").ok()?;
    let start = day.and_hms_opt(0, 0, 0)?.and_utc();
    Some((start, start + chrono::Duration::days(1)))
}

#[derive(Debug, Clone)]
pub struct ClickHouseTranslator {
    database: String,
    tables: TableNames,
}

impl ClickHouseTranslator {
    pub fn new(database: impl Into<String>, tables: TableNames) -> Self {
        Self {
            database: database.into(),
            tables,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    /// Database-qualified table name
    pub fn qualified(&self, table: &str) -> String {
        format!("{}.{}", self.database, table)
    }

    fn logs(&self) -> String {
        self.qualified(&self.tables.logs)
    }

    fn spans(&self) -> String {
        self.qualified(&self.tables.spans)
    }

    fn traces(&self) -> String {
        self.qualified(&self.tables.traces)
    }

    /// Metadata is stored as JSON text; string leaves come back unquoted
    fn field_expr(builder: &mut SqlBuilder<ClickHouse>, field: &LogField) -> String {
        match field {
            LogField::ProjectId => "project_id".to_string(),
            LogField::Service => "service".to_string(),
            LogField::Level => "level".to_string(),
            LogField::Hostname => "hostname".to_string(),
            LogField::TraceId => "trace_id".to_string(),
            LogField::Metadata(path) => {
                let keys: Vec<String> = path
                    .iter()
                    .map(|key| builder.bind(SqlValue::Text(key.clone())))
                    .collect();
                let keys = keys.join(", ");
                format!(
                    "nullIf(if(JSONType(metadata, {keys}) = 'String', \
                     JSONExtractString(metadata, {keys}), JSONExtractRaw(metadata, {keys})), '')"
                )
            }
        }
    }

    pub fn query_logs(&self, params: &LogQueryParams) -> StorageResult<NativeQuery> {
        let cursor = params.cursor.as_deref().map(Cursor::decode).transpose()?;

        let mut builder = SqlBuilder::<ClickHouse>::new();
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
            self.logs(),
            builder.where_clause(),
            params.limit + 1
        );
        if cursor.is_none() && params.offset > 0 {
            text.push_str(&format!(" OFFSET {}", params.offset));
        }

        Ok(builder.finish(text))
    }

    pub fn get_log_by_id(&self, id: uuid::Uuid, project_id: &str) -> NativeQuery {
        let mut builder = SqlBuilder::<ClickHouse>::new();
        let id = builder.bind(SqlValue::Uuid(id));
        let project = builder.bind(SqlValue::Text(project_id.to_string()));
        let text = format!(
            "SELECT {LOG_COLUMNS} FROM {} WHERE project_id = {project} AND id = {id} LIMIT 1",
            self.logs()
        );
        builder.finish(text)
    }

    pub fn get_logs_by_ids(&self, ids: &[uuid::Uuid], project_id: &str) -> NativeQuery {
        let mut builder = SqlBuilder::<ClickHouse>::new();
        let ids = builder.bind(SqlValue::UuidArray(ids.to_vec()));
        let project = builder.bind(SqlValue::Text(project_id.to_string()));
        let text = format!(
            "SELECT {LOG_COLUMNS} FROM {} WHERE project_id = {project} AND has({ids}, id) \
             ORDER BY time DESC, id DESC",
            self.logs()
        );
        builder.finish(text)
    }

    pub fn count_logs(&self, params: &CountParams) -> NativeQuery {
        let mut builder = SqlBuilder::<ClickHouse>::new();
        builder.log_filters(&params.range, &params.filters);
        let text = format!(
            "SELECT count() AS count FROM {}{}",
            self.logs(),
            builder.where_clause()
        );
        builder.finish(text)
    }

    pub fn distinct_values(&self, params: &DistinctParams) -> NativeQuery {
        let mut builder = SqlBuilder::<ClickHouse>::new();
        let expr = Self::field_expr(&mut builder, &params.field);
        builder.log_filters(&params.range, &params.filters);
        builder.push(format!("{expr} IS NOT NULL"));
        let text = format!(
            "SELECT DISTINCT {expr} AS value FROM {}{} ORDER BY value ASC LIMIT {}",
            self.logs(),
            builder.where_clause(),
            params.limit
        );
        builder.finish(text)
    }

    pub fn top_values(&self, params: &TopValuesParams) -> NativeQuery {
        let mut builder = SqlBuilder::<ClickHouse>::new();
        let expr = Self::field_expr(&mut builder, &params.field);
        builder.log_filters(&params.range, &params.filters);
        builder.push(format!("{expr} IS NOT NULL"));
        let text = format!(
            "SELECT {expr} AS value, count() AS count FROM {}{} \
             GROUP BY value ORDER BY count DESC, value ASC LIMIT {}",
            self.logs(),
            builder.where_clause(),
            params.limit
        );
        builder.finish(text)
    }

    pub fn aggregate(&self, params: &AggregateParams) -> NativeQuery {
        let mut builder = SqlBuilder::<ClickHouse>::new();
        builder.log_filters(&params.range, &params.filters);
        let text = format!(
            "SELECT {} AS bucket, level, count() AS count FROM {}{} \
             GROUP BY bucket, level ORDER BY bucket ASC",
            time_bucket(params.interval),
            self.logs(),
            builder.where_clause()
        );
        builder.finish(text)
    }

    fn delete_where(column: &str, params: &DeleteParams) -> SqlBuilder<ClickHouse> {
        let mut builder = SqlBuilder::<ClickHouse>::new();
        builder.one_or_many("project_id", &params.project_ids);
        builder.time_range(column, &params.range());
        builder
    }

    /// Background mutation; returns before rows are gone
    pub fn delete_logs(&self, params: &DeleteParams) -> NativeQuery {
        let builder = Self::delete_where("time", params);
        let text = format!(
            "ALTER TABLE {} DELETE{}",
            self.logs(),
            builder.where_clause()
        );
        builder.finish(text)
    }

    pub fn insert_logs(&self) -> String {
        format!("INSERT INTO {} ({LOG_COLUMNS}) FORMAT JSONEachRow", self.logs())
    }

    pub fn insert_spans(&self) -> String {
        format!("INSERT INTO {} ({SPAN_COLUMNS}) FORMAT JSONEachRow", self.spans())
    }

    pub fn insert_traces(&self) -> String {
        format!(
            "INSERT INTO {} ({TRACE_COLUMNS}, updated_at) FORMAT JSONEachRow",
            self.traces()
        )
    }

    /// Span keys already stored for the given traces within `[from, to]`
    pub fn existing_span_keys(
        &self,
        project_ids: &[String],
        trace_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> NativeQuery {
        let mut builder = SqlBuilder::<ClickHouse>::new();
        builder.time_range("start_time", &crate::models::TimeRange::new(from, to));
        let projects = builder.bind(SqlValue::TextArray(project_ids.to_vec()));
        let traces = builder.bind(SqlValue::TextArray(trace_ids.to_vec()));
        builder.push(format!("has({projects}, project_id)"));
        builder.push(format!("has({traces}, trace_id)"));
        let text = format!(
            "SELECT DISTINCT project_id, trace_id, span_id FROM {}{}",
            self.spans(),
            builder.where_clause()
        );
        builder.finish(text)
    }

    /// Every stored span of the listed traces, one row per span key
    pub fn spans_of_traces(&self, project_ids: &[String], trace_ids: &[String]) -> NativeQuery {
        let mut builder = SqlBuilder::<ClickHouse>::new();
        let projects = builder.bind(SqlValue::TextArray(project_ids.to_vec()));
        let traces = builder.bind(SqlValue::TextArray(trace_ids.to_vec()));
        let text = format!(
            "SELECT {SPAN_COLUMNS} FROM {} \
             WHERE has({projects}, project_id) AND has({traces}, trace_id) \
             LIMIT 1 BY project_id, trace_id, span_id",
            self.spans()
        );
        builder.finish(text)
    }

    /// Latest version of each listed trace
    pub fn traces_by_keys(&self, project_ids: &[String], trace_ids: &[String]) -> NativeQuery {
        let mut builder = SqlBuilder::<ClickHouse>::new();
        let projects = builder.bind(SqlValue::TextArray(project_ids.to_vec()));
        let traces = builder.bind(SqlValue::TextArray(trace_ids.to_vec()));
        let text = format!(
            "SELECT {TRACE_COLUMNS} FROM {} FINAL \
             WHERE has({projects}, project_id) AND has({traces}, trace_id)",
            self.traces()
        );
        builder.finish(text)
    }

    fn span_where(params: &SpanQueryParams) -> SqlBuilder<ClickHouse> {
        let mut builder = SqlBuilder::<ClickHouse>::new();
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

    pub fn query_spans(&self, params: &SpanQueryParams) -> (NativeQuery, NativeQuery) {
        let order = params.order.as_sql();
        let builder = Self::span_where(params);
        let page = format!(
            "SELECT {SPAN_COLUMNS} FROM {}{} ORDER BY start_time {order}, span_id {order} \
             LIMIT {} OFFSET {}",
            self.spans(),
            builder.where_clause(),
            params.limit,
            params.offset
        );
        let page = builder.finish(page);

        let builder = Self::span_where(params);
        let count = format!(
            "SELECT count() AS count FROM {}{}",
            self.spans(),
            builder.where_clause()
        );
        (page, builder.finish(count))
    }

    fn trace_where(params: &TraceQueryParams) -> SqlBuilder<ClickHouse> {
        let mut builder = SqlBuilder::<ClickHouse>::new();
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

    /// Reads resolve trace versions with `FINAL`
    pub fn query_traces(&self, params: &TraceQueryParams) -> (NativeQuery, NativeQuery) {
        let builder = Self::trace_where(params);
        let page = format!(
            "SELECT {TRACE_COLUMNS} FROM {} FINAL{} \
             ORDER BY start_time DESC, trace_id DESC LIMIT {} OFFSET {}",
            self.traces(),
            builder.where_clause(),
            params.limit,
            params.offset
        );
        let page = builder.finish(page);

        let builder = Self::trace_where(params);
        let count = format!(
            "SELECT count() AS count FROM {} FINAL{}",
            self.traces(),
            builder.where_clause()
        );
        (page, builder.finish(count))
    }

    pub fn spans_by_trace_id(&self, trace_id: &str, project_id: &str) -> NativeQuery {
        let mut builder = SqlBuilder::<ClickHouse>::new();
        let trace = builder.bind(SqlValue::Text(trace_id.to_string()));
        let project = builder.bind(SqlValue::Text(project_id.to_string()));
        let text = format!(
            "SELECT {SPAN_COLUMNS} FROM {} WHERE project_id = {project} AND trace_id = {trace} \
             ORDER BY start_time ASC, span_id ASC",
            self.spans()
        );
        builder.finish(text)
    }

    pub fn trace_by_id(&self, trace_id: &str, project_id: &str) -> NativeQuery {
        let mut builder = SqlBuilder::<ClickHouse>::new();
        let trace = builder.bind(SqlValue::Text(trace_id.to_string()));
        let project = builder.bind(SqlValue::Text(project_id.to_string()));
        let text = format!(
            "SELECT {TRACE_COLUMNS} FROM {} FINAL \
             WHERE project_id = {project} AND trace_id = {trace} LIMIT 1",
            self.traces()
        );
        builder.finish(text)
    }

    /// Both join sides are restricted to the window before joining
    pub fn service_dependencies(&self, params: &ServiceDependencyParams) -> NativeQuery {
        let mut builder = SqlBuilder::<ClickHouse>::new();
        builder.time_range("start_time", &params.range);
        builder.one_or_many("project_id", &params.project_ids);
        let filter = builder.where_clause();
        let spans = self.spans();
        let text = format!(
            "SELECT parent.service_name AS source, child.service_name AS target, \
             count() AS call_count \
             FROM (SELECT project_id, trace_id, parent_span_id, service_name \
             FROM {spans}{filter}) AS child \
             INNER JOIN (SELECT project_id, trace_id, span_id, service_name \
             FROM {spans}{filter}) AS parent \
             ON parent.project_id = child.project_id \
             AND parent.trace_id = child.trace_id \
             AND parent.span_id = child.parent_span_id \
             WHERE parent.service_name != child.service_name \
             GROUP BY source, target ORDER BY call_count DESC, source ASC, target ASC"
        );
        builder.finish(text)
    }

    pub fn delete_spans(&self, params: &DeleteParams) -> (NativeQuery, NativeQuery) {
        let builder = Self::delete_where("start_time", params);
        let spans = format!(
            "ALTER TABLE {} DELETE{}",
            self.spans(),
            builder.where_clause()
        );
        let spans = builder.finish(spans);

        let builder = Self::delete_where("start_time", params);
        let traces = format!(
            "ALTER TABLE {} DELETE{}",
            self.traces(),
            builder.where_clause()
        );
        (spans, builder.finish(traces))
    }

    /// Trace aggregates that started before `older_than`, for every project
    pub fn delete_traces_before(&self, older_than: DateTime<Utc>) -> NativeQuery {
        let mut builder = SqlBuilder::<ClickHouse>::new();
        let cutoff = builder.bind(SqlValue::Timestamp(older_than));
        let text = format!(
            "ALTER TABLE {} DELETE WHERE start_time < {cutoff}",
            self.traces()
        );
        builder.finish(text)
    }

    pub fn list_partitions(&self, table: &str) -> NativeQuery {
        let mut builder = SqlBuilder::<ClickHouse>::new();
        let database = builder.bind(SqlValue::Text(self.database.clone()));
        let table = builder.bind(SqlValue::Text(table.to_string()));
        let text = format!(
            "SELECT partition_id, sum(rows) AS rows, sum(bytes_on_disk) AS bytes \
             FROM system.parts WHERE database = {database} AND table = {table} AND active \
             GROUP BY partition_id ORDER BY partition_id ASC"
        );
        builder.finish(text)
    }

    pub fn drop_partition(&self, table: &str, partition_id: &str) -> StorageResult<NativeQuery> {
        if partition_day(partition_id).is_none() {
            return Err(StorageError::InvalidParams(format!(
                "'{}' is not a daily partition id",
                partition_id
            )));
        }
        Ok(NativeQuery::new(format!(
            "ALTER TABLE {} DROP PARTITION ID '{}'",
            self.qualified(table),
            partition_id
        )))
    }

    pub fn pending_mutations(&self) -> NativeQuery {
        let mut builder = SqlBuilder::<ClickHouse>::new();
        let database = builder.bind(SqlValue::Text(self.database.clone()));
        let tables = builder.bind(SqlValue::TextArray(vec![
            self.tables.logs.clone(),
            self.tables.spans.clone(),
            self.tables.traces.clone(),
        ]));
        let text = format!(
            "SELECT count() AS count FROM system.mutations \
             WHERE database = {database} AND is_done = 0 AND has({tables}, table)"
        );
        builder.finish(text)
    }
}
