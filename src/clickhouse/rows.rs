//! `JSONEachRow` shapes of the ClickHouse tables
//!
//! JSON documents (metadata, attributes, events, links) are stored as text;
//! an empty string means absent.

use super::translator::DATETIME_FORMAT;
use crate::error::{StorageError, StorageResult};
use crate::models::{LogRecord, SpanRecord, StoredLogRecord, TraceRecord};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// `DateTime64(6, 'UTC')` as `YYYY-MM-DD hh:mm:ss.ffffff`, RFC 3339 also accepted on read
pub mod datetime {
    use super::*;

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(DATETIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
            return Ok(naive.and_utc());
        }
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| format!("invalid timestamp '{}': {}", raw, e))
    }
}

/// Counts arrive as numbers, or as strings when 64-bit quoting is on
pub fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn to_json_text(value: &Option<serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::Null) | None => String::new(),
        Some(value) => value.to_string(),
    }
}

fn from_json_text(raw: &str) -> StorageResult<Option<serde_json::Value>> {
    if raw.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(raw)?))
}

fn parse_enum<T>(column: &str, raw: Option<String>) -> StorageResult<Option<T>>
where
    T: std::str::FromStr<Err = String>,
{
    raw.filter(|value| !value.is_empty())
        .map(|value| {
            value.parse().map_err(|e: String| StorageError::ClickHouse {
                status: 200,
                message: format!("column {}: {}", column, e),
            })
        })
        .transpose()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRow {
    pub id: Uuid,
    #[serde(with = "datetime")]
    pub time: DateTime<Utc>,
    pub project_id: String,
    pub service: String,
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub metadata: String,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub hostname: Option<String>,
}

impl From<&StoredLogRecord> for LogRow {
    fn from(stored: &StoredLogRecord) -> Self {
        let log = &stored.record;
        Self {
            id: stored.id,
            time: log.time,
            project_id: log.project_id.clone(),
            service: log.service.clone(),
            level: log.level.as_str().to_string(),
            message: log.message.clone(),
            metadata: to_json_text(&log.metadata),
            trace_id: log.trace_id.clone(),
            span_id: log.span_id.clone(),
            hostname: log.hostname.clone(),
        }
    }
}

impl TryFrom<LogRow> for StoredLogRecord {
    type Error = StorageError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        let level = parse_level(&row.level)?;

        Ok(StoredLogRecord {
            id: row.id,
            record: LogRecord {
                time: row.time,
                project_id: row.project_id,
                service: row.service,
                level,
                message: row.message,
                metadata: from_json_text(&row.metadata)?,
                trace_id: row.trace_id,
                span_id: row.span_id,
                hostname: row.hostname,
            },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanRow {
    pub project_id: String,
    pub trace_id: String,
    pub span_id: String,
    #[serde(default)]
    pub parent_span_id: String,
    pub service_name: String,
    pub operation_name: String,
    #[serde(with = "datetime")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "datetime")]
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub kind: Option<String>,
    pub status_code: Option<String>,
    pub status_message: Option<String>,
    #[serde(default)]
    pub attributes: String,
    #[serde(default)]
    pub events: String,
    #[serde(default)]
    pub links: String,
    #[serde(default)]
    pub resource_attributes: String,
}

impl SpanRow {
    pub fn from_span(span: &SpanRecord) -> StorageResult<Self> {
        Ok(Self {
            project_id: span.project_id.clone(),
            trace_id: span.trace_id.clone(),
            span_id: span.span_id.clone(),
            parent_span_id: span.parent_span_id.clone().unwrap_or_default(),
            service_name: span.service_name.clone(),
            operation_name: span.operation_name.clone(),
            start_time: span.start_time,
            end_time: span.end_time,
            duration_ms: span.duration_ms,
            kind: span.kind.map(|kind| kind.as_str().to_string()),
            status_code: span.status_code.map(|status| status.as_str().to_string()),
            status_message: span.status_message.clone(),
            attributes: to_json_text(&span.attributes),
            events: serde_json::to_string(&span.events)?,
            links: serde_json::to_string(&span.links)?,
            resource_attributes: to_json_text(&span.resource_attributes),
        })
    }
}

impl TryFrom<SpanRow> for SpanRecord {
    type Error = StorageError;

    fn try_from(row: SpanRow) -> Result<Self, Self::Error> {
        let events = if row.events.is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&row.events)?
        };
        let links = if row.links.is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&row.links)?
        };

        Ok(SpanRecord {
            project_id: row.project_id,
            trace_id: row.trace_id,
            span_id: row.span_id,
            parent_span_id: Some(row.parent_span_id).filter(|id| !id.is_empty()),
            service_name: row.service_name,
            operation_name: row.operation_name,
            start_time: row.start_time,
            end_time: row.end_time,
            duration_ms: row.duration_ms,
            kind: parse_enum("kind", row.kind)?,
            status_code: parse_enum("status_code", row.status_code)?,
            status_message: row.status_message,
            attributes: from_json_text(&row.attributes)?,
            events,
            links,
            resource_attributes: from_json_text(&row.resource_attributes)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRow {
    pub project_id: String,
    pub trace_id: String,
    pub service_name: String,
    pub root_service_name: Option<String>,
    pub root_operation_name: Option<String>,
    #[serde(with = "datetime")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "datetime")]
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub span_count: i64,
    pub error: bool,
}

impl From<TraceRow> for TraceRecord {
    fn from(row: TraceRow) -> Self {
        TraceRecord {
            project_id: row.project_id,
            trace_id: row.trace_id,
            service_name: row.service_name,
            root_service_name: row.root_service_name,
            root_operation_name: row.root_operation_name,
            start_time: row.start_time,
            end_time: row.end_time,
            duration_ms: row.duration_ms,
            span_count: row.span_count,
            error: row.error,
        }
    }
}

/// New version of a trace aggregate
#[derive(Debug, Clone, Serialize)]
pub struct TraceVersionRow<'a> {
    pub project_id: &'a str,
    pub trace_id: &'a str,
    pub service_name: &'a str,
    pub root_service_name: Option<&'a str>,
    pub root_operation_name: Option<&'a str>,
    #[serde(with = "datetime")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "datetime")]
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub span_count: i64,
    pub error: bool,
    #[serde(with = "datetime")]
    pub updated_at: DateTime<Utc>,
}

impl<'a> TraceVersionRow<'a> {
    pub fn new(trace: &'a TraceRecord, updated_at: DateTime<Utc>) -> Self {
        Self {
            project_id: &trace.project_id,
            trace_id: &trace.trace_id,
            service_name: &trace.service_name,
            root_service_name: trace.root_service_name.as_deref(),
            root_operation_name: trace.root_operation_name.as_deref(),
            start_time: trace.start_time,
            end_time: trace.end_time,
            duration_ms: trace.duration_ms,
            span_count: trace.span_count,
            error: trace.error,
            updated_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpanKeyRow {
    pub project_id: String,
    pub trace_id: String,
    pub span_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CountRow {
    #[serde(deserialize_with = "lenient_u64")]
    pub count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionRow {
    #[serde(deserialize_with = "lenient_u64")]
    pub version: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValueRow {
    pub value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopValueRow {
    pub value: Option<String>,
    #[serde(deserialize_with = "lenient_u64")]
    pub count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BucketRow {
    #[serde(with = "datetime")]
    pub bucket: DateTime<Utc>,
    pub level: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EdgeRow {
    pub source: String,
    pub target: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub call_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartitionRow {
    pub partition_id: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub rows: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionRecord<'a> {
    pub version: u32,
    pub description: &'a str,
}

pub fn parse_level(raw: &str) -> StorageResult<crate::models::LogLevel> {
    parse_enum("level", Some(raw.to_string()))?.ok_or_else(|| StorageError::ClickHouse {
        status: 200,
        message: "column level: empty value".to_string(),
    })
}
