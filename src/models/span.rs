//! Span and trace records
//!
//! Spans follow the OpenTelemetry shape (kind, status, events, links). Traces are
//! derived aggregates, one per `(project_id, trace_id)`, folded from spans at
//! ingestion time (see [`crate::rollup`]).

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Span kind (OpenTelemetry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanKind {
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "INTERNAL",
            Self::Server => "SERVER",
            Self::Client => "CLIENT",
            Self::Producer => "PRODUCER",
            Self::Consumer => "CONSUMER",
        }
    }
}

impl FromStr for SpanKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INTERNAL" => Ok(Self::Internal),
            "SERVER" => Ok(Self::Server),
            "CLIENT" => Ok(Self::Client),
            "PRODUCER" => Ok(Self::Producer),
            "CONSUMER" => Ok(Self::Consumer),
            other => Err(format!("unknown span kind '{}'", other)),
        }
    }
}

impl fmt::Display for SpanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Span status code (OpenTelemetry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanStatus {
    Unset,
    Ok,
    Error,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "UNSET",
            Self::Ok => "OK",
            Self::Error => "ERROR",
        }
    }
}

impl FromStr for SpanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UNSET" | "" => Ok(Self::Unset),
            "OK" => Ok(Self::Ok),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown span status '{}'", other)),
        }
    }
}

impl fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timestamped event attached to a span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub time: DateTime<Utc>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
}

/// Link from a span to a span of another (or the same) trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanLink {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub project_id: String,
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub service_name: String,
    pub operation_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Always `end_time - start_time` in milliseconds
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SpanKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<SpanStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
    #[serde(default)]
    pub events: Vec<SpanEvent>,
    #[serde(default)]
    pub links: Vec<SpanLink>,
    /// Resource attributes shared by every span of the ingestion batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_attributes: Option<serde_json::Value>,
}

impl SpanRecord {
    /// Create a span with `duration_ms` derived from the bounds
    pub fn new(
        project_id: impl Into<String>,
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        service_name: impl Into<String>,
        operation_name: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            parent_span_id: None,
            service_name: service_name.into(),
            operation_name: operation_name.into(),
            start_time,
            end_time,
            duration_ms: (end_time - start_time).num_milliseconds(),
            kind: None,
            status_code: None,
            status_message: None,
            attributes: None,
            events: Vec::new(),
            links: Vec::new(),
            resource_attributes: None,
        }
    }

    pub fn child_of(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    pub fn with_status(mut self, status: SpanStatus) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_span_id.as_deref().map_or(true, str::is_empty)
    }

    pub fn is_error(&self) -> bool {
        self.status_code == Some(SpanStatus::Error)
    }

    /// Bounds truncated to microseconds; a duration that matched the old bounds
    /// is rederived so it still matches
    pub fn at_storage_precision(&self) -> Self {
        let start_time = self.start_time.trunc_subsecs(6);
        let end_time = self.end_time.trunc_subsecs(6);
        let duration_ms = if self.duration_ms == (self.end_time - self.start_time).num_milliseconds() {
            (end_time - start_time).num_milliseconds()
        } else {
            self.duration_ms
        };

        Self {
            start_time,
            end_time,
            duration_ms,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.project_id.trim().is_empty() {
            return Err("project_id is required".to_string());
        }
        if self.trace_id.is_empty() || self.span_id.is_empty() {
            return Err("trace_id and span_id are required".to_string());
        }
        if self.end_time < self.start_time {
            return Err(format!(
                "span {} ends before it starts",
                self.span_id
            ));
        }
        let expected = (self.end_time - self.start_time).num_milliseconds();
        if self.duration_ms != expected {
            return Err(format!(
                "span {} duration_ms is {} but bounds give {}",
                self.span_id, self.duration_ms, expected
            ));
        }
        Ok(())
    }
}

/// Per-trace aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub project_id: String,
    pub trace_id: String,
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_operation_name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub span_count: i64,
    pub error: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_derives_duration() {
        let start = Utc::now();
        let span = SpanRecord::new("p", "t", "s", "api", "GET /", start, start + Duration::milliseconds(250));
        assert_eq!(span.duration_ms, 250);
        assert!(span.validate().is_ok());
        assert!(span.is_root());
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let start = Utc::now();
        let mut span = SpanRecord::new("p", "t", "s", "api", "GET /", start, start);
        span.end_time = start - Duration::seconds(1);
        assert!(span.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inconsistent_duration() {
        let start = Utc::now();
        let mut span = SpanRecord::new("p", "t", "s", "api", "GET /", start, start + Duration::seconds(1));
        span.duration_ms = 5;
        assert!(span.validate().unwrap_err().contains("duration_ms"));
    }

    #[test]
    fn test_status_and_kind_serde() {
        let json = serde_json::to_string(&SpanStatus::Error).unwrap();
        assert_eq!(json, "\"ERROR\"");
        assert_eq!("server".parse::<SpanKind>().unwrap(), SpanKind::Server);
    }

    #[test]
    fn test_storage_precision_keeps_duration_consistent() {
        let start = DateTime::parse_from_rfc3339("2024-05-01T12:00:00.000999999Z")
            .unwrap()
            .with_timezone(&Utc);
        let end = start + Duration::nanoseconds(999_999);
        let span = SpanRecord::new("p", "t", "s", "api", "op", start, end);
        assert_eq!(span.duration_ms, 0);

        let stored = span.at_storage_precision();
        assert_eq!(stored.start_time.timestamp_subsec_nanos(), 999_000);
        assert_eq!(stored.end_time.timestamp_subsec_nanos(), 1_999_000);
        assert_eq!(stored.duration_ms, 1);
        assert!(stored.validate().is_ok());
    }

    #[test]
    fn test_empty_parent_counts_as_root() {
        let start = Utc::now();
        let span = SpanRecord::new("p", "t", "s", "api", "op", start, start).child_of("");
        assert!(span.is_root());
    }
}
