//! Parameter objects for every storage operation
//!
//! Every read or delete against log/span data carries a bounded [`TimeRange`].
//! Callers wanting "all time" pass explicit epoch-to-now bounds.

use crate::error::{StorageError, StorageResult};
use crate::models::log::LogLevel;
use crate::models::span::{SpanKind, SpanStatus};
use chrono::{DateTime, Datelike, Duration, DurationRound, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default page size
pub const DEFAULT_LIMIT: usize = 100;

/// Upper bound on a single page
pub const MAX_LIMIT: usize = 10_000;

/// Time bounds, inclusive on both ends unless marked exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[serde(default)]
    pub from_exclusive: bool,
    #[serde(default)]
    pub to_exclusive: bool,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            from_exclusive: false,
            to_exclusive: false,
        }
    }

    /// `[from, to)`
    pub fn half_open(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            to_exclusive: true,
            ..Self::new(from, to)
        }
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.from > self.to {
            return Err(StorageError::InvalidParams(format!(
                "time range start {} is after end {}",
                self.from.to_rfc3339(),
                self.to.to_rfc3339()
            )));
        }
        if self.from == self.to && (self.from_exclusive || self.to_exclusive) {
            return Err(StorageError::InvalidParams(
                "time range is empty: equal bounds with an exclusive side".to_string(),
            ));
        }
        Ok(())
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        let after_start = if self.from_exclusive {
            time > self.from
        } else {
            time >= self.from
        };
        let before_end = if self.to_exclusive {
            time < self.to
        } else {
            time <= self.to
        };
        after_start && before_end
    }

    /// Comparison operators for the lower and upper bound
    pub fn operators(&self) -> (&'static str, &'static str) {
        (
            if self.from_exclusive { ">" } else { ">=" },
            if self.to_exclusive { "<" } else { "<=" },
        )
    }
}

/// Free-text search strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Token/index based search where the engine supports it
    #[default]
    Fulltext,
    /// Literal, case-insensitive containment
    Substring,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSearch {
    pub term: String,
    #[serde(default)]
    pub mode: SearchMode,
}

impl TextSearch {
    pub fn fulltext(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            mode: SearchMode::Fulltext,
        }
    }

    pub fn substring(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            mode: SearchMode::Substring,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    /// Keyset comparison operator for rows after the cursor
    pub fn keyset_operator(&self) -> &'static str {
        match self {
            Self::Asc => ">",
            Self::Desc => "<",
        }
    }
}

/// Filters shared by log reads
///
/// A list with one value becomes an equality predicate, several values an `IN`.
/// Service and hostname filters also match the literal `"unknown"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogFilters {
    #[serde(default)]
    pub project_ids: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub levels: Vec<LogLevel>,
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub search: Option<TextSearch>,
}

impl LogFilters {
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_ids: vec![project_id.into()],
            ..Default::default()
        }
    }

    fn validate(&self) -> StorageResult<()> {
        if let Some(search) = &self.search {
            if search.term.trim().is_empty() {
                return Err(StorageError::InvalidParams(
                    "search term cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn validate_limit(limit: usize) -> StorageResult<()> {
    if limit == 0 {
        return Err(StorageError::InvalidParams(
            "limit must be greater than 0".to_string(),
        ));
    }
    if limit > MAX_LIMIT {
        return Err(StorageError::InvalidParams(format!(
            "limit cannot exceed {}",
            MAX_LIMIT
        )));
    }
    Ok(())
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogQueryParams {
    pub range: TimeRange,
    #[serde(default)]
    pub filters: LogFilters,
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Ignored when `cursor` is set
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub order: SortOrder,
}

impl LogQueryParams {
    pub fn new(range: TimeRange) -> Self {
        Self {
            range,
            filters: LogFilters::default(),
            limit: DEFAULT_LIMIT,
            offset: 0,
            cursor: None,
            order: SortOrder::default(),
        }
    }

    pub fn validate(&self) -> StorageResult<()> {
        self.range.validate()?;
        self.filters.validate()?;
        validate_limit(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountParams {
    pub range: TimeRange,
    #[serde(default)]
    pub filters: LogFilters,
}

impl CountParams {
    pub fn validate(&self) -> StorageResult<()> {
        self.range.validate()?;
        self.filters.validate()
    }
}

/// Field targeted by `distinct` and `top_values`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogField {
    ProjectId,
    Service,
    Level,
    Hostname,
    TraceId,
    /// Dotted path into `metadata`, e.g. `metadata.user.id` -> `["user", "id"]`
    Metadata(Vec<String>),
}

impl FromStr for LogField {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project_id" => Ok(Self::ProjectId),
            "service" => Ok(Self::Service),
            "level" => Ok(Self::Level),
            "hostname" => Ok(Self::Hostname),
            "trace_id" => Ok(Self::TraceId),
            other => {
                let path = other.strip_prefix("metadata.").ok_or_else(|| {
                    StorageError::InvalidParams(format!("unknown field '{}'", other))
                })?;
                let segments: Vec<String> = path.split('.').map(str::to_string).collect();
                if segments.iter().any(|segment| segment.is_empty()) {
                    return Err(StorageError::InvalidParams(format!(
                        "invalid metadata path '{}'",
                        other
                    )));
                }
                Ok(Self::Metadata(segments))
            }
        }
    }
}

impl TryFrom<String> for LogField {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LogField> for String {
    fn from(field: LogField) -> Self {
        field.to_string()
    }
}

impl fmt::Display for LogField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProjectId => f.write_str("project_id"),
            Self::Service => f.write_str("service"),
            Self::Level => f.write_str("level"),
            Self::Hostname => f.write_str("hostname"),
            Self::TraceId => f.write_str("trace_id"),
            Self::Metadata(path) => write!(f, "metadata.{}", path.join(".")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistinctParams {
    pub range: TimeRange,
    pub field: LogField,
    #[serde(default)]
    pub filters: LogFilters,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl DistinctParams {
    pub fn validate(&self) -> StorageResult<()> {
        self.range.validate()?;
        self.filters.validate()?;
        validate_limit(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopValuesParams {
    pub range: TimeRange,
    pub field: LogField,
    #[serde(default)]
    pub filters: LogFilters,
    #[serde(default = "default_top_limit")]
    pub limit: usize,
}

fn default_top_limit() -> usize {
    10
}

impl TopValuesParams {
    pub fn validate(&self) -> StorageResult<()> {
        self.range.validate()?;
        self.filters.validate()?;
        validate_limit(self.limit)
    }
}

/// Calendar-aligned bucket width for `aggregate`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationInterval {
    Minute,
    Hour,
    Day,
    Week,
}

impl AggregationInterval {
    pub const ALL: [AggregationInterval; 4] = [
        AggregationInterval::Minute,
        AggregationInterval::Hour,
        AggregationInterval::Day,
        AggregationInterval::Week,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Self::Minute => Duration::minutes(1),
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::days(1),
            Self::Week => Duration::weeks(1),
        }
    }

    /// Start of the UTC calendar bucket containing `time`; weeks start on Monday
    pub fn bucket_start(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Week => {
                let days_from_monday = i64::from(time.weekday().num_days_from_monday());
                let monday = time.date_naive() - Duration::days(days_from_monday);
                monday.and_time(NaiveTime::MIN).and_utc()
            }
            other => time.duration_trunc(other.duration()).unwrap_or(time),
        }
    }
}

impl FromStr for AggregationInterval {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minute" | "1m" => Ok(Self::Minute),
            "hour" | "1h" => Ok(Self::Hour),
            "day" | "1d" => Ok(Self::Day),
            "week" | "1w" => Ok(Self::Week),
            other => Err(StorageError::InvalidParams(format!(
                "unsupported interval '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateParams {
    pub range: TimeRange,
    pub interval: AggregationInterval,
    #[serde(default)]
    pub filters: LogFilters,
}

impl AggregateParams {
    pub fn validate(&self) -> StorageResult<()> {
        self.range.validate()?;
        self.filters.validate()
    }
}

/// Deletes `from <= time < to` for the given projects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteParams {
    pub project_ids: Vec<String>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl DeleteParams {
    pub fn new(project_ids: Vec<String>, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            project_ids,
            from,
            to,
        }
    }

    pub fn range(&self) -> TimeRange {
        TimeRange::half_open(self.from, self.to)
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.project_ids.is_empty() {
            return Err(StorageError::InvalidParams(
                "delete requires at least one project id".to_string(),
            ));
        }
        if self.from >= self.to {
            return Err(StorageError::InvalidParams(
                "delete range start must be before its end".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanQueryParams {
    pub range: TimeRange,
    #[serde(default)]
    pub project_ids: Vec<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub operation_name: Option<String>,
    #[serde(default)]
    pub kinds: Vec<SpanKind>,
    #[serde(default)]
    pub status_codes: Vec<SpanStatus>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub order: SortOrder,
}

impl SpanQueryParams {
    pub fn new(range: TimeRange) -> Self {
        Self {
            range,
            project_ids: Vec::new(),
            trace_id: None,
            services: Vec::new(),
            operation_name: None,
            kinds: Vec::new(),
            status_codes: Vec::new(),
            limit: DEFAULT_LIMIT,
            offset: 0,
            order: SortOrder::default(),
        }
    }

    pub fn validate(&self) -> StorageResult<()> {
        self.range.validate()?;
        validate_limit(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceQueryParams {
    pub range: TimeRange,
    #[serde(default)]
    pub project_ids: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub error: Option<bool>,
    #[serde(default)]
    pub min_duration_ms: Option<i64>,
    #[serde(default)]
    pub max_duration_ms: Option<i64>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl TraceQueryParams {
    pub fn new(range: TimeRange) -> Self {
        Self {
            range,
            project_ids: Vec::new(),
            services: Vec::new(),
            error: None,
            min_duration_ms: None,
            max_duration_ms: None,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }

    pub fn validate(&self) -> StorageResult<()> {
        self.range.validate()?;
        if let (Some(min), Some(max)) = (self.min_duration_ms, self.max_duration_ms) {
            if min > max {
                return Err(StorageError::InvalidParams(
                    "min_duration_ms is greater than max_duration_ms".to_string(),
                ));
            }
        }
        validate_limit(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDependencyParams {
    pub range: TimeRange,
    #[serde(default)]
    pub project_ids: Vec<String>,
}

impl ServiceDependencyParams {
    pub fn validate(&self) -> StorageResult<()> {
        self.range.validate()
    }
}

/// Table family targeted by segment and retention operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    Logs,
    Spans,
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logs => f.write_str("logs"),
            Self::Spans => f.write_str("spans"),
        }
    }
}

impl FromStr for Dataset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "logs" => Ok(Self::Logs),
            "spans" => Ok(Self::Spans),
            other => Err(format!("unknown dataset '{}'", other)),
        }
    }
}
