use crate::models::log::{LogLevel, StoredLogRecord};
use crate::models::span::{SpanRecord, TraceRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Failure attributed to one record, or to the whole batch when `index` is `None`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub message: String,
}

/// Split a batch into the records passing `validate` and one error per rejected index
pub fn partition_valid<T, F>(records: &[T], validate: F) -> (Vec<&T>, Vec<IngestError>)
where
    F: Fn(&T) -> Result<(), String>,
{
    let mut accepted = Vec::with_capacity(records.len());
    let mut rejected = Vec::new();
    for (index, record) in records.iter().enumerate() {
        match validate(record) {
            Ok(()) => accepted.push(record),
            Err(message) => rejected.push(IngestError {
                index: Some(index),
                message,
            }),
        }
    }
    (accepted, rejected)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResult {
    pub ingested: usize,
    pub failed: usize,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<IngestError>,
}

impl IngestResult {
    /// Rejected rows plus every row of a write that failed as a unit
    pub fn batch_failed(
        rejected: Vec<IngestError>,
        attempted: usize,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        let mut errors = rejected;
        let failed = errors.len() + attempted;
        errors.push(IngestError {
            index: None,
            message: message.into(),
        });
        Self {
            ingested: 0,
            failed,
            duration_ms,
            errors,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

impl IngestReturningResult {
    pub fn batch_failed(
        rejected: Vec<IngestError>,
        attempted: usize,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        let result = IngestResult::batch_failed(rejected, attempted, message, duration_ms);
        Self {
            ingested: 0,
            failed: result.failed,
            duration_ms,
            errors: result.errors,
            rows: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReturningResult {
    pub ingested: usize,
    pub failed: usize,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<IngestError>,
    /// Stored rows with their generated ids, in input order of the accepted records
    pub rows: Vec<StoredLogRecord>,
}

impl From<IngestReturningResult> for IngestResult {
    fn from(result: IngestReturningResult) -> Self {
        Self {
            ingested: result.ingested,
            failed: result.failed,
            duration_ms: result.duration_ms,
            errors: result.errors,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogQueryResult {
    pub logs: Vec<StoredLogRecord>,
    pub has_more: bool,
    pub limit: usize,
    pub offset: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountResult {
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistinctResult {
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopValue {
    pub value: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopValuesResult {
    pub values: Vec<TopValue>,
}

/// Counts for one calendar-aligned interval; `total` equals the sum of `by_level`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBucket {
    pub bucket: DateTime<Utc>,
    pub total: u64,
    pub by_level: BTreeMap<LogLevel, u64>,
}

impl TimeBucket {
    /// Fold `(bucket, level, count)` rows into buckets ordered by time.
    /// Rows with a zero count never create a bucket.
    pub fn fold<I>(rows: I) -> Vec<TimeBucket>
    where
        I: IntoIterator<Item = (DateTime<Utc>, LogLevel, u64)>,
    {
        let mut buckets: BTreeMap<DateTime<Utc>, BTreeMap<LogLevel, u64>> = BTreeMap::new();
        for (bucket, level, count) in rows {
            if count == 0 {
                continue;
            }
            *buckets.entry(bucket).or_default().entry(level).or_insert(0) += count;
        }

        buckets
            .into_iter()
            .map(|(bucket, by_level)| TimeBucket {
                bucket,
                total: by_level.values().sum(),
                by_level,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub timeseries: Vec<TimeBucket>,
    pub total: u64,
}

impl AggregateResult {
    pub fn from_buckets(timeseries: Vec<TimeBucket>) -> Self {
        let total = timeseries.iter().map(|bucket| bucket.total).sum();
        Self { timeseries, total }
    }
}

/// `deleted` is 0 on engines whose deletes run as background mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub deleted: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanQueryResult {
    pub spans: Vec<SpanRecord>,
    pub total: u64,
    pub has_more: bool,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceQueryResult {
    pub traces: Vec<TraceRecord>,
    pub total: u64,
    pub has_more: bool,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub name: String,
    /// Calls the service took part in, as caller or callee
    pub call_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEdge {
    pub source: String,
    pub target: String,
    pub call_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDependencies {
    pub nodes: Vec<ServiceNode>,
    pub edges: Vec<ServiceEdge>,
}

/// Backend-native time-partitioned storage unit (TimescaleDB chunk, ClickHouse partition)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub name: String,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
}
