//! Shared record, parameter and result types
//!
//! Pure data contracts used by every engine and by the facade. Nothing here
//! performs I/O.

pub mod capabilities;
pub mod health;
pub mod log;
pub mod params;
pub mod results;
pub mod span;

pub use capabilities::{EngineCapabilities, FilterOperator};
pub use health::{HealthState, HealthStatus};
pub use log::{LogLevel, LogRecord, StoredLogRecord};
pub use params::{
    AggregateParams, AggregationInterval, CountParams, Dataset, DeleteParams, DistinctParams,
    LogField, LogFilters, LogQueryParams, SearchMode, ServiceDependencyParams, SortOrder,
    SpanQueryParams, TextSearch, TimeRange, TopValuesParams, TraceQueryParams,
};
pub use results::{
    partition_valid, AggregateResult, CountResult, DeleteResult, DistinctResult, IngestError,
    IngestResult, IngestReturningResult, LogQueryResult, SegmentInfo, ServiceDependencies,
    ServiceEdge, ServiceNode, SpanQueryResult, TimeBucket, TopValue, TopValuesResult,
    TraceQueryResult,
};
pub use span::{SpanEvent, SpanKind, SpanLink, SpanRecord, SpanStatus, TraceRecord};
