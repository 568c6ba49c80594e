use crate::engine::EngineKind;
use crate::models::params::AggregationInterval;
use serde::Serialize;

/// Comparison operator an engine can evaluate natively
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    /// Equal (=)
    Eq,
    /// Not equal (!=)
    Ne,
    /// Greater than (>)
    Gt,
    /// Greater than or equal (>=)
    Gte,
    /// Less than (<)
    Lt,
    /// Less than or equal (<=)
    Lte,
    /// In list
    In,
    /// Not in list
    NotIn,
    /// Contains (LIKE %value%)
    Contains,
    /// Starts with (LIKE value%)
    StartsWith,
    /// Ends with (LIKE %value)
    EndsWith,
}

/// Static declaration of the optional behaviors an engine supports.
///
/// Callers consult this to choose a fast path or a portable fallback instead
/// of probing behavior at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineCapabilities {
    pub engine: EngineKind,
    /// `false` means `fulltext` searches run with substring semantics
    pub supports_full_text_search: bool,
    pub supports_aggregations: bool,
    pub supports_streaming: bool,
    pub supports_transactions: bool,
    pub max_batch_size: usize,
    pub native_compression: bool,
    pub native_tiering: bool,
    /// Deletes return before rows are gone and report `deleted = 0`
    pub async_deletes: bool,
    pub supports_segment_drop: bool,
    pub supported_operators: &'static [FilterOperator],
    pub supported_intervals: &'static [AggregationInterval],
}

impl EngineCapabilities {
    pub fn supports_operator(&self, operator: FilterOperator) -> bool {
        self.supported_operators.contains(&operator)
    }

    pub fn supports_interval(&self, interval: AggregationInterval) -> bool {
        self.supported_intervals.contains(&interval)
    }
}

/// Every operator; both engines evaluate the full set
pub const ALL_OPERATORS: &[FilterOperator] = &[
    FilterOperator::Eq,
    FilterOperator::Ne,
    FilterOperator::Gt,
    FilterOperator::Gte,
    FilterOperator::Lt,
    FilterOperator::Lte,
    FilterOperator::In,
    FilterOperator::NotIn,
    FilterOperator::Contains,
    FilterOperator::StartsWith,
    FilterOperator::EndsWith,
];
