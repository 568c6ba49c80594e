//! Span batches to trace aggregates and service dependency graphs

use crate::models::{ServiceDependencies, ServiceEdge, ServiceNode, SpanRecord, TraceRecord};
use std::collections::BTreeMap;

impl TraceRecord {
    /// Aggregate for a trace containing only `span`
    pub fn from_span(span: &SpanRecord) -> Self {
        let root = span.is_root();
        Self {
            project_id: span.project_id.clone(),
            trace_id: span.trace_id.clone(),
            service_name: span.service_name.clone(),
            root_service_name: root.then(|| span.service_name.clone()),
            root_operation_name: root.then(|| span.operation_name.clone()),
            start_time: span.start_time,
            end_time: span.end_time,
            duration_ms: span.duration_ms,
            span_count: 1,
            error: span.is_error(),
        }
    }

    /// Fold `other` into `self`.
    ///
    /// Bounds only widen, `span_count` adds, `error` never clears, and the root
    /// names already known win over incoming ones. When the root first becomes
    /// known, `service_name` switches to the root's service.
    pub fn merge(&mut self, other: &TraceRecord) {
        if self.root_service_name.is_none() && other.root_service_name.is_some() {
            self.service_name = other.service_name.clone();
        }
        if self.root_service_name.is_none() {
            self.root_service_name = other.root_service_name.clone();
        }
        if self.root_operation_name.is_none() {
            self.root_operation_name = other.root_operation_name.clone();
        }
        self.start_time = self.start_time.min(other.start_time);
        self.end_time = self.end_time.max(other.end_time);
        self.duration_ms = (self.end_time - self.start_time).num_milliseconds();
        self.span_count += other.span_count;
        self.error |= other.error;
    }

    /// Fold in another aggregate of the same spans: everything merges except
    /// `span_count`, which keeps the larger side
    pub fn reconcile(&mut self, other: &TraceRecord) {
        let span_count = self.span_count.max(other.span_count);
        self.merge(other);
        self.span_count = span_count;
    }
}

/// One aggregate per `(project_id, trace_id)`, ordered by that key
pub fn fold_spans<'a, I>(spans: I) -> Vec<TraceRecord>
where
    I: IntoIterator<Item = &'a SpanRecord>,
{
    let mut traces: BTreeMap<(String, String), TraceRecord> = BTreeMap::new();

    for span in spans {
        let incoming = TraceRecord::from_span(span);
        traces
            .entry((span.project_id.clone(), span.trace_id.clone()))
            .and_modify(|trace| trace.merge(&incoming))
            .or_insert(incoming);
    }

    traces.into_values().collect()
}

/// Build the graph from `(source, target, calls)` rows.
///
/// Self edges are dropped and duplicate pairs merged. A node's `call_count` is
/// the number of calls it took part in on either side.
pub fn dependency_graph<I>(edges: I) -> ServiceDependencies
where
    I: IntoIterator<Item = (String, String, u64)>,
{
    let mut merged: BTreeMap<(String, String), u64> = BTreeMap::new();
    for (source, target, calls) in edges {
        if source == target || calls == 0 {
            continue;
        }
        *merged.entry((source, target)).or_insert(0) += calls;
    }

    let mut nodes: BTreeMap<String, u64> = BTreeMap::new();
    for ((source, target), calls) in &merged {
        *nodes.entry(source.clone()).or_insert(0) += calls;
        *nodes.entry(target.clone()).or_insert(0) += calls;
    }

    let mut edges: Vec<ServiceEdge> = merged
        .into_iter()
        .map(|((source, target), call_count)| ServiceEdge {
            source,
            target,
            call_count,
        })
        .collect();
    edges.sort_by(|a, b| b.call_count.cmp(&a.call_count));

    ServiceDependencies {
        nodes: nodes
            .into_iter()
            .map(|(name, call_count)| ServiceNode { name, call_count })
            .collect(),
        edges,
    }
}

/// Cross-service parent/child edges found within one set of spans
pub fn dependency_edges(spans: &[SpanRecord]) -> Vec<(String, String, u64)> {
    let by_id: BTreeMap<(&str, &str, &str), &str> = spans
        .iter()
        .map(|span| {
            (
                (
                    span.project_id.as_str(),
                    span.trace_id.as_str(),
                    span.span_id.as_str(),
                ),
                span.service_name.as_str(),
            )
        })
        .collect();

    spans
        .iter()
        .filter_map(|child| {
            let parent_id = child.parent_span_id.as_deref()?;
            let parent_service = by_id.get(&(
                child.project_id.as_str(),
                child.trace_id.as_str(),
                parent_id,
            ))?;
            Some((parent_service.to_string(), child.service_name.clone(), 1))
        })
        .collect()
}
