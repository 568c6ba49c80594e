//! Query translation shared by both engines
//!
//! A translator turns a parameter object into a [`NativeQuery`]: backend-native
//! query text plus an ordered list of typed bound parameters. Translation never
//! performs I/O. The predicate rules here (equality vs `IN`, the `"unknown"`
//! service/hostname wildcard, search mode dispatch) apply identically to every
//! backend; each [`Dialect`] only decides how a rule is spelled.

use crate::models::{LogFilters, SearchMode, TextSearch, TimeRange};
use chrono::{DateTime, Utc};
use std::marker::PhantomData;
use uuid::Uuid;

/// Literal value accepted by service and hostname filters as a wildcard
pub const UNKNOWN_VALUE: &str = "unknown";

/// Typed bound parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    NullableText(Option<String>),
    TextArray(Vec<String>),
    Int(i64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    UuidArray(Vec<Uuid>),
    Json(Option<serde_json::Value>),
}

/// Query text plus its bound parameters, in placeholder order
#[derive(Debug, Clone, PartialEq)]
pub struct NativeQuery {
    pub text: String,
    pub params: Vec<SqlValue>,
}

impl NativeQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
        }
    }
}

/// How a backend spells placeholders and the few predicates that differ
pub trait Dialect {
    /// Whether `fulltext` searches use a native index; otherwise they run as substring
    const SUPPORTS_FULLTEXT: bool;

    /// Placeholder for the parameter at zero-based `index`
    fn placeholder(index: usize, value: &SqlValue) -> String;

    /// Membership test against an array parameter
    fn in_list(column: &str, placeholder: &str) -> String;

    /// Parameter value carrying a substring search term
    fn substring_param(term: &str) -> SqlValue;

    fn substring_match(column: &str, placeholder: &str) -> String;

    /// Native full-text predicate; dialects without an index keep the substring form
    fn fulltext_match(column: &str, placeholder: &str) -> String {
        Self::substring_match(column, placeholder)
    }
}

/// Accumulates `WHERE` conditions and their parameters for one statement
#[derive(Debug)]
pub struct SqlBuilder<D> {
    conditions: Vec<String>,
    params: Vec<SqlValue>,
    _dialect: PhantomData<D>,
}

impl<D: Dialect> Default for SqlBuilder<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Dialect> SqlBuilder<D> {
    pub fn new() -> Self {
        Self {
            conditions: Vec::new(),
            params: Vec::new(),
            _dialect: PhantomData,
        }
    }

    /// Register a parameter and return its placeholder
    pub fn bind(&mut self, value: SqlValue) -> String {
        let placeholder = D::placeholder(self.params.len(), &value);
        self.params.push(value);
        placeholder
    }

    pub fn push(&mut self, condition: impl Into<String>) {
        self.conditions.push(condition.into());
    }

    pub fn time_range(&mut self, column: &str, range: &TimeRange) {
        let (lower, upper) = range.operators();
        let from = self.bind(SqlValue::Timestamp(range.from));
        let to = self.bind(SqlValue::Timestamp(range.to));
        self.push(format!("{column} {lower} {from} AND {column} {upper} {to}"));
    }

    /// Equality for one value, `IN` for several, nothing for none
    pub fn one_or_many(&mut self, column: &str, values: &[String]) {
        if let Some(predicate) = self.membership(column, values) {
            self.push(predicate);
        }
    }

    /// Like [`Self::one_or_many`], but rows whose value is `"unknown"` always match
    pub fn one_or_many_or_unknown(&mut self, column: &str, values: &[String]) {
        if let Some(predicate) = self.membership(column, values) {
            let unknown = self.bind(SqlValue::Text(UNKNOWN_VALUE.to_string()));
            self.push(format!("({predicate} OR {column} = {unknown})"));
        }
    }

    fn membership(&mut self, column: &str, values: &[String]) -> Option<String> {
        match values {
            [] => None,
            [single] => {
                let placeholder = self.bind(SqlValue::Text(single.clone()));
                Some(format!("{column} = {placeholder}"))
            }
            many => {
                let placeholder = self.bind(SqlValue::TextArray(many.to_vec()));
                Some(D::in_list(column, &placeholder))
            }
        }
    }

    /// Dispatch on the search mode; `fulltext` degrades to substring when the
    /// dialect has no full-text index
    pub fn text_search(&mut self, column: &str, search: &TextSearch) {
        let predicate = if search.mode == SearchMode::Fulltext && D::SUPPORTS_FULLTEXT {
            let placeholder = self.bind(SqlValue::Text(search.term.clone()));
            D::fulltext_match(column, &placeholder)
        } else {
            let placeholder = self.bind(D::substring_param(&search.term));
            D::substring_match(column, &placeholder)
        };
        self.push(predicate);
    }

    /// Time range and every log filter, against the shared log column names
    pub fn log_filters(&mut self, range: &TimeRange, filters: &LogFilters) {
        self.time_range("time", range);
        self.one_or_many("project_id", &filters.project_ids);
        self.one_or_many_or_unknown("service", &filters.services);
        let levels: Vec<String> = filters
            .levels
            .iter()
            .map(|level| level.as_str().to_string())
            .collect();
        self.one_or_many("level", &levels);
        self.one_or_many_or_unknown("hostname", &filters.hostnames);
        if let Some(trace_id) = &filters.trace_id {
            let placeholder = self.bind(SqlValue::Text(trace_id.clone()));
            self.push(format!("trace_id = {placeholder}"));
        }
        if let Some(search) = &filters.search {
            self.text_search("message", search);
        }
    }

    /// ` WHERE a AND b`, or an empty string without conditions
    pub fn where_clause(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conditions.join(" AND "))
        }
    }

    pub fn finish(self, text: String) -> NativeQuery {
        NativeQuery {
            text,
            params: self.params,
        }
    }
}

/// Escape `%`, `_` and `\` so a term matches literally inside a LIKE pattern
pub fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
