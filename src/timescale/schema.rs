//! Versioned TimescaleDB schema
//!
//! Each step is applied once, in order, inside its own transaction, and
//! recorded in `reservoir_schema_version`.

use crate::config::TableNames;

pub const VERSION_TABLE: &str = "reservoir_schema_version";

pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub statements: fn(&TableNames) -> Vec<String>,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "logs hypertable",
        statements: logs_hypertable,
    },
    Migration {
        version: 2,
        description: "spans hypertable and trace aggregates",
        statements: spans_and_traces,
    },
    Migration {
        version: 3,
        description: "full-text and trigram search indexes",
        statements: search_indexes,
    },
    Migration {
        version: 4,
        description: "native compression policies",
        statements: compression,
    },
];

pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

pub fn version_table_ddl() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {VERSION_TABLE} (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )"
    )
}

/// Steps above `current` up to and including `target`
pub fn pending(current: u32, target: u32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS
        .iter()
        .filter(move |m| m.version > current && m.version <= target)
}

fn logs_hypertable(tables: &TableNames) -> Vec<String> {
    let logs = &tables.logs;
    vec![
        "CREATE EXTENSION IF NOT EXISTS timescaledb".to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS {logs} (
                id UUID NOT NULL,
                time TIMESTAMPTZ NOT NULL,
                project_id TEXT NOT NULL,
                service TEXT NOT NULL DEFAULT 'unknown',
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                metadata JSONB,
                trace_id TEXT,
                span_id TEXT,
                hostname TEXT,
                PRIMARY KEY (time, id)
            )"
        ),
        format!(
            "SELECT create_hypertable('{logs}', 'time', \
             chunk_time_interval => INTERVAL '1 day', if_not_exists => TRUE)"
        ),
        format!("CREATE INDEX IF NOT EXISTS {logs}_project_time_idx ON {logs} (project_id, time DESC, id DESC)"),
        format!("CREATE INDEX IF NOT EXISTS {logs}_service_idx ON {logs} (project_id, service, time DESC)"),
        format!("CREATE INDEX IF NOT EXISTS {logs}_level_idx ON {logs} (project_id, level, time DESC)"),
        format!("CREATE INDEX IF NOT EXISTS {logs}_trace_idx ON {logs} (trace_id) WHERE trace_id IS NOT NULL"),
        format!("CREATE INDEX IF NOT EXISTS {logs}_id_idx ON {logs} (id)"),
    ]
}

fn spans_and_traces(tables: &TableNames) -> Vec<String> {
    let spans = &tables.spans;
    let traces = &tables.traces;
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {spans} (
                project_id TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                span_id TEXT NOT NULL,
                parent_span_id TEXT,
                service_name TEXT NOT NULL,
                operation_name TEXT NOT NULL,
                start_time TIMESTAMPTZ NOT NULL,
                end_time TIMESTAMPTZ NOT NULL,
                duration_ms BIGINT NOT NULL,
                kind TEXT,
                status_code TEXT,
                status_message TEXT,
                attributes JSONB,
                events JSONB NOT NULL DEFAULT '[]',
                links JSONB NOT NULL DEFAULT '[]',
                resource_attributes JSONB,
                PRIMARY KEY (project_id, trace_id, span_id, start_time)
            )"
        ),
        format!(
            "SELECT create_hypertable('{spans}', 'start_time', \
             chunk_time_interval => INTERVAL '1 day', if_not_exists => TRUE)"
        ),
        format!("CREATE INDEX IF NOT EXISTS {spans}_project_time_idx ON {spans} (project_id, start_time DESC)"),
        format!("CREATE INDEX IF NOT EXISTS {spans}_service_idx ON {spans} (project_id, service_name, start_time DESC)"),
        format!("CREATE INDEX IF NOT EXISTS {spans}_parent_idx ON {spans} (project_id, trace_id, parent_span_id)"),
        format!(
            "CREATE TABLE IF NOT EXISTS {traces} (
                project_id TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                service_name TEXT NOT NULL,
                root_service_name TEXT,
                root_operation_name TEXT,
                start_time TIMESTAMPTZ NOT NULL,
                end_time TIMESTAMPTZ NOT NULL,
                duration_ms BIGINT NOT NULL,
                span_count BIGINT NOT NULL DEFAULT 0,
                error BOOLEAN NOT NULL DEFAULT FALSE,
                PRIMARY KEY (project_id, trace_id)
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS {traces}_project_time_idx ON {traces} (project_id, start_time DESC)"),
        format!("CREATE INDEX IF NOT EXISTS {traces}_duration_idx ON {traces} (project_id, duration_ms)"),
    ]
}

fn search_indexes(tables: &TableNames) -> Vec<String> {
    let logs = &tables.logs;
    vec![
        "CREATE EXTENSION IF NOT EXISTS pg_trgm".to_string(),
        format!(
            "CREATE INDEX IF NOT EXISTS {logs}_message_fts_idx ON {logs} \
             USING GIN (to_tsvector('english', message))"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {logs}_message_trgm_idx ON {logs} \
             USING GIN (message gin_trgm_ops)"
        ),
    ]
}

fn compression(tables: &TableNames) -> Vec<String> {
    let logs = &tables.logs;
    let spans = &tables.spans;
    vec![
        format!(
            "ALTER TABLE {logs} SET (timescaledb.compress, \
             timescaledb.compress_segmentby = 'project_id', \
             timescaledb.compress_orderby = 'time DESC, id DESC')"
        ),
        format!("SELECT add_compression_policy('{logs}', INTERVAL '7 days', if_not_exists => TRUE)"),
        format!(
            "ALTER TABLE {spans} SET (timescaledb.compress, \
             timescaledb.compress_segmentby = 'project_id', \
             timescaledb.compress_orderby = 'start_time DESC')"
        ),
        format!("SELECT add_compression_policy('{spans}', INTERVAL '7 days', if_not_exists => TRUE)"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_are_contiguous() {
        for (i, migration) in MIGRATIONS.iter().enumerate() {
            assert_eq!(migration.version as usize, i + 1);
        }
        assert_eq!(latest_version(), 4);
    }

    #[test]
    fn test_pending_selects_window() {
        let versions: Vec<u32> = pending(1, 3).map(|m| m.version).collect();
        assert_eq!(versions, vec![2, 3]);
        assert_eq!(pending(4, 4).count(), 0);
    }

    #[test]
    fn test_statements_use_configured_tables() {
        let tables = TableNames {
            logs: "app_logs".to_string(),
            spans: "app_spans".to_string(),
            traces: "app_traces".to_string(),
        };
        let all: Vec<String> = MIGRATIONS
            .iter()
            .flat_map(|m| (m.statements)(&tables))
            .collect();

        assert!(all.iter().any(|s| s.contains("create_hypertable('app_logs'")));
        assert!(all.iter().any(|s| s.contains("CREATE TABLE IF NOT EXISTS app_traces")));
        assert!(!all.iter().any(|s| s.contains(" logs ")));
    }
}
