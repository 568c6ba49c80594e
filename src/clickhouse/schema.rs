//! Versioned ClickHouse schema
//!
//! Logs and spans are daily-partitioned MergeTree tables. Trace aggregates live
//! in a ReplacingMergeTree keyed by `(project_id, trace_id)`: every merge
//! inserts a new version and reads collapse versions with `FINAL`. Versions only
//! collapse within one partition, so the traces table has no partition key.

use super::translator::ClickHouseTranslator;

pub const VERSION_TABLE: &str = "reservoir_schema_version";

pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub statements: fn(&ClickHouseTranslator) -> Vec<String>,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "logs table",
        statements: logs_table,
    },
    Migration {
        version: 2,
        description: "spans table and trace aggregates",
        statements: spans_and_traces,
    },
    Migration {
        version: 3,
        description: "data skipping indexes",
        statements: skipping_indexes,
    },
    Migration {
        version: 4,
        description: "column compression codecs",
        statements: codecs,
    },
];

pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

pub fn pending(current: u32, target: u32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS
        .iter()
        .filter(move |m| m.version > current && m.version <= target)
}

pub fn create_database(translator: &ClickHouseTranslator) -> String {
    format!("CREATE DATABASE IF NOT EXISTS {}", translator.database())
}

pub fn version_table_ddl(translator: &ClickHouseTranslator) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            version UInt32,
            description String,
            applied_at DateTime64(6, 'UTC') DEFAULT now64(6)
        ) ENGINE = ReplacingMergeTree
        ORDER BY version",
        translator.qualified(VERSION_TABLE)
    )
}

pub fn current_version_query(translator: &ClickHouseTranslator) -> String {
    format!(
        "SELECT max(version) AS version FROM {}",
        translator.qualified(VERSION_TABLE)
    )
}

pub fn record_version(translator: &ClickHouseTranslator) -> String {
    format!(
        "INSERT INTO {} (version, description) FORMAT JSONEachRow",
        translator.qualified(VERSION_TABLE)
    )
}

fn logs_table(translator: &ClickHouseTranslator) -> Vec<String> {
    let logs = translator.qualified(&translator.tables().logs);
    vec![format!(
        "CREATE TABLE IF NOT EXISTS {logs} (
            id UUID,
            time DateTime64(6, 'UTC'),
            project_id LowCardinality(String),
            service LowCardinality(String) DEFAULT 'unknown',
            level LowCardinality(String),
            message String,
            metadata String DEFAULT '',
            trace_id Nullable(String),
            span_id Nullable(String),
            hostname Nullable(String)
        ) ENGINE = MergeTree
        PARTITION BY toYYYYMMDD(time)
        ORDER BY (project_id, time, id)"
    )]
}

fn spans_and_traces(translator: &ClickHouseTranslator) -> Vec<String> {
    let spans = translator.qualified(&translator.tables().spans);
    let traces = translator.qualified(&translator.tables().traces);
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {spans} (
                project_id LowCardinality(String),
                trace_id String,
                span_id String,
                parent_span_id String DEFAULT '',
                service_name LowCardinality(String),
                operation_name String,
                start_time DateTime64(6, 'UTC'),
                end_time DateTime64(6, 'UTC'),
                duration_ms Int64,
                kind Nullable(String),
                status_code Nullable(String),
                status_message Nullable(String),
                attributes String DEFAULT '',
                events String DEFAULT '[]',
                links String DEFAULT '[]',
                resource_attributes String DEFAULT ''
            ) ENGINE = MergeTree
            PARTITION BY toYYYYMMDD(start_time)
            ORDER BY (project_id, start_time, trace_id, span_id)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {traces} (
                project_id LowCardinality(String),
                trace_id String,
                service_name LowCardinality(String),
                root_service_name Nullable(String),
                root_operation_name Nullable(String),
                start_time DateTime64(6, 'UTC'),
                end_time DateTime64(6, 'UTC'),
                duration_ms Int64,
                span_count Int64,
                error Bool,
                updated_at DateTime64(6, 'UTC')
            ) ENGINE = ReplacingMergeTree(updated_at)
            ORDER BY (project_id, trace_id)"
        ),
    ]
}

fn skipping_indexes(translator: &ClickHouseTranslator) -> Vec<String> {
    let logs = translator.qualified(&translator.tables().logs);
    let spans = translator.qualified(&translator.tables().spans);
    let traces = translator.qualified(&translator.tables().traces);
    vec![
        format!("ALTER TABLE {logs} ADD INDEX IF NOT EXISTS idx_trace_id trace_id TYPE bloom_filter(0.01) GRANULARITY 4"),
        format!("ALTER TABLE {logs} ADD INDEX IF NOT EXISTS idx_message_ngram lowerUTF8(message) TYPE ngrambf_v1(3, 65536, 2, 0) GRANULARITY 4"),
        format!("ALTER TABLE {spans} ADD INDEX IF NOT EXISTS idx_trace_id trace_id TYPE bloom_filter(0.01) GRANULARITY 4"),
        format!("ALTER TABLE {traces} ADD INDEX IF NOT EXISTS idx_start_time start_time TYPE minmax GRANULARITY 1"),
    ]
}

fn codecs(translator: &ClickHouseTranslator) -> Vec<String> {
    let logs = translator.qualified(&translator.tables().logs);
    let spans = translator.qualified(&translator.tables().spans);
    vec![
        format!("ALTER TABLE {logs} MODIFY COLUMN message String CODEC(ZSTD(3))"),
        format!("ALTER TABLE {logs} MODIFY COLUMN metadata String DEFAULT '' CODEC(ZSTD(3))"),
        format!("ALTER TABLE {spans} MODIFY COLUMN attributes String DEFAULT '' CODEC(ZSTD(3))"),
        format!("ALTER TABLE {spans} MODIFY COLUMN events String DEFAULT '[]' CODEC(ZSTD(3))"),
    ]
}
