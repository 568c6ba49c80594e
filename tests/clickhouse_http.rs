use chrono::{DateTime, Duration, Utc};
use reservoir::clickhouse::ClickHouseEngine;
use reservoir::cursor::Cursor;
use reservoir::config::{ConnectionConfig, StorageConfig, TableNames};
use reservoir::models::{
    CountParams, Dataset, DeleteParams, LogFilters, LogLevel, LogQueryParams, LogRecord,
    SpanRecord, SpanStatus, TimeRange,
};
use reservoir::{EngineKind, Reservoir, StorageError};
use std::sync::Arc;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn storage_config() -> StorageConfig {
    StorageConfig {
        engine: EngineKind::ClickHouse,
        connection: ConnectionConfig {
            host: "localhost".to_string(),
            port: None,
            database: "telemetry".to_string(),
            username: "ingest".to_string(),
            password: "s3cret".to_string(),
            pool_size: 2,
            connect_timeout_secs: 2,
            secure: false,
        },
        tables: TableNames::default(),
        skip_initialize: true,
    }
}

/// Specific mocks must be mounted before this; it answers everything else with an empty body
async fn mount_fallback(server: &MockServer) {
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

async fn connected(server: &MockServer) -> Reservoir {
    let engine = ClickHouseEngine::with_base_url(storage_config(), format!("{}/", server.uri()));
    let reservoir = Reservoir::with_engine(Arc::new(engine));
    reservoir.connect().await.unwrap();
    reservoir
}

fn insert_target(request: &Request) -> Option<String> {
    query_param(request, "query")
}

fn body(request: &Request) -> String {
    String::from_utf8_lossy(&request.body).into_owned()
}

/// Bodies of the trace version inserts, one JSON value per written row
fn trace_versions(requests: &[Request]) -> Vec<serde_json::Value> {
    requests
        .iter()
        .filter(|request| {
            insert_target(request).map_or(false, |q| q.starts_with("INSERT INTO telemetry.traces "))
        })
        .flat_map(|request| {
            body(request)
                .lines()
                .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
                .collect::<Vec<_>>()
        })
        .collect()
}

/// A `telemetry.spans` row of trace `t1` as ClickHouse returns it
fn stored_span(span_id: &str, parent: &str, service: &str, start: &str, end: &str, status: &str) -> String {
    let duration_ms = (rows_time(end) - rows_time(start)).num_milliseconds();
    format!(
        concat!(
            "{{\"project_id\":\"p1\",\"trace_id\":\"t1\",\"span_id\":\"{}\",",
            "\"parent_span_id\":\"{}\",\"service_name\":\"{}\",\"operation_name\":\"op\",",
            "\"start_time\":\"{}\",\"end_time\":\"{}\",\"duration_ms\":{},",
            "\"kind\":null,\"status_code\":\"{}\",\"status_message\":null}}\n"
        ),
        span_id, parent, service, start, end, duration_ms, status
    )
}

fn rows_time(raw: &str) -> DateTime<Utc> {
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .unwrap()
        .and_utc()
}

/// Number in the first `{pN:` placeholder after `marker`
fn placeholder_after(text: &str, marker: &str) -> String {
    let rest = &text[text.find(marker).unwrap() + marker.len()..];
    let start = rest.find("{p").unwrap() + 2;
    rest[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect()
}

fn query_param(request: &Request, name: &str) -> Option<String> {
    request
        .url
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn day_range() -> TimeRange {
    TimeRange::new(ts("2024-05-01T00:00:00Z"), ts("2024-05-02T00:00:00Z"))
}

#[tokio::test]
async fn test_count_sends_credentials_and_parses_quoted_count() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("X-ClickHouse-User", "ingest"))
        .and(header("X-ClickHouse-Key", "s3cret"))
        .and(body_string_contains(
            "SELECT count() AS count FROM telemetry.logs",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"count\":\"42\"}\n"))
        .expect(1)
        .mount(&server)
        .await;
    mount_fallback(&server).await;

    let reservoir = connected(&server).await;
    let count = reservoir
        .count(&CountParams {
            range: day_range(),
            filters: LogFilters::project("p1"),
        })
        .await
        .unwrap();
    assert_eq!(count.count, 42);

    let requests = server.received_requests().await.unwrap();
    let count_request = requests
        .iter()
        .find(|request| body(request).contains("count()"))
        .unwrap();
    let params: Vec<(String, String)> = count_request
        .url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    assert!(params.iter().any(|(k, v)| k.starts_with("param_p") && v == "p1"));
    assert!(params
        .iter()
        .any(|(k, v)| k.starts_with("param_p") && v == "2024-05-01 00:00:00.000000"));
    assert!(body(count_request).ends_with("FORMAT JSONEachRow"));
}

#[tokio::test]
async fn test_query_maps_rows_and_pages() {
    let server = MockServer::start().await;
    let rows = concat!(
        "{\"id\":\"6f1c1c6a-4a0b-4c36-9d55-0d3f1f0f7e11\",\"time\":\"2024-05-01 10:00:02.500000\",",
        "\"project_id\":\"p1\",\"service\":\"api\",\"level\":\"error\",\"message\":\"boom\",",
        "\"metadata\":\"{\\\"user\\\":7}\",\"trace_id\":\"t1\",\"span_id\":null,\"hostname\":\"web-1\"}\n",
        "{\"id\":\"0b5d3c2e-9d8b-4f55-8f2b-6b1f3cb0e0aa\",\"time\":\"2024-05-01 10:00:01.000000\",",
        "\"project_id\":\"p1\",\"service\":\"api\",\"level\":\"info\",\"message\":\"ok\",",
        "\"metadata\":\"\",\"trace_id\":null,\"span_id\":null,\"hostname\":null}\n",
    );
    Mock::given(method("POST"))
        .and(body_string_contains("FROM telemetry.logs"))
        .and(body_string_contains("ORDER BY time DESC, id DESC LIMIT 2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rows))
        .mount(&server)
        .await;
    mount_fallback(&server).await;

    let reservoir = connected(&server).await;
    let mut params = LogQueryParams::new(day_range());
    params.limit = 1;
    let page = reservoir.query(&params).await.unwrap();

    assert!(page.has_more);
    assert!(page.next_cursor.is_some());
    assert_eq!(page.logs.len(), 1);

    let log = &page.logs[0];
    assert_eq!(log.time(), ts("2024-05-01T10:00:02.5Z"));
    assert_eq!(log.record.level, LogLevel::Error);
    assert_eq!(log.record.metadata, Some(serde_json::json!({"user": 7})));
    assert_eq!(log.record.trace_id.as_deref(), Some("t1"));
    assert_eq!(log.record.hostname.as_deref(), Some("web-1"));
}

#[tokio::test]
async fn test_next_cursor_binds_keyset_of_last_row() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("(time, id) < ("))
        .respond_with(ResponseTemplate::new(200).set_body_string(concat!(
            "{\"id\":\"0b5d3c2e-9d8b-4f55-8f2b-6b1f3cb0e0aa\",\"time\":\"2024-05-01 10:00:01.000000\",",
            "\"project_id\":\"p1\",\"service\":\"api\",\"level\":\"info\",\"message\":\"ok\",",
            "\"metadata\":\"\",\"trace_id\":null,\"span_id\":null,\"hostname\":null}\n",
        )))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("FROM telemetry.logs"))
        .respond_with(ResponseTemplate::new(200).set_body_string(concat!(
            "{\"id\":\"6f1c1c6a-4a0b-4c36-9d55-0d3f1f0f7e11\",\"time\":\"2024-05-01 10:00:02.500000\",",
            "\"project_id\":\"p1\",\"service\":\"api\",\"level\":\"error\",\"message\":\"boom\",",
            "\"metadata\":\"\",\"trace_id\":null,\"span_id\":null,\"hostname\":null}\n",
            "{\"id\":\"0b5d3c2e-9d8b-4f55-8f2b-6b1f3cb0e0aa\",\"time\":\"2024-05-01 10:00:01.000000\",",
            "\"project_id\":\"p1\",\"service\":\"api\",\"level\":\"info\",\"message\":\"ok\",",
            "\"metadata\":\"\",\"trace_id\":null,\"span_id\":null,\"hostname\":null}\n",
        )))
        .mount(&server)
        .await;
    mount_fallback(&server).await;

    let reservoir = connected(&server).await;
    let mut params = LogQueryParams::new(day_range());
    params.limit = 1;
    let first = reservoir.query(&params).await.unwrap();
    let token = first.next_cursor.clone().expect("first page has a cursor");
    let cursor = Cursor::decode(&token).unwrap();
    assert_eq!(cursor.id, first.logs[0].id);
    assert_eq!(cursor.time, first.logs[0].time());

    params.cursor = Some(token);
    let second = reservoir.query(&params).await.unwrap();
    assert_eq!(second.logs.len(), 1);
    assert!(!second.has_more);
    assert!(second.next_cursor.is_none());
    assert_ne!(second.logs[0].id, first.logs[0].id);

    let requests = server.received_requests().await.unwrap();
    let keyset = requests
        .iter()
        .find(|request| body(request).contains("(time, id) < ("))
        .expect("second page request");
    let text = body(keyset);
    assert!(text.contains(":DateTime64(6, 'UTC')}, {p"));
    assert!(text.contains(":UUID})"));

    let clause = &text[text.find("(time, id) < (").unwrap()..];
    let time_param = placeholder_after(clause, "(time, id) < (");
    let id_param = placeholder_after(clause, "}, ");
    assert_eq!(
        query_param(keyset, &format!("param_p{time_param}")).as_deref(),
        Some("2024-05-01 10:00:02.500000")
    );
    assert_eq!(
        query_param(keyset, &format!("param_p{id_param}")),
        Some(cursor.id.to_string())
    );
}

#[tokio::test]
async fn test_backend_error_is_passed_through_tagged() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("count()"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_string("Code: 60. DB::Exception: Table telemetry.logs does not exist.\n"),
        )
        .mount(&server)
        .await;
    mount_fallback(&server).await;

    let reservoir = connected(&server).await;
    let err = reservoir
        .count(&CountParams {
            range: day_range(),
            filters: LogFilters::default(),
        })
        .await
        .unwrap_err();

    assert_eq!(err.engine(), Some(EngineKind::ClickHouse));
    match err.root() {
        StorageError::ClickHouse { status, message } => {
            assert_eq!(*status, 404);
            assert!(message.starts_with("Code: 60."));
            assert!(!message.ends_with('\n'));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_connect_leaves_engine_disconnected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(516).set_body_string("Authentication failed"))
        .mount(&server)
        .await;

    let engine = ClickHouseEngine::with_base_url(storage_config(), format!("{}/", server.uri()));
    let reservoir = Reservoir::with_engine(Arc::new(engine));

    let err = reservoir.connect().await.unwrap_err();
    assert!(matches!(err.root(), StorageError::ClickHouse { status: 516, .. }));

    let health = reservoir.health_check().await;
    assert!(!health.connected);
    assert!(health.error.is_some());
}

#[tokio::test]
async fn test_ingest_writes_json_each_row() {
    let server = MockServer::start().await;
    mount_fallback(&server).await;
    let reservoir = connected(&server).await;

    let t0 = ts("2024-05-01T10:00:00Z");
    let mut first = LogRecord::new(t0, "p1", "api", LogLevel::Warn, "slow request");
    first.metadata = Some(serde_json::json!({"ms": 950}));
    let second = LogRecord::new(t0 + Duration::seconds(1), "p1", "api", LogLevel::Info, "done");
    let mut invalid = second.clone();
    invalid.service = " ".to_string();

    let result = reservoir
        .ingest_returning(&[first, invalid, second])
        .await
        .unwrap();
    assert_eq!(result.ingested, 2);
    assert_eq!(result.failed, 1);
    assert_eq!(result.errors[0].index, Some(1));
    assert_eq!(result.rows.len(), 2);

    let requests = server.received_requests().await.unwrap();
    let insert = requests
        .iter()
        .find(|request| {
            insert_target(request).map_or(false, |q| q.starts_with("INSERT INTO telemetry.logs"))
        })
        .expect("log insert request");
    let lines: Vec<serde_json::Value> = body(insert)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["time"], "2024-05-01 10:00:00.000000");
    assert_eq!(lines[0]["level"], "warn");
    assert_eq!(lines[0]["metadata"], "{\"ms\":950}");
    assert_eq!(lines[1]["metadata"], "");
    assert_eq!(lines[0]["id"], result.rows[0].id.to_string());
}

#[tokio::test]
async fn test_failed_insert_reports_rows_without_erroring() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("\"message\":\"lost\""))
        .respond_with(ResponseTemplate::new(500).set_body_string("Code: 241. Memory limit exceeded"))
        .mount(&server)
        .await;
    mount_fallback(&server).await;

    let reservoir = connected(&server).await;
    let t0 = ts("2024-05-01T10:00:00Z");
    let result = reservoir
        .ingest(&[
            LogRecord::new(t0, "p1", "api", LogLevel::Info, "lost"),
            LogRecord::new(t0, "p1", "api", LogLevel::Info, "lost"),
        ])
        .await
        .unwrap();

    assert_eq!(result.ingested, 0);
    assert_eq!(result.failed, 2);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].index.is_none());
    assert!(result.errors[0].message.contains("Memory limit exceeded"));
}

#[tokio::test]
async fn test_span_ingest_skips_stored_spans_and_merges_trace() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("SELECT DISTINCT project_id, trace_id, span_id"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "{\"project_id\":\"p1\",\"trace_id\":\"t1\",\"span_id\":\"s1\"}\n",
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("LIMIT 1 BY project_id, trace_id, span_id"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "{}{}",
            stored_span("s1", "", "gateway", "2024-05-01 12:00:00.000000", "2024-05-01 12:00:00.100000", "OK"),
            stored_span("s2", "s1", "backend", "2024-05-01 12:00:00.050000", "2024-05-01 12:00:00.300000", "ERROR"),
        )))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("FROM telemetry.traces FINAL"))
        .respond_with(ResponseTemplate::new(200).set_body_string(concat!(
            "{\"project_id\":\"p1\",\"trace_id\":\"t1\",\"service_name\":\"gateway\",",
            "\"root_service_name\":\"gateway\",\"root_operation_name\":\"GET /\",",
            "\"start_time\":\"2024-05-01 12:00:00.000000\",\"end_time\":\"2024-05-01 12:00:00.100000\",",
            "\"duration_ms\":100,\"span_count\":1,\"error\":false}\n",
        )))
        .mount(&server)
        .await;
    mount_fallback(&server).await;

    let reservoir = connected(&server).await;
    let start = ts("2024-05-01T12:00:00Z");
    let root = SpanRecord::new(
        "p1",
        "t1",
        "s1",
        "gateway",
        "GET /",
        start,
        start + Duration::milliseconds(100),
    );
    let child = SpanRecord::new(
        "p1",
        "t1",
        "s2",
        "backend",
        "query",
        start + Duration::milliseconds(50),
        start + Duration::milliseconds(300),
    )
    .child_of("s1")
    .with_status(SpanStatus::Error);

    let result = reservoir.ingest_spans(&[root, child]).await.unwrap();
    assert_eq!(result.ingested, 2);
    assert!(result.is_complete());

    let requests = server.received_requests().await.unwrap();
    let inserted_to = |table: &str| -> Vec<serde_json::Value> {
        requests
            .iter()
            .filter(|request| {
                insert_target(request)
                    .map_or(false, |q| q.starts_with(&format!("INSERT INTO telemetry.{table} ")))
            })
            .flat_map(|request| {
                body(request)
                    .lines()
                    .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
                    .collect::<Vec<_>>()
            })
            .collect()
    };

    let spans = inserted_to("spans");
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0]["span_id"], "s2");
    assert_eq!(spans[0]["parent_span_id"], "s1");

    let traces = trace_versions(&requests);
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0]["span_count"], 2);
    assert_eq!(traces[0]["error"], true);
    assert_eq!(traces[0]["duration_ms"], 300);
    assert_eq!(traces[0]["root_service_name"], "gateway");
}

#[tokio::test]
async fn test_span_retry_rebuilds_trace_after_failed_write() {
    let server = MockServer::start().await;
    // First attempt finds nothing stored, the retry sees its own span
    Mock::given(method("POST"))
        .and(body_string_contains("SELECT DISTINCT project_id, trace_id, span_id"))
        .respond_with(ResponseTemplate::new(200))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("SELECT DISTINCT project_id, trace_id, span_id"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "{\"project_id\":\"p1\",\"trace_id\":\"t1\",\"span_id\":\"s1\"}\n",
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("LIMIT 1 BY project_id, trace_id, span_id"))
        .respond_with(ResponseTemplate::new(200).set_body_string(stored_span(
            "s1",
            "",
            "gateway",
            "2024-05-01 12:00:00.000000",
            "2024-05-01 12:00:00.120000",
            "OK",
        )))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("\"span_count\":"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Code: 202. Too many simultaneous queries"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_fallback(&server).await;

    let reservoir = connected(&server).await;
    let start = ts("2024-05-01T12:00:00Z");
    let span = SpanRecord::new(
        "p1",
        "t1",
        "s1",
        "gateway",
        "op",
        start,
        start + Duration::milliseconds(120),
    );

    let first = reservoir.ingest_spans(std::slice::from_ref(&span)).await.unwrap();
    assert_eq!(first.ingested, 0);
    assert_eq!(first.failed, 1);
    assert!(first.errors[0].message.contains("traces not rebuilt"));

    let retry = reservoir.ingest_spans(std::slice::from_ref(&span)).await.unwrap();
    assert_eq!(retry.ingested, 1);
    assert!(retry.is_complete());

    let requests = server.received_requests().await.unwrap();
    let span_inserts = requests
        .iter()
        .filter(|request| {
            insert_target(request).map_or(false, |q| q.starts_with("INSERT INTO telemetry.spans "))
        })
        .count();
    assert_eq!(span_inserts, 1);

    // Both attempts wrote a version; only the retry's was accepted
    let traces = trace_versions(&requests);
    assert_eq!(traces.len(), 2);
    let repaired = &traces[1];
    assert_eq!(repaired["trace_id"], "t1");
    assert_eq!(repaired["span_count"], 1);
    assert_eq!(repaired["duration_ms"], 120);
    assert_eq!(repaired["root_service_name"], "gateway");
}

#[tokio::test]
async fn test_ingest_returns_timestamps_as_stored() {
    let server = MockServer::start().await;
    mount_fallback(&server).await;
    let reservoir = connected(&server).await;

    let record = LogRecord::new(
        ts("2024-05-01T12:00:00.123456789Z"),
        "p1",
        "api",
        LogLevel::Info,
        "precise",
    );
    let result = reservoir
        .ingest_returning(std::slice::from_ref(&record))
        .await
        .unwrap();
    assert_eq!(result.rows[0].time(), ts("2024-05-01T12:00:00.123456Z"));

    let requests = server.received_requests().await.unwrap();
    let insert = requests
        .iter()
        .find(|request| {
            insert_target(request).map_or(false, |q| q.starts_with("INSERT INTO telemetry.logs"))
        })
        .expect("log insert request");
    let line: serde_json::Value = serde_json::from_str(body(insert).trim()).unwrap();
    assert_eq!(line["time"], "2024-05-01 12:00:00.123456");
    assert_eq!(rows_time(line["time"].as_str().unwrap()), result.rows[0].time());
}

#[tokio::test]
async fn test_delete_is_a_mutation_reporting_zero() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("ALTER TABLE telemetry.logs DELETE WHERE"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    mount_fallback(&server).await;

    let reservoir = connected(&server).await;
    let now = ts("2024-05-10T00:00:00Z");
    let result = reservoir
        .delete_by_time_range(&DeleteParams::new(
            vec!["p1".to_string()],
            now - Duration::days(5),
            now - Duration::days(1),
        ))
        .await
        .unwrap();
    assert_eq!(result.deleted, 0);
}

#[tokio::test]
async fn test_drop_segments_only_drops_expired_days() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("FROM system.parts"))
        .respond_with(ResponseTemplate::new(200).set_body_string(concat!(
            "{\"partition_id\":\"20240501\",\"rows\":\"10\",\"bytes\":\"2048\"}\n",
            "{\"partition_id\":\"20240502\",\"rows\":\"12\",\"bytes\":\"4096\"}\n",
            "{\"partition_id\":\"20240601\",\"rows\":\"3\",\"bytes\":\"512\"}\n",
            "{\"partition_id\":\"tuple()\",\"rows\":\"1\",\"bytes\":\"64\"}\n",
        )))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("DROP PARTITION ID '20240501'"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("DROP PARTITION ID '20240601'"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    mount_fallback(&server).await;

    let reservoir = connected(&server).await;

    // 2024-05-02 ends exactly at the cutoff and goes too
    let dropped = reservoir
        .drop_segments_before(Dataset::Logs, ts("2024-05-03T00:00:00Z"))
        .await
        .unwrap();
    assert_eq!(dropped, 2);

    let segments = reservoir
        .list_segments(
            Dataset::Logs,
            &TimeRange::new(ts("2024-05-15T00:00:00Z"), ts("2024-06-30T00:00:00Z")),
        )
        .await
        .unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].name, "20240601");
    assert_eq!(segments[0].rows, Some(3));
    assert_eq!(segments[0].range_start, ts("2024-06-01T00:00:00Z"));
}

#[tokio::test]
async fn test_wait_for_mutations_reports_settled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("FROM system.mutations"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"count\":0}\n"))
        .mount(&server)
        .await;
    mount_fallback(&server).await;

    let reservoir = connected(&server).await;
    let settled = reservoir
        .wait_for_mutations(std::time::Duration::from_secs(5))
        .await
        .unwrap();
    assert!(settled);
}

#[tokio::test]
async fn test_wait_for_mutations_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("FROM system.mutations"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"count\":\"3\"}\n"))
        .mount(&server)
        .await;
    mount_fallback(&server).await;

    let reservoir = connected(&server).await;
    let settled = reservoir
        .wait_for_mutations(std::time::Duration::from_millis(50))
        .await
        .unwrap();
    assert!(!settled);
}

#[tokio::test]
async fn test_migrate_applies_pending_steps_only() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("SELECT max(version) AS version"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"version\":3}\n"))
        .mount(&server)
        .await;
    mount_fallback(&server).await;

    let reservoir = connected(&server).await;
    assert_eq!(reservoir.migrate(None).await.unwrap(), 4);

    let requests = server.received_requests().await.unwrap();
    let recorded: Vec<serde_json::Value> = requests
        .iter()
        .filter(|request| {
            insert_target(request)
                .map_or(false, |q| q.contains("reservoir_schema_version"))
        })
        .map(|request| serde_json::from_str(body(request).trim()).unwrap())
        .collect();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0]["version"], 4);

    let err = reservoir.migrate(Some(2)).await.unwrap_err();
    assert!(err.is_invalid_params());

    let err = reservoir.migrate(Some(99)).await.unwrap_err();
    assert!(err.is_invalid_params());
}
