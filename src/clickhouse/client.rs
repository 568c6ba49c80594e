//! Thin client for the ClickHouse HTTP interface

use super::translator::http_params;
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::translate::NativeQuery;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Settings sent with every request
const SETTINGS: &[(&str, &str)] = &[
    ("output_format_json_quote_64bit_integers", "0"),
    ("date_time_input_format", "best_effort"),
    ("wait_end_of_query", "1"),
];

#[derive(Debug, Clone)]
pub struct ClickHouseClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
}

impl ClickHouseClient {
    pub fn new(config: &StorageConfig) -> StorageResult<Self> {
        let connection = &config.connection;
        let scheme = if connection.secure { "https" } else { "http" };
        let base_url = format!("{}://{}:{}/", scheme, connection.host, config.port());
        Self::with_base_url(config, base_url)
    }

    /// Client against an explicit endpoint, e.g. a proxy in front of the cluster
    pub fn with_base_url(config: &StorageConfig, base_url: impl Into<String>) -> StorageResult<Self> {
        let connection = &config.connection;
        let http = Client::builder()
            .connect_timeout(connection.connect_timeout())
            .pool_max_idle_per_host(connection.pool_size as usize)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            username: connection.username.clone(),
            password: connection.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post(&self) -> RequestBuilder {
        self.http
            .post(&self.base_url)
            .header("X-ClickHouse-User", &self.username)
            .header("X-ClickHouse-Key", &self.password)
            .query(SETTINGS)
    }

    async fn send(request: RequestBuilder) -> StorageResult<String> {
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(StorageError::ClickHouse {
                status,
                message: message.trim().to_string(),
            });
        }

        Ok(response.text().await?)
    }

    /// Run a statement that returns no rows (DDL, `ALTER .. DELETE`)
    pub async fn execute(&self, query: &NativeQuery) -> StorageResult<()> {
        let request = self
            .post()
            .query(&http_params(query))
            .body(query.text.clone());
        Self::send(request).await.map(|_| ())
    }

    /// Run a read and decode every `JSONEachRow` line as `T`
    pub async fn fetch<T: DeserializeOwned>(&self, query: &NativeQuery) -> StorageResult<Vec<T>> {
        let request = self
            .post()
            .query(&http_params(query))
            .body(format!("{} FORMAT JSONEachRow", query.text));
        let body = Self::send(request).await?;

        body.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StorageError::from))
            .collect()
    }

    pub async fn fetch_one<T: DeserializeOwned>(&self, query: &NativeQuery) -> StorageResult<Option<T>> {
        Ok(self.fetch(query).await?.into_iter().next())
    }

    /// `insert` is an `INSERT .. FORMAT JSONEachRow` statement; rows travel in the body
    pub async fn insert_rows<T: Serialize>(&self, insert: &str, rows: &[T]) -> StorageResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut body = String::new();
        for row in rows {
            body.push_str(&serde_json::to_string(row)?);
            body.push('\n');
        }

        let request = self.post().query(&[("query", insert)]).body(body);
        Self::send(request).await.map(|_| ())
    }

    /// Cheap authenticated round trip
    pub async fn ping(&self) -> StorageResult<()> {
        self.execute(&NativeQuery::new("SELECT 1")).await
    }
}
