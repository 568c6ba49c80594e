use crate::engine::EngineKind;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub engine: EngineKind,
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub tables: TableNames,
    /// Attach to an externally managed schema without creating or migrating it
    #[serde(default)]
    pub skip_initialize: bool,
}

impl StorageConfig {
    /// Configured port, or the engine's default (5432 for TimescaleDB, 8123 for ClickHouse HTTP)
    pub fn port(&self) -> u16 {
        self.connection.port.unwrap_or(match self.engine {
            EngineKind::Timescale => 5432,
            EngineKind::ClickHouse => 8123,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub database: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// TLS to the backend (sslmode=require / https)
    #[serde(default)]
    pub secure: bool,
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_username() -> String {
    "default".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Physical table names, overridable per deployment
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TableNames {
    pub logs: String,
    pub spans: String,
    pub traces: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            logs: "logs".to_string(),
            spans: "spans".to_string(),
            traces: "traces".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Width of each row-level delete window
    pub window_hours: u32,
    /// How long to wait for background delete mutations after a sweep
    pub mutation_timeout_secs: u64,
    /// How far back before the cutoff a sweep looks for rows
    pub lookback_days: u32,
    /// Hour of day (UTC, 0-23) the scheduled sweep runs
    pub cleanup_hour: u32,
    /// How often the scheduler checks whether it is time to sweep
    pub check_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            window_hours: 24,
            mutation_timeout_secs: 300,
            lookback_days: 90,
            cleanup_hour: 3,
            check_interval_secs: 3600,
        }
    }
}

impl RetentionConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.window_hours))
    }

    pub fn mutation_timeout(&self) -> Duration {
        Duration::from_secs(self.mutation_timeout_secs)
    }
}

/// Load configuration from `path` plus `RESERVOIR__*` environment overrides
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(config::Environment::with_prefix("RESERVOIR").separator("__"))
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    let connection = &cfg.storage.connection;

    if connection.host.trim().is_empty() {
        anyhow::bail!("storage.connection.host cannot be empty");
    }

    if connection.database.trim().is_empty() {
        anyhow::bail!("storage.connection.database cannot be empty");
    }

    if connection.port == Some(0) {
        anyhow::bail!("storage.connection.port cannot be 0");
    }

    if connection.pool_size == 0 {
        anyhow::bail!("storage.connection.pool_size must be at least 1");
    }

    let tables = &cfg.storage.tables;
    for (key, name) in [
        ("logs", &tables.logs),
        ("spans", &tables.spans),
        ("traces", &tables.traces),
    ] {
        if !is_identifier(name) {
            anyhow::bail!("storage.tables.{} '{}' is not a valid table name", key, name);
        }
    }

    // ClickHouse statements qualify every table with the database name
    if cfg.storage.engine == EngineKind::ClickHouse && !is_identifier(&connection.database) {
        anyhow::bail!(
            "storage.connection.database '{}' is not a valid ClickHouse database name",
            connection.database
        );
    }

    if cfg.retention.window_hours == 0 {
        anyhow::bail!("retention.window_hours must be at least 1");
    }

    if cfg.retention.cleanup_hour > 23 {
        anyhow::bail!("retention.cleanup_hour must be between 0 and 23");
    }

    Ok(())
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
