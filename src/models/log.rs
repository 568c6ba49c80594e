use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Log severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "critical" | "fatal" => Ok(Self::Critical),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// A log event as submitted for ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub time: DateTime<Utc>,
    pub project_id: String,
    pub service: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl LogRecord {
    pub fn new(
        time: DateTime<Utc>,
        project_id: impl Into<String>,
        service: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            time,
            project_id: project_id.into(),
            service: service.into(),
            level,
            message: message.into(),
            metadata: None,
            trace_id: None,
            span_id: None,
            hostname: None,
        }
    }

    /// Reject records that can never be stored, so a batch can report them per row
    pub fn validate(&self) -> Result<(), String> {
        if self.project_id.trim().is_empty() {
            return Err("project_id is required".to_string());
        }
        if self.service.trim().is_empty() {
            return Err("service is required".to_string());
        }
        if let Some(metadata) = &self.metadata {
            if !metadata.is_object() {
                return Err("metadata must be a JSON object".to_string());
            }
        }
        Ok(())
    }

    /// Storage keeps microseconds, so finer digits are dropped on the way in
    pub fn at_storage_precision(&self) -> Self {
        Self {
            time: self.time.trunc_subsecs(6),
            ..self.clone()
        }
    }

    pub fn with_id(self, id: Uuid) -> StoredLogRecord {
        StoredLogRecord { id, record: self }
    }
}

/// A log event as read back from storage, carrying its backend-issued identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredLogRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub record: LogRecord,
}

impl StoredLogRecord {
    pub fn time(&self) -> DateTime<Utc> {
        self.record.time
    }
}
