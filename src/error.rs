use crate::engine::EngineKind;
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

/// Storage error types
#[derive(Debug, Error)]
pub enum StorageError {
    /// Operation attempted before `connect()` or after `disconnect()`
    #[error("storage engine is not connected")]
    NotConnected,

    /// Malformed parameters, rejected before any backend call
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Cursor token that does not decode to `<time>,<id>`
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    /// Operation the active engine does not implement
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// PostgreSQL / TimescaleDB error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Transport error talking to the ClickHouse HTTP interface
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success response from ClickHouse
    #[error("clickhouse error ({status}): {message}")]
    ClickHouse { status: u16, message: String },

    /// Row payload that failed to (de)serialize
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error raised by an engine, tagged with the engine name by the facade
    #[error("[{engine}] {source}")]
    Engine {
        engine: EngineKind,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// Tag with the engine that produced the error. Already-tagged errors are left as is.
    pub fn tagged(self, engine: EngineKind) -> Self {
        match self {
            tagged @ Self::Engine { .. } => tagged,
            other => Self::Engine {
                engine,
                source: Box::new(other),
            },
        }
    }

    /// The underlying error, with any engine tag removed
    pub fn root(&self) -> &StorageError {
        match self {
            Self::Engine { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn engine(&self) -> Option<EngineKind> {
        match self {
            Self::Engine { engine, .. } => Some(*engine),
            _ => None,
        }
    }

    pub fn is_not_connected(&self) -> bool {
        matches!(self.root(), Self::NotConnected)
    }

    pub fn is_invalid_params(&self) -> bool {
        matches!(self.root(), Self::InvalidParams(_) | Self::InvalidCursor(_))
    }
}
