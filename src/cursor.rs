//! Keyset pagination cursor
//!
//! A cursor is the base64 encoding of `"<ISO-8601 time>,<id>"` taken from the
//! last row of a page. It is opaque to callers and round-trips exactly.

use crate::error::{StorageError, StorageResult};
use crate::models::{LogQueryParams, LogQueryResult, StoredLogRecord};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

/// Decoded position of the last row returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub time: DateTime<Utc>,
    pub id: Uuid,
}

impl Cursor {
    pub fn new(time: DateTime<Utc>, id: Uuid) -> Self {
        Self { time, id }
    }

    pub fn encode(&self) -> String {
        let raw = format!(
            "{},{}",
            self.time.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            self.id
        );
        STANDARD.encode(raw)
    }

    pub fn decode(token: &str) -> StorageResult<Self> {
        let bytes = STANDARD
            .decode(token.trim())
            .map_err(|e| StorageError::InvalidCursor(format!("not base64: {}", e)))?;
        let raw = String::from_utf8(bytes)
            .map_err(|_| StorageError::InvalidCursor("not UTF-8".to_string()))?;

        let (time, id) = raw
            .split_once(',')
            .ok_or_else(|| StorageError::InvalidCursor("missing separator".to_string()))?;

        let time = DateTime::parse_from_rfc3339(time)
            .map_err(|e| StorageError::InvalidCursor(format!("bad timestamp: {}", e)))?
            .with_timezone(&Utc);
        let id = Uuid::parse_str(id)
            .map_err(|e| StorageError::InvalidCursor(format!("bad id: {}", e)))?;

        Ok(Self { time, id })
    }
}

/// Turn the `limit + 1` rows fetched for a page into the page itself.
///
/// The extra row only signals `has_more`; `next_cursor` points at the last row
/// actually returned. Offsets are reported as 0 when paging by cursor.
pub fn into_page(mut rows: Vec<StoredLogRecord>, params: &LogQueryParams) -> LogQueryResult {
    let has_more = rows.len() > params.limit;
    rows.truncate(params.limit);

    let next_cursor = if has_more {
        rows.last()
            .map(|last| Cursor::new(last.time(), last.id).encode())
    } else {
        None
    };

    LogQueryResult {
        logs: rows,
        has_more,
        limit: params.limit,
        offset: if params.cursor.is_some() { 0 } else { params.offset },
        next_cursor,
    }
}
