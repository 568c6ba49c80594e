//! Storage layer for logs, spans and trace aggregates
//!
//! One contract ([`engine::StorageEngine`]), two independent engines
//! ([`timescale::TimescaleEngine`], [`clickhouse::ClickHouseEngine`]) and a
//! facade ([`reservoir::Reservoir`]) that selects one from configuration.

pub mod clickhouse;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod reservoir;
pub mod retention;
pub mod rollup;
pub mod timescale;
pub mod translate;

pub use engine::{EngineKind, StorageEngine};
pub use error::{StorageError, StorageResult};
pub use reservoir::Reservoir;
