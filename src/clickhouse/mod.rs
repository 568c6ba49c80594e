//! Columnar engine: ClickHouse over its HTTP interface

mod client;
mod engine;
mod rows;
pub mod schema;
pub mod translator;

pub use client::ClickHouseClient;
pub use engine::ClickHouseEngine;
pub use translator::ClickHouseTranslator;
