//! Relational engine: PostgreSQL with the TimescaleDB extension

mod engine;
pub mod schema;
pub mod translator;

pub use engine::TimescaleEngine;
pub use translator::TimescaleTranslator;
