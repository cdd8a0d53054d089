//! Hitstats - buffered pageview ingestion and rollup statistics
//!
//! Hits are appended to an in-memory [`Memstore`](db::Memstore), persisted
//! in batches, and folded into hourly and daily rollup tables that back the
//! dashboard queries.

pub mod config;
pub mod cron;
pub mod db;
pub mod error;
pub mod query;
pub mod retention;
pub mod stats;

pub use error::{Error, Result};
