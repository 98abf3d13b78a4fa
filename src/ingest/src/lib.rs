//! # Sentinel Ingest
//!
//! Bounded result staging between the fleet and the store: agents ship
//! `ResultBatch` values in, the flush worker drains them into bulk inserts.

pub mod buffer;
pub mod metrics;
pub mod types;

pub use buffer::{flush_once, run_flush_loop, ResultBuffer};
pub use types::{IngestConfig, IngestError};
