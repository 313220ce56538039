// File: src/ingest/mod.rs

//! Ingestion of chain transactions
//!
//! `Ingester` applies one transaction atomically. `IngestStream` feeds it
//! from a bounded channel so producers get backpressure and per-transaction
//! results.

mod batch;
mod buffer;
mod config;
mod ingester;
mod stream;

pub use buffer::{IngestHandle, IngestRequest};
pub use config::IngestConfig;
pub use ingester::{IngestOutcome, IngestStatus, Ingester};
pub(crate) use ingester::advance_status;
pub use stream::IngestStream;
