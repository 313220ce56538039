//! Storage module
//!
//! A single SQLite database holds the raw event store, the node revision log,
//! the backfill queue with its leases, and every materialized projection.

pub mod sqlite;

pub use sqlite::{
    backfill, changelog, projections, raw_events, revisions, trees, SqliteConfig, SqliteStore,
    StorageStats,
};
