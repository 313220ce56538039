// File: src/storage/sqlite/mod.rs

//! SQLite backend
//!
//! Each table family lives in its own module as free functions over a
//! `&Connection`, so callers can compose them inside one `SqliteStore::write`
//! transaction.

pub mod backfill;
pub mod changelog;
mod config;
mod convert;
pub mod projections;
pub mod raw_events;
pub mod revisions;
mod schema;
mod store;
pub mod trees;

// Public exports
pub use config::{SqliteConfig, StorageStats};
pub use schema::SCHEMA_VERSION;
pub use store::{now_nanos, SqliteStore};
