//! tree-replica library exports
//!
//! Ingests per-tree revision streams from a chain, keeps an append-only
//! revision log, detects sequence gaps and backfills them, and folds the log
//! into watermark-guarded projections.

pub mod backfill;
pub mod config;
pub mod consistency;
pub mod error;
pub mod ingest;
pub mod materializer;
pub mod query;
pub mod storage;
pub mod telemetry;
pub mod traits;
pub mod types;

// Re-exports
pub use backfill::{ArchiveFetcher, BackfillConfig, BackfillNotifier, BackfillRunner};
pub use config::ReplicaConfig;
pub use consistency::{ProjectionPolicy, TreeSyncStatus};
pub use error::{FetchError, ReplicaError, ReplicaResult, StorageError};
pub use ingest::{IngestConfig, IngestHandle, IngestOutcome, IngestStream, Ingester};
pub use materializer::{DecoderRegistry, TreeMaterializer};
pub use query::ReplicaReader;
pub use storage::SqliteStore;
pub use traits::{ChainFetcher, LeafDecoder};
