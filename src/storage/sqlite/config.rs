// File: src/storage/sqlite/config.rs

/// SQLite storage backend configuration
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to database file (or ":memory:" for in-memory)
    pub path: String,

    /// Enable WAL mode so readers and other processes are not blocked by
    /// the writer
    pub wal_mode: bool,

    /// Busy timeout in milliseconds
    pub busy_timeout_ms: u32,

    /// Enable foreign key enforcement
    pub foreign_keys: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: "replica.db".to_string(),
            wal_mode: true,
            busy_timeout_ms: 5000,
            foreign_keys: true,
        }
    }
}

/// Storage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Signatures recorded in the raw event store
    pub raw_event_count: u64,

    /// Rows in the node revision log
    pub revision_count: u64,

    /// Trees with sync state
    pub tree_count: u64,

    /// Backfill items not yet backfilled
    pub open_backfill_items: u64,

    /// Trees currently halted
    pub halted_trees: u64,
}
