// File: src/storage/sqlite/store.rs

use super::config::{SqliteConfig, StorageStats};
use super::schema;
use crate::error::{ReplicaError, ReplicaResult, StorageError};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Current time as unix nanoseconds
pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

/// SQLite-backed replica store
///
/// Holds the raw event store, revision log, backfill queue, leases and all
/// projections in a single database so that one ingestion step commits
/// atomically. Several stores (threads or processes) may open the same file;
/// writers serialize through `BEGIN IMMEDIATE` and the busy timeout.
#[derive(Clone)]
pub struct SqliteStore {
    /// Database connection (protected by mutex for thread safety)
    conn: Arc<Mutex<Connection>>,

    config: SqliteConfig,
}

impl SqliteStore {
    /// Create a new SqliteStore with default configuration
    ///
    /// Creates the database file if it doesn't exist. Call `initialize()`
    /// before use.
    pub fn new<P: AsRef<Path>>(path: P) -> ReplicaResult<Self> {
        let config = SqliteConfig {
            path: path.as_ref().to_string_lossy().to_string(),
            ..Default::default()
        };
        Self::with_config(config)
    }

    /// Create with custom configuration
    pub fn with_config(config: SqliteConfig) -> ReplicaResult<Self> {
        let conn = Connection::open(&config.path).map_err(|e| {
            ReplicaError::Storage(StorageError::ConnectionFailed(format!(
                "failed to open db: {}",
                e
            )))
        })?;

        Self::configure_connection(&conn, &config)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> ReplicaResult<Self> {
        let config = SqliteConfig {
            path: ":memory:".to_string(),
            wal_mode: false,
            ..Default::default()
        };
        Self::with_config(config)
    }

    /// Open an existing database (fails if doesn't exist)
    pub fn open<P: AsRef<Path>>(path: P) -> ReplicaResult<Self> {
        if !path.as_ref().exists() {
            return Err(ReplicaError::Storage(StorageError::ConnectionFailed(
                "database does not exist".into(),
            )));
        }
        Self::new(path)
    }

    /// Configure SQLite connection pragmas
    fn configure_connection(conn: &Connection, config: &SqliteConfig) -> ReplicaResult<()> {
        if config.wal_mode {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        conn.pragma_update(None, "busy_timeout", config.busy_timeout_ms)?;
        if config.foreign_keys {
            conn.pragma_update(None, "foreign_keys", "ON")?;
        }
        // Performance optimizations
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "cache_size", -64000)?; // 64MB cache
        Ok(())
    }

    /// Create the schema (idempotent) and bring it to the current version
    pub fn initialize(&self) -> ReplicaResult<()> {
        let conn = self.get_conn()?;
        schema::create_tables(&conn)?;
        schema::migrate(&conn)?;

        let now = now_nanos();
        conn.execute(
            "INSERT OR IGNORE INTO replica_config (key, value, updated_at) VALUES ('created_at', ?1, ?1)",
            rusqlite::params![now],
        )?;
        Ok(())
    }

    /// Check if the database is initialized
    pub fn is_initialized(&self) -> bool {
        self.get_conn()
            .map(|conn| schema::schema_version(&conn).is_some())
            .unwrap_or(false)
    }

    /// Run schema migrations
    pub fn migrate(&self) -> ReplicaResult<()> {
        let conn = self.get_conn()?;
        schema::migrate(&conn)
    }

    /// Database file path
    pub fn path(&self) -> &str {
        &self.config.path
    }

    /// Get database statistics
    pub fn stats(&self) -> ReplicaResult<StorageStats> {
        self.read(|conn| {
            let count = |sql: &str| -> ReplicaResult<u64> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(n as u64)
            };
            Ok(StorageStats {
                raw_event_count: count("SELECT COUNT(*) FROM raw_events")?,
                revision_count: count("SELECT COUNT(*) FROM node_revisions")?,
                tree_count: count("SELECT COUNT(*) FROM tree_sync")?,
                open_backfill_items: count(
                    "SELECT COUNT(*) FROM backfill_items WHERE backfilled = 0",
                )?,
                halted_trees: count("SELECT COUNT(*) FROM tree_sync WHERE status = 'halted'")?,
            })
        })
    }

    /// Compact the database (VACUUM)
    pub fn compact(&self) -> ReplicaResult<()> {
        let conn = self.get_conn()?;
        conn.execute("VACUUM", [])?;
        Ok(())
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is taken up front so read-then-write sequences inside
    /// `f` cannot interleave with another writer. Any error rolls back.
    pub fn write<T, F>(&self, f: F) -> ReplicaResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> ReplicaResult<T>,
    {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run `f` against the connection without a write transaction
    pub fn read<T, F>(&self, f: F) -> ReplicaResult<T>
    where
        F: FnOnce(&Connection) -> ReplicaResult<T>,
    {
        let conn = self.get_conn()?;
        f(&conn)
    }

    /// Get locked connection for internal operations
    pub(crate) fn get_conn(&self) -> ReplicaResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| {
            ReplicaError::Storage(StorageError::ConnectionFailed("lock poisoned".into()))
        })
    }
}
