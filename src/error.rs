//! Replica error types

use thiserror::Error;

/// Main replica error type
#[derive(Debug, Error)]
pub enum ReplicaError {
    // ========== Ingestion Errors ==========
    /// Event failed structural validation at the ingestion boundary
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Chain data contradicts what was already recorded (e.g. a signature
    /// seen at two different slots). Never recovered automatically.
    #[error("ledger inconsistency: {0}")]
    LedgerInconsistency(String),

    /// Tree was halted after an irrecoverable inconsistency
    #[error("tree {tree} halted: {reason}")]
    TreeHalted { tree: String, reason: String },

    // ========== Lookup Errors ==========
    /// Tree metadata not registered
    #[error("tree not found: {0}")]
    TreeNotFound(String),

    /// Generic missing row
    #[error("not found: {0}")]
    NotFound(String),

    /// Leaf index does not fit the tree shape
    #[error("leaf index {index} out of bounds for tree depth {max_depth}")]
    LeafIndexOutOfBounds { index: u64, max_depth: u32 },

    // ========== Backfill Errors ==========
    /// Worker no longer holds the lease for the item it was reconciling
    #[error("lease expired for backfill item {item_id}")]
    LeaseExpired { item_id: i64 },

    /// Fetching canonical history failed
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Leaf payload could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    // ========== Storage Errors ==========
    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(StorageError),

    // ========== Runtime Errors ==========
    /// Ingestion buffer full or stream stopped
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Storage-specific errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database connection failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Schema migration failed
    #[error("migration failed: {0}")]
    MigrationFailed(String),

    /// SQLite database error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Errors raised while fetching canonical history from the chain
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network failure talking to the chain
    #[error("network error: {0}")]
    Network(String),

    /// Request timed out (milliseconds)
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// Source temporarily unavailable
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// Requested tree or range does not exist at the source
    #[error("not found: {0}")]
    NotFound(String),

    /// Source returned data that cannot be parsed
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Transient failures are retried with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_) | FetchError::Timeout(_) | FetchError::Unavailable(_)
        )
    }
}

/// Replica result type alias
pub type ReplicaResult<T> = Result<T, ReplicaError>;

impl ReplicaError {
    /// Stable error code for logs and operator tooling
    pub fn error_code(&self) -> &'static str {
        match self {
            ReplicaError::InvalidEvent(_) => "INVALID_EVENT",
            ReplicaError::LedgerInconsistency(_) => "LEDGER_INCONSISTENCY",
            ReplicaError::TreeHalted { .. } => "TREE_HALTED",
            ReplicaError::TreeNotFound(_) => "TREE_NOT_FOUND",
            ReplicaError::NotFound(_) => "NOT_FOUND",
            ReplicaError::LeafIndexOutOfBounds { .. } => "INDEX_OUT_OF_BOUNDS",
            ReplicaError::LeaseExpired { .. } => "LEASE_EXPIRED",
            ReplicaError::Fetch(_) => "FETCH_ERROR",
            ReplicaError::Decode(_) => "DECODE_ERROR",
            ReplicaError::Storage(_) => "STORAGE_ERROR",
            ReplicaError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            ReplicaError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Check if the operation may succeed when retried
    pub fn is_recoverable(&self) -> bool {
        match self {
            ReplicaError::Fetch(e) => e.is_transient(),
            ReplicaError::LeaseExpired { .. } | ReplicaError::ServiceUnavailable(_) => true,
            ReplicaError::Storage(StorageError::ConnectionFailed(_)) => true,
            ReplicaError::Storage(StorageError::Sqlite(e)) => is_busy(e),
            _ => false,
        }
    }

    /// Fatal errors halt ingestion for the affected tree and need an operator
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReplicaError::LedgerInconsistency(_) | ReplicaError::TreeHalted { .. }
        )
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

// Conversions from external errors

impl From<serde_json::Error> for ReplicaError {
    fn from(e: serde_json::Error) -> Self {
        ReplicaError::InvalidEvent(e.to_string())
    }
}

impl From<hex::FromHexError> for ReplicaError {
    fn from(e: hex::FromHexError) -> Self {
        ReplicaError::InvalidEvent(format!("hex decode: {}", e))
    }
}

impl From<rusqlite::Error> for ReplicaError {
    fn from(e: rusqlite::Error) -> Self {
        ReplicaError::Storage(StorageError::Sqlite(e))
    }
}

impl From<StorageError> for ReplicaError {
    fn from(e: StorageError) -> Self {
        ReplicaError::Storage(e)
    }
}

impl From<tokio::task::JoinError> for ReplicaError {
    fn from(e: tokio::task::JoinError) -> Self {
        ReplicaError::Internal(format!("blocking task failed: {}", e))
    }
}
