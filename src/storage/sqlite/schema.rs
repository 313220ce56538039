// File: src/storage/sqlite/schema.rs

use crate::error::{ReplicaResult, StorageError};
use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: u32 = 2;

/// Create all tables (idempotent)
pub fn create_tables(conn: &Connection) -> ReplicaResult<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(PROJECTIONS_SQL)?;
    Ok(())
}

/// Stored schema version, if the database was initialized
pub fn schema_version(conn: &Connection) -> Option<u32> {
    conn.query_row(
        "SELECT value FROM replica_config WHERE key = 'schema_version'",
        [],
        |row| row.get::<_, String>(0),
    )
    .ok()
    .and_then(|s| s.parse().ok())
}

/// Run migrations from current version to latest
pub fn migrate(conn: &Connection) -> ReplicaResult<()> {
    let current = schema_version(conn).unwrap_or(1);

    if current > SCHEMA_VERSION {
        return Err(StorageError::MigrationFailed(format!(
            "database schema v{} is newer than supported v{}",
            current, SCHEMA_VERSION
        ))
        .into());
    }

    if current < 2 {
        // v1 stored only the revision log; v2 adds the leaf projections
        migrate_v1_to_v2(conn)?;
    }

    let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
    conn.execute(
        "INSERT OR REPLACE INTO replica_config (key, value, updated_at) VALUES ('schema_version', ?1, ?2)",
        rusqlite::params![SCHEMA_VERSION.to_string(), now],
    )?;

    Ok(())
}

fn migrate_v1_to_v2(conn: &Connection) -> ReplicaResult<()> {
    conn.execute_batch(PROJECTIONS_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Core configuration
CREATE TABLE IF NOT EXISTS replica_config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Raw chain transactions, keyed by signature
CREATE TABLE IF NOT EXISTS raw_events (
    signature TEXT PRIMARY KEY,
    slot INTEGER NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,   -- 0/1
    created_at INTEGER NOT NULL             -- Unix nanoseconds
);

-- Append-only node revision log
CREATE TABLE IF NOT EXISTS node_revisions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tree BLOB NOT NULL,                     -- 32 bytes
    node_idx INTEGER NOT NULL,
    leaf_idx INTEGER,                       -- leaf nodes only
    seq INTEGER NOT NULL,
    level INTEGER NOT NULL,                 -- 0 = leaves
    hash BLOB NOT NULL,                     -- 32 bytes
    slot INTEGER NOT NULL,
    signature TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_node_revisions_unique
    ON node_revisions(tree, node_idx, seq);
CREATE INDEX IF NOT EXISTS idx_node_revisions_tree_seq
    ON node_revisions(tree, seq);
CREATE INDEX IF NOT EXISTS idx_node_revisions_leaf
    ON node_revisions(tree, leaf_idx) WHERE leaf_idx IS NOT NULL;

-- One row per observed tree sequence number
CREATE TABLE IF NOT EXISTS seq_audit (
    tree BLOB NOT NULL,
    seq INTEGER NOT NULL,
    signature TEXT NOT NULL,
    slot INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (tree, seq)
);

-- Leaf payload history, replayed when deferred revisions are released
CREATE TABLE IF NOT EXISTS leaf_changelog (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tree BLOB NOT NULL,
    leaf_idx INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    slot INTEGER NOT NULL,
    kind TEXT NOT NULL,                     -- 'full', 'patch', 'empty'
    payload TEXT NOT NULL,                  -- JSON
    created_at INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_leaf_changelog_unique
    ON leaf_changelog(tree, leaf_idx, seq);
CREATE INDEX IF NOT EXISTS idx_leaf_changelog_tree_seq
    ON leaf_changelog(tree, seq);

-- Registered trees
CREATE TABLE IF NOT EXISTS trees (
    id BLOB PRIMARY KEY,
    discriminator BLOB NOT NULL,            -- 8 bytes
    program TEXT,
    schema TEXT,                            -- JSON
    max_depth INTEGER NOT NULL,
    canopy_depth INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Per-tree consistency state
CREATE TABLE IF NOT EXISTS tree_sync (
    tree BLOB PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'in_sync',
    last_contiguous_seq INTEGER NOT NULL DEFAULT 0,
    max_seen_seq INTEGER NOT NULL DEFAULT 0,
    root_mismatches INTEGER NOT NULL DEFAULT 0,
    halted_reason TEXT,
    updated_at INTEGER NOT NULL
);

-- Backfill queue
CREATE TABLE IF NOT EXISTS backfill_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tree BLOB NOT NULL,
    seq INTEGER NOT NULL,                   -- first missing seq
    until_seq INTEGER,                      -- last missing seq (range items)
    slot INTEGER NOT NULL,
    force_chk INTEGER NOT NULL DEFAULT 0,
    backfilled INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    retry_at INTEGER,                       -- Unix nanoseconds
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- At most one open item per (tree, seq, force_chk)
CREATE UNIQUE INDEX IF NOT EXISTS idx_backfill_items_open
    ON backfill_items(tree, seq, force_chk) WHERE backfilled = 0;
CREATE INDEX IF NOT EXISTS idx_backfill_items_pending
    ON backfill_items(backfilled, force_chk DESC, seq);

-- Per-tree worker leases
CREATE TABLE IF NOT EXISTS tree_leases (
    tree BLOB PRIMARY KEY,
    holder TEXT NOT NULL,
    item_id INTEGER NOT NULL,
    expires_at INTEGER NOT NULL             -- Unix nanoseconds
);
"#;

const PROJECTIONS_SQL: &str = r#"
-- Current node hashes
CREATE TABLE IF NOT EXISTS nodes (
    tree BLOB NOT NULL,
    node_idx INTEGER NOT NULL,
    leaf_idx INTEGER,
    level INTEGER NOT NULL,
    hash BLOB NOT NULL,
    seq INTEGER NOT NULL,                   -- watermark
    slot_updated INTEGER NOT NULL,
    PRIMARY KEY (tree, node_idx)
);

-- One asset per leaf position
CREATE TABLE IF NOT EXISTS assets (
    id BLOB PRIMARY KEY,
    tree BLOB NOT NULL,
    leaf_idx INTEGER NOT NULL,
    leaf_hash BLOB,
    owner BLOB,
    delegate BLOB,
    burnt INTEGER NOT NULL DEFAULT 0,
    leaf_seq INTEGER NOT NULL DEFAULT 0,    -- watermark for leaf_hash
    seq INTEGER NOT NULL DEFAULT 0,         -- watermark for ownership
    slot_updated INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_assets_tree_leaf ON assets(tree, leaf_idx);
CREATE INDEX IF NOT EXISTS idx_assets_owner ON assets(owner);

CREATE TABLE IF NOT EXISTS asset_data (
    id BLOB PRIMARY KEY,
    discriminator BLOB,
    raw BLOB,
    parsed TEXT,                            -- JSON, NULL when undecodable
    seq INTEGER NOT NULL,
    slot_updated INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS asset_grouping (
    asset_id BLOB NOT NULL,
    group_key TEXT NOT NULL,
    group_value TEXT NOT NULL,
    seq INTEGER NOT NULL,
    slot_updated INTEGER NOT NULL,
    PRIMARY KEY (asset_id, group_key)
);

CREATE INDEX IF NOT EXISTS idx_asset_grouping_value
    ON asset_grouping(group_key, group_value);

CREATE TABLE IF NOT EXISTS asset_authority (
    asset_id BLOB PRIMARY KEY,
    authority BLOB NOT NULL,
    seq INTEGER NOT NULL,
    slot_updated INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS asset_creators (
    asset_id BLOB NOT NULL,
    position INTEGER NOT NULL,
    creator BLOB NOT NULL,
    share INTEGER NOT NULL,
    verified INTEGER NOT NULL DEFAULT 0,
    seq INTEGER NOT NULL,
    slot_updated INTEGER NOT NULL,
    PRIMARY KEY (asset_id, position)
);

CREATE INDEX IF NOT EXISTS idx_asset_creators_creator ON asset_creators(creator);

-- Generic leaf data projection
CREATE TABLE IF NOT EXISTS compressed_data (
    id BLOB PRIMARY KEY,
    tree BLOB NOT NULL,
    leaf_idx INTEGER NOT NULL,
    discriminator BLOB,
    raw BLOB,
    parsed TEXT,                            -- JSON
    schema_validated INTEGER NOT NULL DEFAULT 0,
    empty INTEGER NOT NULL DEFAULT 0,       -- tombstone
    seq INTEGER NOT NULL,
    slot_updated INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_compressed_data_tree_leaf
    ON compressed_data(tree, leaf_idx);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tables_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('raw_events', 'node_revisions', 'backfill_items', 'tree_leases', 'nodes', 'compressed_data')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 6);
    }

    #[test]
    fn test_migrate_records_version() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();
        assert_eq!(schema_version(&conn), None);

        migrate(&conn).unwrap();
        assert_eq!(schema_version(&conn), Some(SCHEMA_VERSION));

        // v1 -> v2 added projections
        let exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'assets'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(exists, 1);
    }

    #[test]
    fn test_migrate_rejects_newer_schema() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        conn.execute(
            "INSERT INTO replica_config (key, value, updated_at) VALUES ('schema_version', '99', 0)",
            [],
        )
        .unwrap();
        assert!(migrate(&conn).is_err());
    }

    #[test]
    fn test_open_item_uniqueness_is_partial() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        let insert = "INSERT OR IGNORE INTO backfill_items
            (tree, seq, slot, force_chk, backfilled, created_at, updated_at)
            VALUES (x'01', 4, 0, 0, ?1, 0, 0)";

        assert_eq!(conn.execute(insert, [1]).unwrap(), 1);
        assert_eq!(conn.execute(insert, [0]).unwrap(), 1);
        // second open item for the same (tree, seq, force_chk) is ignored
        assert_eq!(conn.execute(insert, [0]).unwrap(), 0);
    }
}
