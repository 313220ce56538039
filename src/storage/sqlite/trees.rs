// File: src/storage/sqlite/trees.rs

//! Tree registry and per-tree sync state

use super::convert::{row_to_tree_metadata, row_to_tree_sync, TREE_SYNC_COLUMNS};
use super::store::now_nanos;
use crate::consistency::{SyncEvent, TreeSyncStatus};
use crate::error::{ReplicaError, ReplicaResult};
use crate::types::{tree_label, TreeId, TreeMetadata, TreeSyncRecord};
use rusqlite::{params, Connection, OptionalExtension};

// ========== Tree metadata ==========

/// Register a tree or update its mutable configuration (schema, canopy,
/// program). The discriminator and depth of a known tree never change.
pub fn upsert_tree(conn: &Connection, tree: &TreeMetadata) -> ReplicaResult<()> {
    if let Some(existing) = get_tree(conn, &tree.id)? {
        if existing.max_depth != tree.max_depth || existing.discriminator != tree.discriminator {
            return Err(ReplicaError::InvalidEvent(format!(
                "tree {} re-registered with different depth or discriminator",
                tree_label(&tree.id)
            )));
        }
    }

    let schema = tree.schema.as_ref().map(serde_json::to_string).transpose()?;
    let now = now_nanos();
    conn.execute(
        "INSERT INTO trees (id, discriminator, program, schema, max_depth, canopy_depth, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT(id) DO UPDATE SET
            program = excluded.program,
            schema = excluded.schema,
            canopy_depth = excluded.canopy_depth,
            updated_at = excluded.updated_at",
        params![
            tree.id.as_slice(),
            tree.discriminator.as_slice(),
            tree.program,
            schema,
            tree.max_depth as i64,
            tree.canopy_depth as i64,
            now,
        ],
    )?;
    Ok(())
}

pub fn get_tree(conn: &Connection, id: &TreeId) -> ReplicaResult<Option<TreeMetadata>> {
    let tree = conn
        .query_row(
            "SELECT id, discriminator, program, schema, max_depth, canopy_depth FROM trees WHERE id = ?1",
            params![id.as_slice()],
            row_to_tree_metadata,
        )
        .optional()?;
    Ok(tree)
}

pub fn list_trees(conn: &Connection) -> ReplicaResult<Vec<TreeMetadata>> {
    let mut stmt = conn.prepare(
        "SELECT id, discriminator, program, schema, max_depth, canopy_depth FROM trees ORDER BY id",
    )?;
    let trees = stmt
        .query_map([], row_to_tree_metadata)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(trees)
}

// ========== Sync state ==========

pub fn load_sync(conn: &Connection, tree: &TreeId) -> ReplicaResult<Option<TreeSyncRecord>> {
    let sql = format!("SELECT {} FROM tree_sync WHERE tree = ?1", TREE_SYNC_COLUMNS);
    let record = conn
        .query_row(&sql, params![tree.as_slice()], row_to_tree_sync)
        .optional()?;
    Ok(record)
}

/// Sync state for `tree`, created in `InSync` on first sight
pub fn load_or_init_sync(conn: &Connection, tree: &TreeId) -> ReplicaResult<TreeSyncRecord> {
    if let Some(record) = load_sync(conn, tree)? {
        return Ok(record);
    }
    let mut record = TreeSyncRecord::new(*tree);
    record.updated_at = now_nanos();
    save_sync(conn, &record)?;
    Ok(record)
}

pub fn save_sync(conn: &Connection, record: &TreeSyncRecord) -> ReplicaResult<()> {
    conn.execute(
        "INSERT INTO tree_sync (tree, status, last_contiguous_seq, max_seen_seq, root_mismatches, halted_reason, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(tree) DO UPDATE SET
            status = excluded.status,
            last_contiguous_seq = excluded.last_contiguous_seq,
            max_seen_seq = excluded.max_seen_seq,
            root_mismatches = excluded.root_mismatches,
            halted_reason = excluded.halted_reason,
            updated_at = excluded.updated_at",
        params![
            record.tree.as_slice(),
            record.status.as_str(),
            record.last_contiguous_seq as i64,
            record.max_seen_seq as i64,
            record.root_mismatches as i64,
            record.halted_reason,
            now_nanos(),
        ],
    )?;
    Ok(())
}

pub fn list_sync(conn: &Connection) -> ReplicaResult<Vec<TreeSyncRecord>> {
    let sql = format!("SELECT {} FROM tree_sync ORDER BY tree", TREE_SYNC_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map([], row_to_tree_sync)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Feed `event` into the tree's state machine and persist the result.
///
/// Events the current state does not accept leave it unchanged.
pub fn apply_event(
    conn: &Connection,
    tree: &TreeId,
    event: SyncEvent,
) -> ReplicaResult<TreeSyncStatus> {
    let mut record = load_or_init_sync(conn, tree)?;
    match record.status.transition(event) {
        Ok(next) => {
            if next != record.status {
                tracing::debug!(
                    tree = %tree_label(tree),
                    from = %record.status,
                    to = %next,
                    event = ?event,
                    "Tree sync state changed"
                );
                record.status = next;
                save_sync(conn, &record)?;
            }
            Ok(next)
        }
        Err(e) => {
            tracing::debug!(tree = %tree_label(tree), error = %e, "Ignoring sync event");
            Ok(record.status)
        }
    }
}

/// Stop ingestion and backfill for a tree until an operator resets it
pub fn halt(conn: &Connection, tree: &TreeId, reason: &str) -> ReplicaResult<()> {
    let mut record = load_or_init_sync(conn, tree)?;
    record.status = TreeSyncStatus::Halted;
    record.halted_reason = Some(reason.to_string());
    save_sync(conn, &record)
}

/// Clear a halt. Root mismatch counters restart from zero.
pub fn reset(conn: &Connection, tree: &TreeId) -> ReplicaResult<()> {
    let mut record = load_sync(conn, tree)?
        .ok_or_else(|| ReplicaError::TreeNotFound(tree_label(tree)))?;
    record.status = record
        .status
        .transition(SyncEvent::Reset)
        .map_err(|e| ReplicaError::InvalidEvent(e.to_string()))?;
    record.halted_reason = None;
    record.root_mismatches = 0;
    save_sync(conn, &record)
}
