// File: src/storage/sqlite/convert.rs

use crate::consistency::TreeSyncStatus;
use crate::types::{BackfillItem, NodeRevision, TreeLease, TreeMetadata, TreeSyncRecord};
use rusqlite::types::Type;
use rusqlite::Row;

/// Read a fixed-size blob column
pub fn blob_array<const N: usize>(row: &Row, idx: usize, name: &str) -> rusqlite::Result<[u8; N]> {
    let bytes: Vec<u8> = row.get(idx)?;
    bytes
        .try_into()
        .map_err(|_| rusqlite::Error::InvalidColumnType(idx, name.into(), Type::Blob))
}

/// Read a nullable fixed-size blob column
pub fn opt_blob_array<const N: usize>(
    row: &Row,
    idx: usize,
    name: &str,
) -> rusqlite::Result<Option<[u8; N]>> {
    let bytes: Option<Vec<u8>> = row.get(idx)?;
    bytes
        .map(|b| {
            b.try_into()
                .map_err(|_| rusqlite::Error::InvalidColumnType(idx, name.into(), Type::Blob))
        })
        .transpose()
}

/// Read a nullable JSON text column
pub fn opt_json(row: &Row, idx: usize, name: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|s| {
        serde_json::from_str(&s)
            .map_err(|_| rusqlite::Error::InvalidColumnType(idx, name.into(), Type::Text))
    })
    .transpose()
}

/// Columns: id, tree, node_idx, leaf_idx, seq, level, hash, slot, signature
pub const REVISION_COLUMNS: &str = "id, tree, node_idx, leaf_idx, seq, level, hash, slot, signature";

pub fn row_to_revision(row: &Row) -> rusqlite::Result<NodeRevision> {
    let leaf_idx: Option<i64> = row.get(3)?;
    Ok(NodeRevision {
        id: row.get(0)?,
        tree: blob_array(row, 1, "tree")?,
        node_idx: row.get::<_, i64>(2)? as u64,
        leaf_idx: leaf_idx.map(|i| i as u64),
        seq: row.get::<_, i64>(4)? as u64,
        level: row.get::<_, i64>(5)? as u32,
        hash: blob_array(row, 6, "hash")?,
        slot: row.get::<_, i64>(7)? as u64,
        signature: row.get(8)?,
    })
}

/// Columns: id, tree, seq, until_seq, slot, force_chk, backfilled, attempts,
/// last_error, retry_at, created_at
pub const BACKFILL_COLUMNS: &str =
    "id, tree, seq, until_seq, slot, force_chk, backfilled, attempts, last_error, retry_at, created_at";

pub fn row_to_backfill_item(row: &Row) -> rusqlite::Result<BackfillItem> {
    let until_seq: Option<i64> = row.get(3)?;
    Ok(BackfillItem {
        id: row.get(0)?,
        tree: blob_array(row, 1, "tree")?,
        seq: row.get::<_, i64>(2)? as u64,
        until_seq: until_seq.map(|s| s as u64),
        slot: row.get::<_, i64>(4)? as u64,
        force_chk: row.get::<_, i64>(5)? != 0,
        backfilled: row.get::<_, i64>(6)? != 0,
        attempts: row.get::<_, i64>(7)? as u32,
        last_error: row.get(8)?,
        retry_at: row.get(9)?,
        created_at: row.get(10)?,
    })
}

/// Columns: tree, holder, item_id, expires_at
pub fn row_to_lease(row: &Row) -> rusqlite::Result<TreeLease> {
    Ok(TreeLease {
        tree: blob_array(row, 0, "tree")?,
        holder: row.get(1)?,
        item_id: row.get(2)?,
        expires_at: row.get(3)?,
    })
}

/// Columns: tree, status, last_contiguous_seq, max_seen_seq, root_mismatches,
/// halted_reason, updated_at
pub const TREE_SYNC_COLUMNS: &str =
    "tree, status, last_contiguous_seq, max_seen_seq, root_mismatches, halted_reason, updated_at";

pub fn row_to_tree_sync(row: &Row) -> rusqlite::Result<TreeSyncRecord> {
    let status: String = row.get(1)?;
    Ok(TreeSyncRecord {
        tree: blob_array(row, 0, "tree")?,
        status: TreeSyncStatus::parse(&status)
            .ok_or_else(|| rusqlite::Error::InvalidColumnType(1, "status".into(), Type::Text))?,
        last_contiguous_seq: row.get::<_, i64>(2)? as u64,
        max_seen_seq: row.get::<_, i64>(3)? as u64,
        root_mismatches: row.get::<_, i64>(4)? as u32,
        halted_reason: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// Columns: id, discriminator, program, schema, max_depth, canopy_depth
pub fn row_to_tree_metadata(row: &Row) -> rusqlite::Result<TreeMetadata> {
    let schema: Option<String> = row.get(3)?;
    let schema = schema
        .map(|s| {
            serde_json::from_str(&s)
                .map_err(|_| rusqlite::Error::InvalidColumnType(3, "schema".into(), Type::Text))
        })
        .transpose()?;

    Ok(TreeMetadata {
        id: blob_array(row, 0, "id")?,
        discriminator: blob_array(row, 1, "discriminator")?,
        program: row.get(2)?,
        schema,
        max_depth: row.get::<_, i64>(4)? as u32,
        canopy_depth: row.get::<_, i64>(5)? as u32,
    })
}
