// File: src/storage/sqlite/backfill.rs

//! Backfill queue and per-tree leases

use super::convert::{row_to_backfill_item, row_to_lease, BACKFILL_COLUMNS};
use super::store::now_nanos;
use crate::error::{ReplicaError, ReplicaResult};
use crate::types::{BackfillItem, ClaimedItem, TreeId, TreeLease};
use rusqlite::{params, Connection, OptionalExtension};

/// New queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewBackfillItem {
    pub tree: TreeId,
    pub seq: u64,
    pub until_seq: Option<u64>,
    pub slot: u64,
    pub force_chk: bool,
}

/// Queue an item. Returns the new id, or `None` when an open item for the
/// same `(tree, seq, force_chk)` already exists.
pub fn enqueue(conn: &Connection, item: &NewBackfillItem) -> ReplicaResult<Option<i64>> {
    let now = now_nanos();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO backfill_items
            (tree, seq, until_seq, slot, force_chk, backfilled, attempts, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6, ?6)",
        params![
            item.tree.as_slice(),
            item.seq as i64,
            item.until_seq.map(|s| s as i64),
            item.slot as i64,
            item.force_chk as i64,
            now,
        ],
    )?;
    if inserted == 1 {
        Ok(Some(conn.last_insert_rowid()))
    } else {
        Ok(None)
    }
}

/// Claim the next eligible item and take its tree lease.
///
/// Eligible: not backfilled, past its retry cooldown, tree not halted, and
/// tree lease absent or expired. Ordering is `force_chk` first, then
/// ascending seq, then id. Must run inside a write transaction.
pub fn claim_next(
    conn: &Connection,
    holder: &str,
    lease_ms: u64,
    now: i64,
) -> ReplicaResult<Option<ClaimedItem>> {
    let sql = format!(
        "SELECT {} FROM backfill_items b
         LEFT JOIN tree_leases l ON l.tree = b.tree
         LEFT JOIN tree_sync s ON s.tree = b.tree
         WHERE b.backfilled = 0
           AND (b.retry_at IS NULL OR b.retry_at <= ?1)
           AND (l.tree IS NULL OR l.expires_at <= ?1)
           AND (s.status IS NULL OR s.status != 'halted')
         ORDER BY b.force_chk DESC, b.seq ASC, b.id ASC
         LIMIT 1",
        prefixed_columns("b")
    );
    let item = conn.query_row(&sql, params![now], row_to_backfill_item).optional()?;
    let Some(item) = item else {
        return Ok(None);
    };

    let previous = lease_for(conn, &item.tree)?;
    let reclaimed = previous.as_ref().is_some_and(|l| l.holder != holder);
    if let Some(prev) = previous.as_ref().filter(|_| reclaimed) {
        tracing::warn!(
            tree = %hex::encode(item.tree),
            previous_holder = %prev.holder,
            previous_item = prev.item_id,
            "Reclaiming expired tree lease"
        );
    }

    let lease = TreeLease {
        tree: item.tree,
        holder: holder.to_string(),
        item_id: item.id,
        expires_at: now + (lease_ms as i64) * 1_000_000,
    };
    conn.execute(
        "INSERT INTO tree_leases (tree, holder, item_id, expires_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(tree) DO UPDATE SET
            holder = excluded.holder,
            item_id = excluded.item_id,
            expires_at = excluded.expires_at",
        params![
            lease.tree.as_slice(),
            lease.holder,
            lease.item_id,
            lease.expires_at
        ],
    )?;

    Ok(Some(ClaimedItem {
        item,
        lease,
        reclaimed,
    }))
}

/// Extend a lease the caller still holds
pub fn renew_lease(
    conn: &Connection,
    lease: &TreeLease,
    lease_ms: u64,
    now: i64,
) -> ReplicaResult<TreeLease> {
    let expires_at = now + (lease_ms as i64) * 1_000_000;
    let updated = conn.execute(
        "UPDATE tree_leases SET expires_at = ?1
         WHERE tree = ?2 AND holder = ?3 AND item_id = ?4 AND expires_at > ?5",
        params![
            expires_at,
            lease.tree.as_slice(),
            lease.holder,
            lease.item_id,
            now
        ],
    )?;
    if updated == 0 {
        return Err(ReplicaError::LeaseExpired {
            item_id: lease.item_id,
        });
    }
    Ok(TreeLease {
        expires_at,
        ..lease.clone()
    })
}

/// Mark an item backfilled and drop the lease.
///
/// Fails with `LeaseExpired` if another worker took the tree in the
/// meantime.
pub fn complete(conn: &Connection, lease: &TreeLease) -> ReplicaResult<()> {
    ensure_holder(conn, lease)?;
    conn.execute(
        "UPDATE backfill_items SET backfilled = 1, retry_at = NULL, last_error = NULL, updated_at = ?1
         WHERE id = ?2",
        params![now_nanos(), lease.item_id],
    )?;
    drop_lease(conn, lease)
}

/// Leave an item open after a failed attempt and drop the lease
pub fn release(
    conn: &Connection,
    lease: &TreeLease,
    error: &str,
    retry_at: Option<i64>,
) -> ReplicaResult<()> {
    ensure_holder(conn, lease)?;
    conn.execute(
        "UPDATE backfill_items
         SET attempts = attempts + 1, last_error = ?1, retry_at = ?2, updated_at = ?3
         WHERE id = ?4",
        params![error, retry_at, now_nanos(), lease.item_id],
    )?;
    drop_lease(conn, lease)
}

/// Reopen a backfilled item so it is worked again.
///
/// Returns false if the item is already open or an open twin exists.
pub fn reopen(conn: &Connection, item_id: i64) -> ReplicaResult<bool> {
    let updated = conn.execute(
        "UPDATE OR IGNORE backfill_items SET backfilled = 0, retry_at = NULL, updated_at = ?1
         WHERE id = ?2 AND backfilled = 1",
        params![now_nanos(), item_id],
    )?;
    Ok(updated == 1)
}

pub fn get(conn: &Connection, item_id: i64) -> ReplicaResult<Option<BackfillItem>> {
    let sql = format!("SELECT {} FROM backfill_items WHERE id = ?1", BACKFILL_COLUMNS);
    let item = conn
        .query_row(&sql, params![item_id], row_to_backfill_item)
        .optional()?;
    Ok(item)
}

/// Items for one tree (open and closed), oldest first
pub fn list_for_tree(conn: &Connection, tree: &TreeId) -> ReplicaResult<Vec<BackfillItem>> {
    let sql = format!(
        "SELECT {} FROM backfill_items WHERE tree = ?1 ORDER BY id ASC",
        BACKFILL_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params![tree.as_slice()], row_to_backfill_item)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

/// Open items in claim order
pub fn list_open(conn: &Connection) -> ReplicaResult<Vec<BackfillItem>> {
    let sql = format!(
        "SELECT {} FROM backfill_items WHERE backfilled = 0
         ORDER BY force_chk DESC, seq ASC, id ASC",
        BACKFILL_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map([], row_to_backfill_item)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

/// Open items for one tree, excluding `except_id`
pub fn count_open(conn: &Connection, tree: &TreeId, except_id: Option<i64>) -> ReplicaResult<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM backfill_items WHERE tree = ?1 AND backfilled = 0 AND id != ?2",
        params![tree.as_slice(), except_id.unwrap_or(-1)],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

pub fn lease_for(conn: &Connection, tree: &TreeId) -> ReplicaResult<Option<TreeLease>> {
    let lease = conn
        .query_row(
            "SELECT tree, holder, item_id, expires_at FROM tree_leases WHERE tree = ?1",
            params![tree.as_slice()],
            row_to_lease,
        )
        .optional()?;
    Ok(lease)
}

fn ensure_holder(conn: &Connection, lease: &TreeLease) -> ReplicaResult<()> {
    match lease_for(conn, &lease.tree)? {
        Some(current) if current.holder == lease.holder && current.item_id == lease.item_id => Ok(()),
        _ => Err(ReplicaError::LeaseExpired {
            item_id: lease.item_id,
        }),
    }
}

fn drop_lease(conn: &Connection, lease: &TreeLease) -> ReplicaResult<()> {
    conn.execute(
        "DELETE FROM tree_leases WHERE tree = ?1 AND holder = ?2",
        params![lease.tree.as_slice(), lease.holder],
    )?;
    Ok(())
}

fn prefixed_columns(alias: &str) -> String {
    BACKFILL_COLUMNS
        .split(", ")
        .map(|c| format!("{}.{}", alias, c))
        .collect::<Vec<_>>()
        .join(", ")
}
