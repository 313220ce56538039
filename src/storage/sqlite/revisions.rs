// File: src/storage/sqlite/revisions.rs

//! Node revision log and per-tree sequence audit

use super::convert::{row_to_revision, REVISION_COLUMNS};
use super::store::now_nanos;
use crate::consistency::gap;
use crate::error::ReplicaResult;
use crate::types::{AppendOutcome, AppendRejection, GapRange, NodeRevision, NodeWrite, TreeId};
use rusqlite::{params, Connection, OptionalExtension};

/// Parameters for a single log append
#[derive(Debug, Clone, Copy)]
pub struct AppendParams<'a> {
    pub tree: &'a TreeId,
    pub node: &'a NodeWrite,
    pub seq: u64,
    pub slot: u64,
    pub signature: &'a str,
}

/// Append a node revision.
///
/// A revision already logged at `(tree, node_idx, seq)` is rejected without
/// touching the existing row. Revisions older than the current node state are
/// still logged; only projections apply the watermark.
pub fn append(conn: &Connection, params: AppendParams<'_>) -> ReplicaResult<AppendOutcome> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO node_revisions
            (tree, node_idx, leaf_idx, seq, level, hash, slot, signature, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            params.tree.as_slice(),
            params.node.node_idx as i64,
            params.node.leaf_idx.map(|i| i as i64),
            params.seq as i64,
            params.node.level as i64,
            params.node.hash.as_slice(),
            params.slot as i64,
            params.signature,
            now_nanos(),
        ],
    )?;

    if inserted == 1 {
        Ok(AppendOutcome::Accepted)
    } else {
        Ok(AppendOutcome::Rejected(AppendRejection::StaleSequence))
    }
}

/// Note that `seq` was observed on `tree`. Returns false if it was already
/// known.
pub fn record_seq(
    conn: &Connection,
    tree: &TreeId,
    seq: u64,
    signature: &str,
    slot: u64,
) -> ReplicaResult<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO seq_audit (tree, seq, signature, slot, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![tree.as_slice(), seq as i64, signature, slot as i64, now_nanos()],
    )?;
    Ok(inserted == 1)
}

/// Highest contiguous seq reachable from `frontier` through observed seqs
pub fn advance_frontier(conn: &Connection, tree: &TreeId, frontier: u64) -> ReplicaResult<u64> {
    let mut stmt = conn.prepare_cached(
        "SELECT seq FROM seq_audit WHERE tree = ?1 AND seq > ?2 ORDER BY seq ASC",
    )?;
    let mut rows = stmt.query(params![tree.as_slice(), frontier as i64])?;

    let mut current = frontier;
    while let Some(row) = rows.next()? {
        let seq = row.get::<_, i64>(0)? as u64;
        if seq != current + 1 {
            break;
        }
        current = seq;
    }
    Ok(current)
}

/// Inclusive ranges of seqs in `[start, end]` never observed on `tree`
pub fn missing_ranges(
    conn: &Connection,
    tree: &TreeId,
    start: u64,
    end: u64,
) -> ReplicaResult<Vec<(u64, u64)>> {
    if end < start {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare_cached(
        "SELECT seq FROM seq_audit WHERE tree = ?1 AND seq BETWEEN ?2 AND ?3 ORDER BY seq ASC",
    )?;
    let present = stmt
        .query_map(params![tree.as_slice(), start as i64, end as i64], |row| {
            row.get::<_, i64>(0).map(|s| s as u64)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(gap::missing_ranges(&present, start, end))
}

/// Every hole between observed seqs on `tree`, including a leading hole
/// before the first observed seq
pub fn interior_gaps(conn: &Connection, tree: &TreeId) -> ReplicaResult<Vec<GapRange>> {
    let mut gaps = Vec::new();

    let min_seq: Option<i64> = conn.query_row(
        "SELECT MIN(seq) FROM seq_audit WHERE tree = ?1",
        params![tree.as_slice()],
        |row| row.get(0),
    )?;
    match min_seq {
        None => return Ok(gaps),
        Some(min) if min > 1 => gaps.push(GapRange {
            tree: *tree,
            start_seq: 1,
            end_seq: min as u64 - 1,
        }),
        Some(_) => {}
    }

    let mut stmt = conn.prepare_cached(
        "SELECT seq, next_seq FROM (
             SELECT seq, LEAD(seq) OVER (ORDER BY seq) AS next_seq
             FROM seq_audit WHERE tree = ?1
         ) WHERE next_seq > seq + 1
         ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map(params![tree.as_slice()], |row| {
        Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64))
    })?;
    for row in rows {
        let (seq, next) = row?;
        gaps.push(GapRange {
            tree: *tree,
            start_seq: seq + 1,
            end_seq: next - 1,
        });
    }
    Ok(gaps)
}

/// Log rows with seq in `[from_seq, to_seq]`, ordered by seq
pub fn revisions_in_range(
    conn: &Connection,
    tree: &TreeId,
    from_seq: u64,
    to_seq: u64,
) -> ReplicaResult<Vec<NodeRevision>> {
    let sql = format!(
        "SELECT {} FROM node_revisions WHERE tree = ?1 AND seq BETWEEN ?2 AND ?3 ORDER BY seq ASC, id ASC",
        REVISION_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let revisions = stmt
        .query_map(
            params![tree.as_slice(), from_seq as i64, to_seq as i64],
            row_to_revision,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(revisions)
}

/// Full history of one node, oldest first
pub fn node_history(
    conn: &Connection,
    tree: &TreeId,
    node_idx: u64,
) -> ReplicaResult<Vec<NodeRevision>> {
    let sql = format!(
        "SELECT {} FROM node_revisions WHERE tree = ?1 AND node_idx = ?2 ORDER BY seq ASC",
        REVISION_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let revisions = stmt
        .query_map(params![tree.as_slice(), node_idx as i64], row_to_revision)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(revisions)
}

/// Node state as of revision `seq` (latest revision at or below it)
pub fn node_at_seq(
    conn: &Connection,
    tree: &TreeId,
    node_idx: u64,
    seq: u64,
) -> ReplicaResult<Option<NodeRevision>> {
    let sql = format!(
        "SELECT {} FROM node_revisions WHERE tree = ?1 AND node_idx = ?2 AND seq <= ?3
         ORDER BY seq DESC LIMIT 1",
        REVISION_COLUMNS
    );
    let revision = conn
        .query_row(
            &sql,
            params![tree.as_slice(), node_idx as i64, seq as i64],
            row_to_revision,
        )
        .optional()?;
    Ok(revision)
}

/// Number of log rows for a tree
pub fn count_revisions(conn: &Connection, tree: &TreeId) -> ReplicaResult<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM node_revisions WHERE tree = ?1",
        params![tree.as_slice()],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}
