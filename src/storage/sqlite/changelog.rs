// File: src/storage/sqlite/changelog.rs

//! Leaf payload history

use super::store::now_nanos;
use crate::error::ReplicaResult;
use crate::types::{LeafChange, LeafPayload, TreeId};
use rusqlite::{params, Connection};

/// Log a leaf payload. Returns false if `(tree, leaf_idx, seq)` was already
/// logged.
pub fn insert(conn: &Connection, change: &LeafChange) -> ReplicaResult<bool> {
    let payload = serde_json::to_string(&change.payload)?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO leaf_changelog (tree, leaf_idx, seq, slot, kind, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            change.tree.as_slice(),
            change.leaf_idx as i64,
            change.seq as i64,
            change.slot as i64,
            change.payload.kind(),
            payload,
            now_nanos(),
        ],
    )?;
    Ok(inserted == 1)
}

/// Changes with seq in `[from_seq, to_seq]`, ordered by seq
pub fn changes_in_range(
    conn: &Connection,
    tree: &TreeId,
    from_seq: u64,
    to_seq: u64,
) -> ReplicaResult<Vec<LeafChange>> {
    let mut stmt = conn.prepare_cached(
        "SELECT tree, leaf_idx, seq, slot, payload FROM leaf_changelog
         WHERE tree = ?1 AND seq BETWEEN ?2 AND ?3
         ORDER BY seq ASC, id ASC",
    )?;
    let rows = stmt.query_map(
        params![tree.as_slice(), from_seq as i64, to_seq as i64],
        |row| {
            Ok((
                row.get::<_, i64>(1)? as u64,
                row.get::<_, i64>(2)? as u64,
                row.get::<_, i64>(3)? as u64,
                row.get::<_, String>(4)?,
            ))
        },
    )?;

    let mut changes = Vec::new();
    for row in rows {
        let (leaf_idx, seq, slot, payload) = row?;
        let payload: LeafPayload = serde_json::from_str(&payload)?;
        changes.push(LeafChange {
            tree: *tree,
            leaf_idx,
            seq,
            slot,
            payload,
        });
    }
    Ok(changes)
}

/// Payload history of one leaf, oldest first
pub fn leaf_history(conn: &Connection, tree: &TreeId, leaf_idx: u64) -> ReplicaResult<Vec<LeafChange>> {
    let mut stmt = conn.prepare_cached(
        "SELECT seq, slot, payload FROM leaf_changelog
         WHERE tree = ?1 AND leaf_idx = ?2 ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map(params![tree.as_slice(), leaf_idx as i64], |row| {
        Ok((
            row.get::<_, i64>(0)? as u64,
            row.get::<_, i64>(1)? as u64,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut changes = Vec::new();
    for row in rows {
        let (seq, slot, payload) = row?;
        changes.push(LeafChange {
            tree: *tree,
            leaf_idx,
            seq,
            slot,
            payload: serde_json::from_str(&payload)?,
        });
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::schema;

    #[test]
    fn test_insert_and_range() {
        let conn = Connection::open_in_memory().unwrap();
        schema::create_tables(&conn).unwrap();
        let tree = [5u8; 32];

        for seq in [3u64, 1, 2] {
            let change = LeafChange {
                tree,
                leaf_idx: 0,
                seq,
                slot: seq,
                payload: LeafPayload::Patch {
                    key: "n".into(),
                    value: serde_json::json!(seq),
                },
            };
            assert!(insert(&conn, &change).unwrap());
            assert!(!insert(&conn, &change).unwrap());
        }

        let seqs: Vec<u64> = changes_in_range(&conn, &tree, 2, 3)
            .unwrap()
            .iter()
            .map(|c| c.seq)
            .collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(leaf_history(&conn, &tree, 0).unwrap().len(), 3);
    }
}
