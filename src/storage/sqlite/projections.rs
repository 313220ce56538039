// File: src/storage/sqlite/projections.rs

//! Materialized projections. Every write goes through the `seq >= watermark`
//! guard of its own row, so replaying older revisions never regresses state.

use super::convert::{blob_array, opt_blob_array, opt_json};
use crate::consistency::{admit, Admission};
use crate::error::ReplicaResult;
use crate::traits::CreatorShare;
use crate::types::{Discriminator, NodeHash, NodeWrite, Pubkey, TreeId};
use rusqlite::{params, Connection, OptionalExtension, Row};

// ========== Records ==========

/// Current state of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentNode {
    pub tree: TreeId,
    pub node_idx: u64,
    pub leaf_idx: Option<u64>,
    pub level: u32,
    pub hash: NodeHash,
    pub seq: u64,
    pub slot_updated: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRecord {
    pub id: [u8; 32],
    pub tree: TreeId,
    pub leaf_idx: u64,
    pub leaf_hash: Option<NodeHash>,
    pub owner: Option<Pubkey>,
    pub delegate: Option<Pubkey>,
    pub burnt: bool,
    /// Watermark of `leaf_hash`
    pub leaf_seq: u64,
    /// Watermark of ownership fields
    pub seq: u64,
    pub slot_updated: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssetDataRecord {
    pub id: [u8; 32],
    pub discriminator: Option<Discriminator>,
    pub raw: Option<Vec<u8>>,
    pub parsed: Option<serde_json::Value>,
    pub seq: u64,
    pub slot_updated: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupingRecord {
    pub asset_id: [u8; 32],
    pub key: String,
    pub value: String,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityRecord {
    pub asset_id: [u8; 32],
    pub authority: Pubkey,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatorRecord {
    pub asset_id: [u8; 32],
    pub position: u32,
    pub creator: Pubkey,
    pub share: u8,
    pub verified: bool,
    pub seq: u64,
}

/// Generic leaf data
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedDataRecord {
    pub id: [u8; 32],
    pub tree: TreeId,
    pub leaf_idx: u64,
    pub discriminator: Option<Discriminator>,
    pub raw: Option<Vec<u8>>,
    pub parsed: Option<serde_json::Value>,
    pub schema_validated: bool,
    /// Leaf was cleared
    pub empty: bool,
    pub seq: u64,
    pub slot_updated: u64,
}

// ========== Guarded writes ==========

fn watermark(conn: &Connection, sql: &str, key: impl rusqlite::Params) -> ReplicaResult<Option<u64>> {
    let seq: Option<i64> = conn
        .query_row(sql, key, |row| row.get::<_, Option<i64>>(0))
        .optional()?
        .flatten();
    Ok(seq.map(|s| s as u64))
}

pub fn upsert_node(
    conn: &Connection,
    tree: &TreeId,
    node: &NodeWrite,
    seq: u64,
    slot: u64,
) -> ReplicaResult<Admission> {
    let current = watermark(
        conn,
        "SELECT seq FROM nodes WHERE tree = ?1 AND node_idx = ?2",
        params![tree.as_slice(), node.node_idx as i64],
    )?;
    if admit(seq, current) == Admission::Stale {
        return Ok(Admission::Stale);
    }
    conn.execute(
        "INSERT INTO nodes (tree, node_idx, leaf_idx, level, hash, seq, slot_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(tree, node_idx) DO UPDATE SET
            leaf_idx = excluded.leaf_idx,
            level = excluded.level,
            hash = excluded.hash,
            seq = excluded.seq,
            slot_updated = excluded.slot_updated",
        params![
            tree.as_slice(),
            node.node_idx as i64,
            node.leaf_idx.map(|i| i as i64),
            node.level as i64,
            node.hash.as_slice(),
            seq as i64,
            slot as i64,
        ],
    )?;
    Ok(Admission::Apply)
}

/// Leaf hash of the asset at `(tree, leaf_idx)`
pub fn upsert_asset_leaf(
    conn: &Connection,
    asset_id: &[u8; 32],
    tree: &TreeId,
    leaf_idx: u64,
    leaf_hash: &NodeHash,
    seq: u64,
    slot: u64,
) -> ReplicaResult<Admission> {
    let current = watermark(
        conn,
        "SELECT leaf_seq FROM assets WHERE id = ?1",
        params![asset_id.as_slice()],
    )?;
    if admit(seq, current) == Admission::Stale {
        return Ok(Admission::Stale);
    }
    conn.execute(
        "INSERT INTO assets (id, tree, leaf_idx, leaf_hash, burnt, leaf_seq, seq, slot_updated)
         VALUES (?1, ?2, ?3, ?4, 0, ?5, 0, ?6)
         ON CONFLICT(id) DO UPDATE SET
            leaf_hash = excluded.leaf_hash,
            leaf_seq = excluded.leaf_seq,
            slot_updated = MAX(assets.slot_updated, excluded.slot_updated)",
        params![
            asset_id.as_slice(),
            tree.as_slice(),
            leaf_idx as i64,
            leaf_hash.as_slice(),
            seq as i64,
            slot as i64,
        ],
    )?;
    Ok(Admission::Apply)
}

/// Ownership fields of an asset
#[derive(Debug, Clone, Copy)]
pub struct OwnershipWrite<'a> {
    pub asset_id: &'a [u8; 32],
    pub tree: &'a TreeId,
    pub leaf_idx: u64,
    pub owner: Option<&'a Pubkey>,
    pub delegate: Option<&'a Pubkey>,
    pub burnt: bool,
    pub seq: u64,
    pub slot: u64,
}

pub fn upsert_asset_ownership(conn: &Connection, w: OwnershipWrite<'_>) -> ReplicaResult<Admission> {
    let current = watermark(
        conn,
        "SELECT seq FROM assets WHERE id = ?1",
        params![w.asset_id.as_slice()],
    )?;
    if admit(w.seq, current) == Admission::Stale {
        return Ok(Admission::Stale);
    }
    conn.execute(
        "INSERT INTO assets (id, tree, leaf_idx, owner, delegate, burnt, leaf_seq, seq, slot_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            owner = excluded.owner,
            delegate = excluded.delegate,
            burnt = excluded.burnt,
            seq = excluded.seq,
            slot_updated = MAX(assets.slot_updated, excluded.slot_updated)",
        params![
            w.asset_id.as_slice(),
            w.tree.as_slice(),
            w.leaf_idx as i64,
            w.owner.map(|o| o.as_slice()),
            w.delegate.map(|d| d.as_slice()),
            w.burnt as i64,
            w.seq as i64,
            w.slot as i64,
        ],
    )?;
    Ok(Admission::Apply)
}

/// Flag an existing asset as burnt, keeping its last owner
pub fn mark_asset_burnt(
    conn: &Connection,
    asset_id: &[u8; 32],
    seq: u64,
    slot: u64,
) -> ReplicaResult<Admission> {
    let current = watermark(
        conn,
        "SELECT seq FROM assets WHERE id = ?1",
        params![asset_id.as_slice()],
    )?;
    if current.is_none() || admit(seq, current) == Admission::Stale {
        return Ok(Admission::Stale);
    }
    conn.execute(
        "UPDATE assets SET burnt = 1, seq = ?1, slot_updated = MAX(slot_updated, ?2) WHERE id = ?3",
        params![seq as i64, slot as i64, asset_id.as_slice()],
    )?;
    Ok(Admission::Apply)
}

pub fn upsert_asset_data(
    conn: &Connection,
    asset_id: &[u8; 32],
    discriminator: &Discriminator,
    raw: &[u8],
    parsed: Option<&serde_json::Value>,
    seq: u64,
    slot: u64,
) -> ReplicaResult<Admission> {
    let current = watermark(
        conn,
        "SELECT seq FROM asset_data WHERE id = ?1",
        params![asset_id.as_slice()],
    )?;
    if admit(seq, current) == Admission::Stale {
        return Ok(Admission::Stale);
    }
    let parsed = parsed.map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO asset_data (id, discriminator, raw, parsed, seq, slot_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            discriminator = excluded.discriminator,
            raw = excluded.raw,
            parsed = excluded.parsed,
            seq = excluded.seq,
            slot_updated = excluded.slot_updated",
        params![
            asset_id.as_slice(),
            discriminator.as_slice(),
            raw,
            parsed,
            seq as i64,
            slot as i64,
        ],
    )?;
    Ok(Admission::Apply)
}

pub fn upsert_grouping(
    conn: &Connection,
    asset_id: &[u8; 32],
    key: &str,
    value: &str,
    seq: u64,
    slot: u64,
) -> ReplicaResult<Admission> {
    let current = watermark(
        conn,
        "SELECT seq FROM asset_grouping WHERE asset_id = ?1 AND group_key = ?2",
        params![asset_id.as_slice(), key],
    )?;
    if admit(seq, current) == Admission::Stale {
        return Ok(Admission::Stale);
    }
    conn.execute(
        "INSERT INTO asset_grouping (asset_id, group_key, group_value, seq, slot_updated)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(asset_id, group_key) DO UPDATE SET
            group_value = excluded.group_value,
            seq = excluded.seq,
            slot_updated = excluded.slot_updated",
        params![asset_id.as_slice(), key, value, seq as i64, slot as i64],
    )?;
    Ok(Admission::Apply)
}

pub fn upsert_authority(
    conn: &Connection,
    asset_id: &[u8; 32],
    authority: &Pubkey,
    seq: u64,
    slot: u64,
) -> ReplicaResult<Admission> {
    let current = watermark(
        conn,
        "SELECT seq FROM asset_authority WHERE asset_id = ?1",
        params![asset_id.as_slice()],
    )?;
    if admit(seq, current) == Admission::Stale {
        return Ok(Admission::Stale);
    }
    conn.execute(
        "INSERT INTO asset_authority (asset_id, authority, seq, slot_updated)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(asset_id) DO UPDATE SET
            authority = excluded.authority,
            seq = excluded.seq,
            slot_updated = excluded.slot_updated",
        params![asset_id.as_slice(), authority.as_slice(), seq as i64, slot as i64],
    )?;
    Ok(Admission::Apply)
}

/// Replace the creator list of an asset as a whole
pub fn replace_creators(
    conn: &Connection,
    asset_id: &[u8; 32],
    creators: &[CreatorShare],
    seq: u64,
    slot: u64,
) -> ReplicaResult<Admission> {
    let current = watermark(
        conn,
        "SELECT MAX(seq) FROM asset_creators WHERE asset_id = ?1",
        params![asset_id.as_slice()],
    )?;
    if admit(seq, current) == Admission::Stale {
        return Ok(Admission::Stale);
    }
    conn.execute(
        "DELETE FROM asset_creators WHERE asset_id = ?1",
        params![asset_id.as_slice()],
    )?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO asset_creators (asset_id, position, creator, share, verified, seq, slot_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for (position, creator) in creators.iter().enumerate() {
        stmt.execute(params![
            asset_id.as_slice(),
            position as i64,
            creator.address.as_slice(),
            creator.share as i64,
            creator.verified as i64,
            seq as i64,
            slot as i64,
        ])?;
    }
    Ok(Admission::Apply)
}

/// Full write of a compressed data row
#[derive(Debug, Clone, Copy)]
pub struct CompressedDataWrite<'a> {
    pub id: &'a [u8; 32],
    pub tree: &'a TreeId,
    pub leaf_idx: u64,
    pub discriminator: Option<&'a Discriminator>,
    pub raw: Option<&'a [u8]>,
    pub parsed: Option<&'a serde_json::Value>,
    pub schema_validated: bool,
    pub empty: bool,
    pub seq: u64,
    pub slot: u64,
}

pub fn upsert_compressed_data(
    conn: &Connection,
    w: CompressedDataWrite<'_>,
) -> ReplicaResult<Admission> {
    let current = watermark(
        conn,
        "SELECT seq FROM compressed_data WHERE tree = ?1 AND leaf_idx = ?2",
        params![w.tree.as_slice(), w.leaf_idx as i64],
    )?;
    if admit(w.seq, current) == Admission::Stale {
        return Ok(Admission::Stale);
    }
    let parsed = w.parsed.map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO compressed_data
            (id, tree, leaf_idx, discriminator, raw, parsed, schema_validated, empty, seq, slot_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(tree, leaf_idx) DO UPDATE SET
            discriminator = excluded.discriminator,
            raw = excluded.raw,
            parsed = excluded.parsed,
            schema_validated = excluded.schema_validated,
            empty = excluded.empty,
            seq = excluded.seq,
            slot_updated = excluded.slot_updated",
        params![
            w.id.as_slice(),
            w.tree.as_slice(),
            w.leaf_idx as i64,
            w.discriminator.map(|d| d.as_slice()),
            w.raw,
            parsed,
            w.schema_validated as i64,
            w.empty as i64,
            w.seq as i64,
            w.slot as i64,
        ],
    )?;
    Ok(Admission::Apply)
}

// ========== Reads ==========

fn row_to_node(row: &Row) -> rusqlite::Result<CurrentNode> {
    let leaf_idx: Option<i64> = row.get(2)?;
    Ok(CurrentNode {
        tree: blob_array(row, 0, "tree")?,
        node_idx: row.get::<_, i64>(1)? as u64,
        leaf_idx: leaf_idx.map(|i| i as u64),
        level: row.get::<_, i64>(3)? as u32,
        hash: blob_array(row, 4, "hash")?,
        seq: row.get::<_, i64>(5)? as u64,
        slot_updated: row.get::<_, i64>(6)? as u64,
    })
}

pub fn get_node(conn: &Connection, tree: &TreeId, node_idx: u64) -> ReplicaResult<Option<CurrentNode>> {
    let node = conn
        .query_row(
            "SELECT tree, node_idx, leaf_idx, level, hash, seq, slot_updated
             FROM nodes WHERE tree = ?1 AND node_idx = ?2",
            params![tree.as_slice(), node_idx as i64],
            row_to_node,
        )
        .optional()?;
    Ok(node)
}

const ASSET_COLUMNS: &str =
    "id, tree, leaf_idx, leaf_hash, owner, delegate, burnt, leaf_seq, seq, slot_updated";

fn row_to_asset(row: &Row) -> rusqlite::Result<AssetRecord> {
    Ok(AssetRecord {
        id: blob_array(row, 0, "id")?,
        tree: blob_array(row, 1, "tree")?,
        leaf_idx: row.get::<_, i64>(2)? as u64,
        leaf_hash: opt_blob_array(row, 3, "leaf_hash")?,
        owner: opt_blob_array(row, 4, "owner")?,
        delegate: opt_blob_array(row, 5, "delegate")?,
        burnt: row.get::<_, i64>(6)? != 0,
        leaf_seq: row.get::<_, i64>(7)? as u64,
        seq: row.get::<_, i64>(8)? as u64,
        slot_updated: row.get::<_, i64>(9)? as u64,
    })
}

pub fn get_asset(conn: &Connection, id: &[u8; 32]) -> ReplicaResult<Option<AssetRecord>> {
    let sql = format!("SELECT {} FROM assets WHERE id = ?1", ASSET_COLUMNS);
    let asset = conn
        .query_row(&sql, params![id.as_slice()], row_to_asset)
        .optional()?;
    Ok(asset)
}

pub fn assets_by_owner(conn: &Connection, owner: &Pubkey, limit: u32) -> ReplicaResult<Vec<AssetRecord>> {
    let sql = format!(
        "SELECT {} FROM assets WHERE owner = ?1 ORDER BY tree, leaf_idx LIMIT ?2",
        ASSET_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let assets = stmt
        .query_map(params![owner.as_slice(), limit as i64], row_to_asset)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(assets)
}

pub fn assets_by_tree(conn: &Connection, tree: &TreeId, limit: u32) -> ReplicaResult<Vec<AssetRecord>> {
    let sql = format!(
        "SELECT {} FROM assets WHERE tree = ?1 ORDER BY leaf_idx LIMIT ?2",
        ASSET_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let assets = stmt
        .query_map(params![tree.as_slice(), limit as i64], row_to_asset)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(assets)
}

pub fn assets_by_group(
    conn: &Connection,
    key: &str,
    value: &str,
    limit: u32,
) -> ReplicaResult<Vec<AssetRecord>> {
    let sql = format!(
        "SELECT {} FROM assets WHERE id IN
            (SELECT asset_id FROM asset_grouping WHERE group_key = ?1 AND group_value = ?2)
         ORDER BY tree, leaf_idx LIMIT ?3",
        ASSET_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let assets = stmt
        .query_map(params![key, value, limit as i64], row_to_asset)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(assets)
}

pub fn assets_by_creator(conn: &Connection, creator: &Pubkey, limit: u32) -> ReplicaResult<Vec<AssetRecord>> {
    let sql = format!(
        "SELECT {} FROM assets WHERE id IN
            (SELECT asset_id FROM asset_creators WHERE creator = ?1)
         ORDER BY tree, leaf_idx LIMIT ?2",
        ASSET_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let assets = stmt
        .query_map(params![creator.as_slice(), limit as i64], row_to_asset)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(assets)
}

pub fn get_asset_data(conn: &Connection, id: &[u8; 32]) -> ReplicaResult<Option<AssetDataRecord>> {
    let record = conn
        .query_row(
            "SELECT id, discriminator, raw, parsed, seq, slot_updated FROM asset_data WHERE id = ?1",
            params![id.as_slice()],
            |row| {
                Ok(AssetDataRecord {
                    id: blob_array(row, 0, "id")?,
                    discriminator: opt_blob_array(row, 1, "discriminator")?,
                    raw: row.get(2)?,
                    parsed: opt_json(row, 3, "parsed")?,
                    seq: row.get::<_, i64>(4)? as u64,
                    slot_updated: row.get::<_, i64>(5)? as u64,
                })
            },
        )
        .optional()?;
    Ok(record)
}

pub fn get_grouping(conn: &Connection, asset_id: &[u8; 32]) -> ReplicaResult<Vec<GroupingRecord>> {
    let mut stmt = conn.prepare(
        "SELECT asset_id, group_key, group_value, seq FROM asset_grouping
         WHERE asset_id = ?1 ORDER BY group_key",
    )?;
    let records = stmt
        .query_map(params![asset_id.as_slice()], |row| {
            Ok(GroupingRecord {
                asset_id: blob_array(row, 0, "asset_id")?,
                key: row.get(1)?,
                value: row.get(2)?,
                seq: row.get::<_, i64>(3)? as u64,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

pub fn get_authority(conn: &Connection, asset_id: &[u8; 32]) -> ReplicaResult<Option<AuthorityRecord>> {
    let record = conn
        .query_row(
            "SELECT asset_id, authority, seq FROM asset_authority WHERE asset_id = ?1",
            params![asset_id.as_slice()],
            |row| {
                Ok(AuthorityRecord {
                    asset_id: blob_array(row, 0, "asset_id")?,
                    authority: blob_array(row, 1, "authority")?,
                    seq: row.get::<_, i64>(2)? as u64,
                })
            },
        )
        .optional()?;
    Ok(record)
}

pub fn get_creators(conn: &Connection, asset_id: &[u8; 32]) -> ReplicaResult<Vec<CreatorRecord>> {
    let mut stmt = conn.prepare(
        "SELECT asset_id, position, creator, share, verified, seq FROM asset_creators
         WHERE asset_id = ?1 ORDER BY position",
    )?;
    let records = stmt
        .query_map(params![asset_id.as_slice()], |row| {
            Ok(CreatorRecord {
                asset_id: blob_array(row, 0, "asset_id")?,
                position: row.get::<_, i64>(1)? as u32,
                creator: blob_array(row, 2, "creator")?,
                share: row.get::<_, i64>(3)? as u8,
                verified: row.get::<_, i64>(4)? != 0,
                seq: row.get::<_, i64>(5)? as u64,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

pub fn get_compressed_data(
    conn: &Connection,
    tree: &TreeId,
    leaf_idx: u64,
) -> ReplicaResult<Option<CompressedDataRecord>> {
    let record = conn
        .query_row(
            "SELECT id, tree, leaf_idx, discriminator, raw, parsed, schema_validated, empty, seq, slot_updated
             FROM compressed_data WHERE tree = ?1 AND leaf_idx = ?2",
            params![tree.as_slice(), leaf_idx as i64],
            |row| {
                Ok(CompressedDataRecord {
                    id: blob_array(row, 0, "id")?,
                    tree: blob_array(row, 1, "tree")?,
                    leaf_idx: row.get::<_, i64>(2)? as u64,
                    discriminator: opt_blob_array(row, 3, "discriminator")?,
                    raw: row.get(4)?,
                    parsed: opt_json(row, 5, "parsed")?,
                    schema_validated: row.get::<_, i64>(6)? != 0,
                    empty: row.get::<_, i64>(7)? != 0,
                    seq: row.get::<_, i64>(8)? as u64,
                    slot_updated: row.get::<_, i64>(9)? as u64,
                })
            },
        )
        .optional()?;
    Ok(record)
}
