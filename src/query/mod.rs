// File: src/query/mod.rs

//! Read-only access to projections and the revision log
//!
//! Nothing here writes. Results may lag the chain while a gap is open;
//! every view carries the tree's `last_confirmed_seq` so callers can tell.

use rusqlite::Connection;
use serde::Serialize;
use std::sync::Arc;

use crate::error::{ReplicaError, ReplicaResult};
use crate::materializer::{empty_node, MerkleProof, TreeShape};
use crate::storage::projections::{
    self, AssetDataRecord, AssetRecord, AuthorityRecord, CompressedDataRecord, CreatorRecord,
    CurrentNode, GroupingRecord,
};
use crate::storage::{backfill, changelog, revisions, trees, SqliteStore};
use crate::types::{
    tree_label, BackfillItem, LeafChange, NodeHash, NodeRevision, Pubkey, TreeId, TreeMetadata,
};

/// An asset with all of its side records
#[derive(Debug, Clone, PartialEq)]
pub struct AssetView {
    pub asset: AssetRecord,
    pub data: Option<AssetDataRecord>,
    pub grouping: Vec<GroupingRecord>,
    pub authority: Option<AuthorityRecord>,
    pub creators: Vec<CreatorRecord>,
    /// Highest seq of the asset's tree known to be complete
    pub last_confirmed_seq: u64,
}

/// Per-tree consistency summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeStatusView {
    #[serde(with = "hex::serde")]
    pub tree: TreeId,
    pub status: String,
    pub last_confirmed_seq: u64,
    pub max_seen_seq: u64,
    pub open_backfill_items: u64,
    pub root_mismatches: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted_reason: Option<String>,
    /// Current materialized root, hex
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

#[derive(Clone)]
pub struct ReplicaReader {
    store: Arc<SqliteStore>,
}

impl ReplicaReader {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    // ========== Assets ==========

    pub fn get_asset(&self, id: &[u8; 32]) -> ReplicaResult<Option<AssetView>> {
        self.store.read(|c| {
            let Some(asset) = projections::get_asset(c, id)? else {
                return Ok(None);
            };
            let last_confirmed_seq = confirmed_seq(c, &asset.tree)?;
            Ok(Some(AssetView {
                data: projections::get_asset_data(c, id)?,
                grouping: projections::get_grouping(c, id)?,
                authority: projections::get_authority(c, id)?,
                creators: projections::get_creators(c, id)?,
                asset,
                last_confirmed_seq,
            }))
        })
    }

    pub fn assets_by_owner(&self, owner: &Pubkey, limit: u32) -> ReplicaResult<Vec<AssetRecord>> {
        self.store.read(|c| projections::assets_by_owner(c, owner, limit))
    }

    pub fn assets_by_tree(&self, tree: &TreeId, limit: u32) -> ReplicaResult<Vec<AssetRecord>> {
        self.store.read(|c| projections::assets_by_tree(c, tree, limit))
    }

    pub fn assets_by_group(&self, key: &str, value: &str, limit: u32) -> ReplicaResult<Vec<AssetRecord>> {
        self.store.read(|c| projections::assets_by_group(c, key, value, limit))
    }

    pub fn assets_by_creator(&self, creator: &Pubkey, limit: u32) -> ReplicaResult<Vec<AssetRecord>> {
        self.store.read(|c| projections::assets_by_creator(c, creator, limit))
    }

    pub fn compressed_data(
        &self,
        tree: &TreeId,
        leaf_idx: u64,
    ) -> ReplicaResult<Option<CompressedDataRecord>> {
        self.store.read(|c| projections::get_compressed_data(c, tree, leaf_idx))
    }

    /// Every payload change of one leaf, oldest first
    pub fn leaf_history(&self, tree: &TreeId, leaf_idx: u64) -> ReplicaResult<Vec<LeafChange>> {
        self.store.read(|c| changelog::leaf_history(c, tree, leaf_idx))
    }

    // ========== Nodes ==========

    pub fn current_node(&self, tree: &TreeId, node_idx: u64) -> ReplicaResult<Option<CurrentNode>> {
        self.store.read(|c| projections::get_node(c, tree, node_idx))
    }

    /// Materialized root hash
    pub fn root(&self, tree: &TreeId) -> ReplicaResult<Option<NodeHash>> {
        Ok(self.current_node(tree, 1)?.map(|n| n.hash))
    }

    pub fn node_history(&self, tree: &TreeId, node_idx: u64) -> ReplicaResult<Vec<NodeRevision>> {
        self.store.read(|c| revisions::node_history(c, tree, node_idx))
    }

    /// Node as of revision `seq`
    pub fn node_at(&self, tree: &TreeId, node_idx: u64, seq: u64) -> ReplicaResult<Option<NodeRevision>> {
        self.store.read(|c| revisions::node_at_seq(c, tree, node_idx, seq))
    }

    /// Inclusion proof against the current materialized tree. Nodes never
    /// written are empty subtrees.
    pub fn proof(&self, tree: &TreeId, leaf_idx: u64) -> ReplicaResult<MerkleProof> {
        self.store.read(|c| {
            build_proof(c, tree, leaf_idx, |c, node_idx| {
                Ok(projections::get_node(c, tree, node_idx)?.map(|n| n.hash))
            })
        })
    }

    /// Inclusion proof as of revision `seq`, rebuilt from the log
    pub fn proof_at(&self, tree: &TreeId, leaf_idx: u64, seq: u64) -> ReplicaResult<MerkleProof> {
        self.store.read(|c| {
            build_proof(c, tree, leaf_idx, |c, node_idx| {
                Ok(revisions::node_at_seq(c, tree, node_idx, seq)?.map(|r| r.hash))
            })
        })
    }

    // ========== Trees ==========

    pub fn tree(&self, tree: &TreeId) -> ReplicaResult<Option<TreeMetadata>> {
        self.store.read(|c| trees::get_tree(c, tree))
    }

    pub fn tree_status(&self, tree: &TreeId) -> ReplicaResult<Option<TreeStatusView>> {
        self.store.read(|c| {
            let Some(sync) = trees::load_sync(c, tree)? else {
                return Ok(None);
            };
            status_view(c, sync).map(Some)
        })
    }

    pub fn tree_statuses(&self) -> ReplicaResult<Vec<TreeStatusView>> {
        self.store.read(|c| {
            trees::list_sync(c)?
                .into_iter()
                .map(|sync| status_view(c, sync))
                .collect()
        })
    }

    pub fn backfill_items(&self, tree: &TreeId) -> ReplicaResult<Vec<BackfillItem>> {
        self.store.read(|c| backfill::list_for_tree(c, tree))
    }
}

fn confirmed_seq(conn: &Connection, tree: &TreeId) -> ReplicaResult<u64> {
    Ok(trees::load_sync(conn, tree)?
        .map(|s| s.last_contiguous_seq)
        .unwrap_or(0))
}

fn status_view(conn: &Connection, sync: crate::types::TreeSyncRecord) -> ReplicaResult<TreeStatusView> {
    let root = projections::get_node(conn, &sync.tree, 1)?.map(|n| hex::encode(n.hash));
    Ok(TreeStatusView {
        open_backfill_items: backfill::count_open(conn, &sync.tree, None)?,
        tree: sync.tree,
        status: sync.status.to_string(),
        last_confirmed_seq: sync.last_contiguous_seq,
        max_seen_seq: sync.max_seen_seq,
        root_mismatches: sync.root_mismatches,
        halted_reason: sync.halted_reason,
        root,
    })
}

fn build_proof<F>(conn: &Connection, tree: &TreeId, leaf_idx: u64, lookup: F) -> ReplicaResult<MerkleProof>
where
    F: Fn(&Connection, u64) -> ReplicaResult<Option<NodeHash>>,
{
    let meta = trees::get_tree(conn, tree)?
        .ok_or_else(|| ReplicaError::TreeNotFound(tree_label(tree)))?;
    let shape = TreeShape::new(meta.max_depth)?;

    let hash_at = |node_idx: u64| -> ReplicaResult<NodeHash> {
        let level = shape.level_of(node_idx).unwrap_or(0);
        Ok(lookup(conn, node_idx)?.unwrap_or_else(|| empty_node(level)))
    };

    let node_idx = shape.leaf_node_idx(leaf_idx)?;
    let proof = shape
        .proof_node_indexes(leaf_idx)?
        .into_iter()
        .map(&hash_at)
        .collect::<ReplicaResult<Vec<_>>>()?;

    Ok(MerkleProof {
        leaf_idx,
        node_idx,
        leaf: hash_at(node_idx)?,
        proof,
        root: hash_at(1)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::materializer::hash_children;
    use crate::storage::projections::upsert_node;
    use crate::storage::revisions::{append, record_seq, AppendParams};
    use crate::types::NodeWrite;

    const TREE: TreeId = [8u8; 32];

    fn reader() -> ReplicaReader {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        store
            .write(|tx| {
                trees::upsert_tree(
                    tx,
                    &TreeMetadata {
                        id: TREE,
                        discriminator: *b"jsonleaf",
                        program: None,
                        schema: None,
                        max_depth: 2,
                        canopy_depth: 0,
                    },
                )
            })
            .unwrap();
        ReplicaReader::new(Arc::new(store))
    }

    /// Write leaf 2 of a depth-2 tree with its full path at `seq`
    fn set_leaf(reader: &ReplicaReader, leaf: NodeHash, seq: u64) -> NodeHash {
        let parent = hash_children(&leaf, &[0u8; 32]);
        let root = hash_children(&empty_node(1), &parent);
        let writes = [
            NodeWrite { node_idx: 6, leaf_idx: Some(2), level: 0, hash: leaf },
            NodeWrite { node_idx: 3, leaf_idx: None, level: 1, hash: parent },
            NodeWrite { node_idx: 1, leaf_idx: None, level: 2, hash: root },
        ];
        reader
            .store
            .write(|tx| {
                for node in &writes {
                    append(
                        tx,
                        AppendParams { tree: &TREE, node, seq, slot: seq, signature: "sig" },
                    )?;
                    upsert_node(tx, &TREE, node, seq, seq)?;
                }
                record_seq(tx, &TREE, seq, "sig", seq)?;
                Ok(())
            })
            .unwrap();
        root
    }

    #[test]
    fn test_proof_uses_empty_siblings() {
        let reader = reader();
        let root = set_leaf(&reader, [9u8; 32], 1);

        let proof = reader.proof(&TREE, 2).unwrap();
        assert_eq!(proof.node_idx, 6);
        assert_eq!(proof.leaf, [9u8; 32]);
        assert_eq!(proof.proof, vec![[0u8; 32], empty_node(1)]);
        assert_eq!(proof.root, root);
        assert!(proof.verify());
    }

    #[test]
    fn test_historical_proof() {
        let reader = reader();
        let first_root = set_leaf(&reader, [1u8; 32], 1);
        let second_root = set_leaf(&reader, [2u8; 32], 2);
        assert_ne!(first_root, second_root);

        let then = reader.proof_at(&TREE, 2, 1).unwrap();
        assert_eq!(then.root, first_root);
        assert!(then.verify());
        assert_eq!(reader.root(&TREE).unwrap(), Some(second_root));
        assert_eq!(reader.node_history(&TREE, 1).unwrap().len(), 2);
        assert_eq!(reader.node_at(&TREE, 6, 1).unwrap().unwrap().hash, [1u8; 32]);
    }

    #[test]
    fn test_proof_requires_registered_tree() {
        let reader = reader();
        assert!(matches!(
            reader.proof(&[0u8; 32], 0),
            Err(ReplicaError::TreeNotFound(_))
        ));
        assert!(matches!(
            reader.proof(&TREE, 4),
            Err(ReplicaError::LeafIndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_unknown_tree_status() {
        let reader = reader();
        assert!(reader.tree_status(&TREE).unwrap().is_none());
        assert!(reader.tree_statuses().unwrap().is_empty());
        assert!(reader.get_asset(&[1u8; 32]).unwrap().is_none());
    }
}
