//! Assertions on replica state

use tree_replica::storage::projections::{
    AssetDataRecord, AssetRecord, AuthorityRecord, CompressedDataRecord, CreatorRecord,
    GroupingRecord,
};
use tree_replica::storage::{backfill, projections, revisions, trees};
use tree_replica::types::{leaf_asset_id, BackfillItem, NodeHash, TreeId, TreeSyncRecord};
use tree_replica::{ReplicaResult, SqliteStore, TreeSyncStatus};

use super::fixtures::MockChain;

/// Projected root, if any
pub fn projected_root(store: &SqliteStore, tree: &TreeId) -> Option<NodeHash> {
    store
        .read(|c| projections::get_node(c, tree, 1))
        .expect("Failed to read root")
        .map(|n| n.hash)
}

pub fn sync_record(store: &SqliteStore, tree: &TreeId) -> TreeSyncRecord {
    store
        .read(|c| trees::load_sync(c, tree))
        .expect("Failed to load sync record")
        .expect("Tree has no sync record")
}

pub fn items(store: &SqliteStore, tree: &TreeId) -> Vec<BackfillItem> {
    store
        .read(|c| backfill::list_for_tree(c, tree))
        .expect("Failed to list backfill items")
}

pub fn open_items(store: &SqliteStore, tree: &TreeId) -> Vec<BackfillItem> {
    items(store, tree).into_iter().filter(|i| !i.backfilled).collect()
}

pub fn revision_count(store: &SqliteStore, tree: &TreeId) -> u64 {
    store
        .read(|c| revisions::count_revisions(c, tree))
        .expect("Failed to count revisions")
}

/// Assert the projected root equals the chain's root after `seq`
pub fn assert_root_at(store: &SqliteStore, chain: &MockChain, seq: u64) {
    let root = projected_root(store, &chain.tree());
    assert_eq!(
        root,
        Some(chain.root_at(seq)),
        "projected root should match canonical root at seq {}",
        seq
    );
}

/// Assert every seq up to the chain head is logged and the tree is in sync
pub fn assert_converged(store: &SqliteStore, chain: &MockChain) {
    let sync = sync_record(store, &chain.tree());
    assert_eq!(sync.last_contiguous_seq, chain.seq(), "frontier should reach head");
    assert_eq!(sync.max_seen_seq, chain.seq());
    assert_eq!(sync.status, TreeSyncStatus::InSync);
    assert!(open_items(store, &chain.tree()).is_empty(), "no open backfill items");
    assert_root_at(store, chain, chain.seq());
}

/// Every projected row derived from one leaf
#[derive(Debug, PartialEq)]
pub struct LeafProjection {
    pub compressed: Option<CompressedDataRecord>,
    pub asset: Option<AssetRecord>,
    pub data: Option<AssetDataRecord>,
    pub grouping: Vec<GroupingRecord>,
    pub authority: Option<AuthorityRecord>,
    pub creators: Vec<CreatorRecord>,
}

/// Projection rows for leaves `0..leaves`, for comparing replicas
pub fn leaf_projections(store: &SqliteStore, tree: &TreeId, leaves: u64) -> Vec<LeafProjection> {
    store
        .read(|c| {
            (0..leaves)
                .map(|leaf_idx| {
                    let id = leaf_asset_id(tree, leaf_idx);
                    Ok(LeafProjection {
                        compressed: projections::get_compressed_data(c, tree, leaf_idx)?,
                        asset: projections::get_asset(c, &id)?,
                        data: projections::get_asset_data(c, &id)?,
                        grouping: projections::get_grouping(c, &id)?,
                        authority: projections::get_authority(c, &id)?,
                        creators: projections::get_creators(c, &id)?,
                    })
                })
                .collect::<ReplicaResult<Vec<_>>>()
        })
        .expect("Failed to read projections")
}
