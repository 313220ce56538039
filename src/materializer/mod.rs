// File: src/materializer/mod.rs

//! Tree materializer
//!
//! Folds accepted revisions into the current-state projections: node hashes,
//! assets with their side tables, and the generic compressed data table.
//! Every write is guarded by the target row's watermark, and leaf data is
//! rebuilt from the leaf changelog, so replays in any order converge on the
//! state of the highest seq.

pub mod decoder;
pub mod schema;
pub mod shape;

pub use decoder::{AssetLeafDecoder, DecoderRegistry, JsonLeafDecoder, ASSET_LEAF_V1, JSON_LEAF};
pub use schema::{FieldKind, SchemaDescriptor};
pub use shape::{empty_node, hash_children, MerkleProof, TreeShape};

use rusqlite::Connection;
use serde_json::Value;
use std::collections::BTreeSet;

use crate::consistency::Admission;
use crate::error::ReplicaResult;
use crate::storage::{changelog, projections, revisions, trees};
use crate::storage::projections::{CompressedDataWrite, OwnershipWrite};
use crate::traits::{AssetUpdate, DecodedLeaf};
use crate::types::{leaf_asset_id, tree_label, LeafChange, LeafPayload, NodeWrite, TreeId, TreeUpdate};

/// Outcome counters for a projection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectionStats {
    /// Rows written
    pub applied: usize,
    /// Writes skipped by a newer watermark
    pub stale: usize,
}

impl ProjectionStats {
    fn record(&mut self, admission: Admission) {
        match admission {
            Admission::Apply => self.applied += 1,
            Admission::Stale => self.stale += 1,
        }
    }

    pub fn merge(&mut self, other: ProjectionStats) {
        self.applied += other.applied;
        self.stale += other.stale;
    }
}

/// Projects revisions into the materialized tables
#[derive(Debug, Clone)]
pub struct TreeMaterializer {
    registry: DecoderRegistry,
}

impl Default for TreeMaterializer {
    fn default() -> Self {
        Self::new(DecoderRegistry::with_defaults())
    }
}

impl TreeMaterializer {
    pub fn new(registry: DecoderRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &DecoderRegistry {
        &self.registry
    }

    /// Project one update. Node writes land as delivered; the leaf's data is
    /// rebuilt from its logged changes with seq at or below `visible_through`.
    pub fn project_update(
        &self,
        conn: &Connection,
        update: &TreeUpdate,
        slot: u64,
        visible_through: u64,
    ) -> ReplicaResult<ProjectionStats> {
        let mut stats = ProjectionStats::default();
        for node in &update.nodes {
            stats.record(self.apply_node(conn, &update.tree, node, update.seq, slot)?);
        }
        if let (Some(leaf_idx), Some(_)) = (update.leaf_idx, &update.payload) {
            stats.record(self.fold_leaf(conn, &update.tree, leaf_idx, visible_through)?);
        }
        Ok(stats)
    }

    /// Replay logged revisions with seq in `[from_seq, to_seq]` in seq order,
    /// then rebuild every leaf changed in that range through `to_seq`
    pub fn project_range(
        &self,
        conn: &Connection,
        tree: &TreeId,
        from_seq: u64,
        to_seq: u64,
    ) -> ReplicaResult<ProjectionStats> {
        let mut stats = ProjectionStats::default();
        if to_seq < from_seq {
            return Ok(stats);
        }

        for rev in revisions::revisions_in_range(conn, tree, from_seq, to_seq)? {
            let node = NodeWrite {
                node_idx: rev.node_idx,
                leaf_idx: rev.leaf_idx,
                level: rev.level,
                hash: rev.hash,
            };
            stats.record(self.apply_node(conn, tree, &node, rev.seq, rev.slot)?);
        }

        let leaves: BTreeSet<u64> = changelog::changes_in_range(conn, tree, from_seq, to_seq)?
            .into_iter()
            .map(|c| c.leaf_idx)
            .collect();
        for leaf_idx in leaves {
            stats.record(self.fold_leaf(conn, tree, leaf_idx, to_seq)?);
        }

        tracing::debug!(
            tree = %tree_label(tree),
            from_seq,
            to_seq,
            applied = stats.applied,
            stale = stats.stale,
            "Replayed revisions into projections"
        );
        Ok(stats)
    }

    fn apply_node(
        &self,
        conn: &Connection,
        tree: &TreeId,
        node: &NodeWrite,
        seq: u64,
        slot: u64,
    ) -> ReplicaResult<Admission> {
        let admission = projections::upsert_node(conn, tree, node, seq, slot)?;
        if let Some(leaf_idx) = node.leaf_idx {
            let id = leaf_asset_id(tree, leaf_idx);
            projections::upsert_asset_leaf(conn, &id, tree, leaf_idx, &node.hash, seq, slot)?;
        }
        Ok(admission)
    }

    /// Rebuild a leaf's data from its changelog: the latest full write or
    /// clear at or below `through`, then every later patch in seq order. The
    /// row takes the seq of the newest folded change, so the result does not
    /// depend on the order changes were delivered in.
    pub fn fold_leaf(
        &self,
        conn: &Connection,
        tree: &TreeId,
        leaf_idx: u64,
        through: u64,
    ) -> ReplicaResult<Admission> {
        let history: Vec<LeafChange> = changelog::leaf_history(conn, tree, leaf_idx)?
            .into_iter()
            .take_while(|c| c.seq <= through)
            .collect();
        let Some(newest) = history.last() else {
            return Ok(Admission::Stale);
        };
        let (seq, slot) = (newest.seq, newest.slot);

        let mut patches = Vec::new();
        let mut base = None;
        for change in history.iter().rev() {
            match &change.payload {
                LeafPayload::Patch { key, value } => patches.push((key.as_str(), value)),
                LeafPayload::Full {
                    discriminator,
                    data,
                } => {
                    base = Some((change, Some((discriminator, data.as_slice()))));
                    break;
                }
                LeafPayload::Empty => {
                    base = Some((change, None));
                    break;
                }
            }
        }
        patches.reverse();

        let Some((base, full)) = base else {
            tracing::warn!(tree = %tree_label(tree), leaf_idx, seq, "Patch for leaf with no data");
            return Ok(Admission::Stale);
        };
        let id = leaf_asset_id(tree, leaf_idx);

        let Some((discriminator, data)) = full else {
            if !patches.is_empty() {
                tracing::warn!(tree = %tree_label(tree), leaf_idx, seq, "Patch for cleared leaf");
            }
            let admission = projections::upsert_compressed_data(
                conn,
                CompressedDataWrite {
                    id: &id,
                    tree,
                    leaf_idx,
                    discriminator: None,
                    raw: None,
                    parsed: None,
                    schema_validated: false,
                    empty: true,
                    seq,
                    slot,
                },
            )?;
            self.apply_cleared(conn, &id, tree, leaf_idx, &history, base)?;
            return Ok(admission);
        };

        let decoded: Option<DecodedLeaf> = match self.registry.decode(discriminator, data) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::warn!(
                    tree = %tree_label(tree),
                    leaf_idx,
                    seq = base.seq,
                    error = %e,
                    "Leaf payload not decodable, storing raw"
                );
                None
            }
        };
        let parsed = apply_patches(
            tree,
            leaf_idx,
            decoded.as_ref().map(|d| d.parsed.clone()),
            &patches,
        );
        let schema_validated = self.validate(conn, tree, leaf_idx, parsed.as_ref())?;

        let admission = projections::upsert_compressed_data(
            conn,
            CompressedDataWrite {
                id: &id,
                tree,
                leaf_idx,
                discriminator: Some(discriminator),
                raw: Some(data),
                parsed: parsed.as_ref(),
                schema_validated,
                empty: false,
                seq,
                slot,
            },
        )?;

        if let Some(decoded) = &decoded {
            if let Some(asset) = &decoded.asset {
                projections::upsert_asset_data(
                    conn,
                    &id,
                    discriminator,
                    data,
                    Some(&decoded.parsed),
                    base.seq,
                    base.slot,
                )?;
                self.apply_asset(conn, &id, tree, leaf_idx, asset, base.seq, base.slot)?;
            }
        }
        Ok(admission)
    }

    /// Burn the asset at the clear's seq. The last Full before the clear
    /// still supplies the owner and asset details, whichever arrived first.
    fn apply_cleared(
        &self,
        conn: &Connection,
        id: &[u8; 32],
        tree: &TreeId,
        leaf_idx: u64,
        history: &[LeafChange],
        cleared: &LeafChange,
    ) -> ReplicaResult<()> {
        let prior = history
            .iter()
            .rev()
            .filter(|c| c.seq < cleared.seq)
            .find_map(|c| match &c.payload {
                LeafPayload::Full {
                    discriminator,
                    data,
                } => Some((c, discriminator, data.as_slice())),
                _ => None,
            })
            .and_then(|(c, discriminator, data)| {
                let decoded = self.registry.decode(discriminator, data).ok()?;
                Some((c, discriminator, data, decoded))
            });

        let Some((prior, discriminator, data, decoded)) = prior else {
            projections::mark_asset_burnt(conn, id, cleared.seq, cleared.slot)?;
            return Ok(());
        };
        let Some(asset) = &decoded.asset else {
            projections::mark_asset_burnt(conn, id, cleared.seq, cleared.slot)?;
            return Ok(());
        };

        projections::upsert_asset_data(
            conn,
            id,
            discriminator,
            data,
            Some(&decoded.parsed),
            prior.seq,
            prior.slot,
        )?;
        projections::upsert_asset_ownership(
            conn,
            OwnershipWrite {
                asset_id: id,
                tree,
                leaf_idx,
                owner: asset.owner.as_ref(),
                delegate: asset.delegate.as_ref(),
                burnt: true,
                seq: cleared.seq,
                slot: cleared.slot,
            },
        )?;
        self.apply_asset_details(conn, id, asset, prior.seq, prior.slot)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_asset(
        &self,
        conn: &Connection,
        id: &[u8; 32],
        tree: &TreeId,
        leaf_idx: u64,
        asset: &AssetUpdate,
        seq: u64,
        slot: u64,
    ) -> ReplicaResult<()> {
        projections::upsert_asset_ownership(
            conn,
            OwnershipWrite {
                asset_id: id,
                tree,
                leaf_idx,
                owner: asset.owner.as_ref(),
                delegate: asset.delegate.as_ref(),
                burnt: asset.burnt,
                seq,
                slot,
            },
        )?;
        self.apply_asset_details(conn, id, asset, seq, slot)
    }

    fn apply_asset_details(
        &self,
        conn: &Connection,
        id: &[u8; 32],
        asset: &AssetUpdate,
        seq: u64,
        slot: u64,
    ) -> ReplicaResult<()> {
        if let Some(authority) = &asset.authority {
            projections::upsert_authority(conn, id, authority, seq, slot)?;
        }
        for (key, value) in &asset.grouping {
            projections::upsert_grouping(conn, id, key, value, seq, slot)?;
        }
        if let Some(creators) = &asset.creators {
            projections::replace_creators(conn, id, creators, seq, slot)?;
        }
        Ok(())
    }

    /// Whether parsed data satisfies the tree's registered schema. Trees
    /// without a schema never validate.
    fn validate(
        &self,
        conn: &Connection,
        tree: &TreeId,
        leaf_idx: u64,
        parsed: Option<&Value>,
    ) -> ReplicaResult<bool> {
        let Some(parsed) = parsed else {
            return Ok(false);
        };
        let Some(schema) = trees::get_tree(conn, tree)?.and_then(|t| t.schema) else {
            return Ok(false);
        };
        match schema.validate(parsed) {
            Ok(()) => Ok(true),
            Err(reason) => {
                tracing::warn!(
                    tree = %tree_label(tree),
                    leaf_idx,
                    reason = %reason,
                    "Leaf data does not match tree schema"
                );
                Ok(false)
            }
        }
    }
}

/// Single-key updates on top of decoded object data. Patches on data that is
/// not an object have nothing to apply to.
fn apply_patches(
    tree: &TreeId,
    leaf_idx: u64,
    parsed: Option<Value>,
    patches: &[(&str, &Value)],
) -> Option<Value> {
    if patches.is_empty() {
        return parsed;
    }
    match parsed {
        Some(Value::Object(mut object)) => {
            for (key, value) in patches {
                object.insert((*key).to_string(), (*value).clone());
            }
            Some(Value::Object(object))
        }
        other => {
            tracing::warn!(
                tree = %tree_label(tree),
                leaf_idx,
                patches = patches.len(),
                "Patch target has no parsed object"
            );
            other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::projections::AssetRecord;
    use crate::storage::SqliteStore;
    use crate::types::{LeafChange, TreeMetadata};
    use serde_json::json;

    const TREE: TreeId = [2u8; 32];

    fn store() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        store
    }

    fn leaf_update(seq: u64, leaf_idx: u64, hash: u8, payload: Option<LeafPayload>) -> TreeUpdate {
        TreeUpdate {
            tree: TREE,
            seq,
            leaf_idx: Some(leaf_idx),
            nodes: vec![
                NodeWrite {
                    node_idx: 4 + leaf_idx,
                    leaf_idx: Some(leaf_idx),
                    level: 0,
                    hash: [hash; 32],
                },
                NodeWrite {
                    node_idx: 1,
                    leaf_idx: None,
                    level: 2,
                    hash: [hash + 100; 32],
                },
            ],
            payload,
        }
    }

    /// Log the update's payload the way ingestion does, then project it
    fn project(
        m: &TreeMaterializer,
        conn: &Connection,
        update: &TreeUpdate,
        slot: u64,
    ) -> ReplicaResult<ProjectionStats> {
        if let (Some(leaf_idx), Some(payload)) = (update.leaf_idx, &update.payload) {
            changelog::insert(
                conn,
                &LeafChange {
                    tree: update.tree,
                    leaf_idx,
                    seq: update.seq,
                    slot,
                    payload: payload.clone(),
                },
            )?;
        }
        m.project_update(conn, update, slot, u64::MAX)
    }

    fn patch(key: &str, value: serde_json::Value) -> LeafPayload {
        LeafPayload::Patch {
            key: key.into(),
            value,
        }
    }

    fn json_payload(value: serde_json::Value) -> LeafPayload {
        LeafPayload::Full {
            discriminator: JSON_LEAF,
            data: value.to_string().into_bytes(),
        }
    }

    #[test]
    fn test_out_of_order_projection_converges() {
        let store = store();
        let m = TreeMaterializer::default();
        store
            .write(|tx| {
                project(&m, tx, &leaf_update(2, 0, 2, None), 20)?;
                let stats = project(&m, tx, &leaf_update(1, 0, 1, None), 10)?;
                assert_eq!(stats.stale, 2);
                Ok(())
            })
            .unwrap();

        let root = store
            .read(|c| projections::get_node(c, &TREE, 1))
            .unwrap()
            .unwrap();
        assert_eq!(root.hash, [102u8; 32]);
        assert_eq!(root.seq, 2);

        let asset = store
            .read(|c| projections::get_asset(c, &leaf_asset_id(&TREE, 0)))
            .unwrap()
            .unwrap();
        assert_eq!(asset.leaf_hash, Some([2u8; 32]));
    }

    #[test]
    fn test_undecodable_payload_stored_raw() {
        let store = store();
        let m = TreeMaterializer::default();
        let payload = LeafPayload::Full {
            discriminator: *b"unknown!",
            data: vec![1, 2, 3],
        };
        store
            .write(|tx| project(&m, tx, &leaf_update(1, 0, 1, Some(payload)), 10))
            .unwrap();

        let row = store
            .read(|c| projections::get_compressed_data(c, &TREE, 0))
            .unwrap()
            .unwrap();
        assert_eq!(row.raw, Some(vec![1, 2, 3]));
        assert!(row.parsed.is_none());
        assert!(!row.schema_validated);
    }

    #[test]
    fn test_schema_validation_flag() {
        let store = store();
        let m = TreeMaterializer::default();
        store
            .write(|tx| {
                trees::upsert_tree(
                    tx,
                    &TreeMetadata {
                        id: TREE,
                        discriminator: JSON_LEAF,
                        program: None,
                        schema: Some(SchemaDescriptor::new().require("name", FieldKind::String)),
                        max_depth: 2,
                        canopy_depth: 0,
                    },
                )
            })
            .unwrap();

        store
            .write(|tx| {
                project(&m, tx, &leaf_update(1, 0, 1, Some(json_payload(json!({"name": "a"})))), 1)?;
                project(&m, tx, &leaf_update(2, 1, 1, Some(json_payload(json!({"size": 3})))), 2)
            })
            .unwrap();

        let valid = store
            .read(|c| projections::get_compressed_data(c, &TREE, 0))
            .unwrap()
            .unwrap();
        let invalid = store
            .read(|c| projections::get_compressed_data(c, &TREE, 1))
            .unwrap()
            .unwrap();
        assert!(valid.schema_validated);
        assert!(!invalid.schema_validated);
        assert_eq!(invalid.parsed, Some(json!({"size": 3})));
    }

    #[test]
    fn test_patch_and_tombstone() {
        let store = store();
        let m = TreeMaterializer::default();
        store
            .write(|tx| {
                project(&m, tx, &leaf_update(1, 0, 1, Some(json_payload(json!({"name": "a"})))), 1)?;
                project(&m, tx, &leaf_update(2, 0, 2, Some(patch("name", json!("b")))), 2)
            })
            .unwrap();
        let row = store
            .read(|c| projections::get_compressed_data(c, &TREE, 0))
            .unwrap()
            .unwrap();
        assert_eq!(row.parsed, Some(json!({"name": "b"})));
        assert_eq!(row.raw.as_deref(), Some(json!({"name": "a"}).to_string().as_bytes()));

        store
            .write(|tx| project(&m, tx, &leaf_update(3, 0, 0, Some(LeafPayload::Empty)), 3))
            .unwrap();
        let row = store
            .read(|c| projections::get_compressed_data(c, &TREE, 0))
            .unwrap()
            .unwrap();
        assert!(row.empty);
        assert_eq!(row.seq, 3);
    }

    #[test]
    fn test_asset_projection_and_side_tables() {
        let store = store();
        let m = TreeMaterializer::default();
        let data = json!({
            "owner": hex::encode([7u8; 32]),
            "authority": hex::encode([8u8; 32]),
            "collection": hex::encode([9u8; 32]),
            "creators": [{"address": hex::encode([5u8; 32]), "share": 100}]
        });
        let payload = LeafPayload::Full {
            discriminator: ASSET_LEAF_V1,
            data: data.to_string().into_bytes(),
        };
        store
            .write(|tx| project(&m, tx, &leaf_update(1, 1, 1, Some(payload)), 5))
            .unwrap();

        let id = leaf_asset_id(&TREE, 1);
        store
            .read(|c| {
                let asset = projections::get_asset(c, &id)?.unwrap();
                assert_eq!(asset.owner, Some([7u8; 32]));
                assert_eq!(projections::get_authority(c, &id)?.unwrap().authority, [8u8; 32]);
                assert_eq!(projections::get_grouping(c, &id)?.len(), 1);
                assert_eq!(projections::get_creators(c, &id)?.len(), 1);
                assert!(projections::get_asset_data(c, &id)?.unwrap().parsed.is_some());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_project_range_rebuilds_changed_leaves() {
        let store = store();
        let m = TreeMaterializer::default();
        store
            .write(|tx| {
                for seq in 1..=3u64 {
                    let update = leaf_update(seq, 0, seq as u8, None);
                    for node in &update.nodes {
                        revisions::append(
                            tx,
                            revisions::AppendParams {
                                tree: &TREE,
                                node,
                                seq,
                                slot: seq,
                                signature: "s",
                            },
                        )?;
                    }
                    changelog::insert(
                        tx,
                        &LeafChange {
                            tree: TREE,
                            leaf_idx: 0,
                            seq,
                            slot: seq,
                            payload: json_payload(json!({ "seq": seq })),
                        },
                    )?;
                }
                let stats = m.project_range(tx, &TREE, 1, 3)?;
                // six node writes, one rebuilt leaf
                assert_eq!(stats.applied, 7);
                Ok(())
            })
            .unwrap();

        let row = store
            .read(|c| projections::get_compressed_data(c, &TREE, 0))
            .unwrap()
            .unwrap();
        assert_eq!(row.parsed, Some(json!({"seq": 3})));
        let root = store
            .read(|c| projections::get_node(c, &TREE, 1))
            .unwrap()
            .unwrap();
        assert_eq!(root.seq, 3);
    }

    fn asset_after_clear(order: &[u64]) -> AssetRecord {
        let store = store();
        let m = TreeMaterializer::default();
        let minted = LeafPayload::Full {
            discriminator: ASSET_LEAF_V1,
            data: json!({
                "owner": hex::encode([7u8; 32]),
                "authority": hex::encode([8u8; 32]),
            })
            .to_string()
            .into_bytes(),
        };
        let payloads = [minted, LeafPayload::Empty];
        store
            .write(|tx| {
                for &seq in order {
                    let payload = payloads[seq as usize - 1].clone();
                    project(&m, tx, &leaf_update(seq, 0, seq as u8, Some(payload)), seq * 10)?;
                }
                Ok(())
            })
            .unwrap();

        let id = leaf_asset_id(&TREE, 0);
        store
            .read(|c| {
                assert_eq!(projections::get_authority(c, &id)?.unwrap().seq, 1);
                assert_eq!(projections::get_asset_data(c, &id)?.unwrap().seq, 1);
                Ok(projections::get_asset(c, &id)?.unwrap())
            })
            .unwrap()
    }

    #[test]
    fn test_clear_keeps_last_owner_in_any_order() {
        let in_order = asset_after_clear(&[1, 2]);
        assert!(in_order.burnt);
        assert_eq!(in_order.owner, Some([7u8; 32]));
        assert_eq!(in_order.seq, 2);
        assert_eq!(asset_after_clear(&[2, 1]), in_order);
    }

    fn parsed_after(order: &[u64]) -> Option<serde_json::Value> {
        let store = store();
        let m = TreeMaterializer::default();
        let payloads = [
            json_payload(json!({"x": 0})),
            patch("a", json!(1)),
            patch("b", json!(2)),
        ];
        store
            .write(|tx| {
                for &seq in order {
                    let payload = payloads[seq as usize - 1].clone();
                    project(&m, tx, &leaf_update(seq, 0, seq as u8, Some(payload)), seq)?;
                }
                Ok(())
            })
            .unwrap();
        store
            .read(|c| projections::get_compressed_data(c, &TREE, 0))
            .unwrap()
            .and_then(|row| row.parsed)
    }

    #[test]
    fn test_patches_fold_in_seq_order_regardless_of_delivery() {
        let expected = Some(json!({"x": 0, "a": 1, "b": 2}));
        for order in [[1, 2, 3], [1, 3, 2], [3, 2, 1], [2, 3, 1], [3, 1, 2]] {
            assert_eq!(parsed_after(&order), expected, "delivery order {:?}", order);
        }
    }

    #[test]
    fn test_fold_respects_visibility_bound() {
        let store = store();
        let m = TreeMaterializer::default();
        store
            .write(|tx| {
                project(&m, tx, &leaf_update(1, 0, 1, Some(json_payload(json!({"x": 0})))), 1)?;
                changelog::insert(
                    tx,
                    &LeafChange {
                        tree: TREE,
                        leaf_idx: 0,
                        seq: 3,
                        slot: 3,
                        payload: patch("held", json!(true)),
                    },
                )?;
                m.fold_leaf(tx, &TREE, 0, 2)
            })
            .unwrap();

        let row = store
            .read(|c| projections::get_compressed_data(c, &TREE, 0))
            .unwrap()
            .unwrap();
        assert_eq!(row.parsed, Some(json!({"x": 0})));
        assert_eq!(row.seq, 1);
    }
}
