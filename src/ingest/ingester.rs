// File: src/ingest/ingester.rs

//! Single-transaction ingestion pipeline
//!
//! raw event dedupe → revision log append → gap check → gate → projections,
//! all inside one `BEGIN IMMEDIATE` transaction so that `processed`, the log,
//! the queue and the projections commit together.

use rusqlite::Connection;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::backfill::BackfillNotifier;
use crate::consistency::{detect_gap, ConsistencyGate, ProjectionPolicy, SyncEvent};
use crate::error::{ReplicaError, ReplicaResult};
use crate::materializer::{ProjectionStats, TreeMaterializer, TreeShape};
use crate::storage::backfill::{self, NewBackfillItem};
use crate::storage::{changelog, raw_events, revisions, trees, SqliteStore};
use crate::telemetry::{self, GapSource};
use crate::types::{
    tree_label, AppendOutcome, ChainTransaction, GapRange, LeafChange, RecordOutcome, TreeId,
    TreeMetadata, TreeSyncRecord, TreeUpdate,
};

/// Whether a transaction did any work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    Applied,
    /// Signature was processed before; nothing changed
    Duplicate,
}

/// Result of ingesting one chain transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub signature: String,
    pub status: IngestStatus,

    /// Node revisions newly logged
    pub accepted: usize,

    /// Node revisions already in the log
    pub rejected: usize,

    /// Projection rows written
    pub projected: usize,

    /// Projection writes skipped by a newer watermark
    pub stale: usize,

    /// Node writes logged but held back until a gap closes
    pub deferred: usize,

    /// Gaps opened by this transaction
    pub gaps: Vec<GapRange>,

    /// Backfill items queued
    pub enqueued: usize,
}

impl IngestOutcome {
    fn new(signature: &str, status: IngestStatus) -> Self {
        Self {
            signature: signature.to_string(),
            status,
            accepted: 0,
            rejected: 0,
            projected: 0,
            stale: 0,
            deferred: 0,
            gaps: Vec::new(),
            enqueued: 0,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.status == IngestStatus::Duplicate
    }

    fn add_projection(&mut self, stats: ProjectionStats) {
        self.projected += stats.applied;
        self.stale += stats.stale;
    }
}

/// Applies chain transactions to the replica
pub struct Ingester {
    store: Arc<SqliteStore>,
    materializer: TreeMaterializer,
    gate: ConsistencyGate,
    notifier: BackfillNotifier,
}

impl Ingester {
    pub fn new(
        store: Arc<SqliteStore>,
        materializer: TreeMaterializer,
        policy: ProjectionPolicy,
        notifier: BackfillNotifier,
    ) -> Self {
        Self {
            store,
            materializer,
            gate: ConsistencyGate::new(policy),
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn policy(&self) -> ProjectionPolicy {
        self.gate.policy()
    }

    pub fn notifier(&self) -> &BackfillNotifier {
        &self.notifier
    }

    /// Register or update tree configuration
    pub fn register_tree(&self, tree: &TreeMetadata) -> ReplicaResult<()> {
        TreeShape::new(tree.max_depth)?;
        self.store.write(|tx| trees::upsert_tree(tx, tree))?;
        tracing::info!(
            tree = %tree_label(&tree.id),
            max_depth = tree.max_depth,
            canopy_depth = tree.canopy_depth,
            "Tree registered"
        );
        Ok(())
    }

    /// Clear a halted tree so ingestion and its queued backfill resume
    pub fn reset_tree(&self, tree: &TreeId) -> ReplicaResult<()> {
        self.store.write(|tx| trees::reset(tx, tree))?;
        tracing::warn!(tree = %tree_label(tree), "Halted tree reset by operator");
        self.notifier.notify();
        Ok(())
    }

    /// Ingest one chain transaction. Idempotent per signature.
    pub fn ingest(&self, txn: &ChainTransaction) -> ReplicaResult<IngestOutcome> {
        txn.validate().map_err(ReplicaError::InvalidEvent)?;

        let outcome = match self.store.write(|tx| self.ingest_in(tx, txn)) {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_fatal() && !matches!(e, ReplicaError::TreeHalted { .. }) {
                    self.halt_trees(txn, &e);
                }
                return Err(e);
            }
        };

        telemetry::transaction_ingested(outcome.is_duplicate());
        telemetry::gaps_queued(GapSource::Ingest, outcome.enqueued);
        if outcome.enqueued > 0 {
            self.notifier.notify();
        }
        if outcome.is_duplicate() {
            tracing::debug!(signature = %txn.signature, "Duplicate delivery ignored");
        } else {
            tracing::debug!(
                signature = %txn.signature,
                slot = txn.slot,
                accepted = outcome.accepted,
                projected = outcome.projected,
                deferred = outcome.deferred,
                gaps = outcome.gaps.len(),
                "Transaction ingested"
            );
        }
        Ok(outcome)
    }

    /// Halt every tree a refused transaction touched. Runs after the
    /// transaction's own write rolled back.
    fn halt_trees(&self, txn: &ChainTransaction, error: &ReplicaError) {
        let affected: BTreeSet<TreeId> = txn.updates.iter().map(|u| u.tree).collect();
        let reason = error.to_string();
        let halted = self.store.write(|tx| {
            for tree in &affected {
                trees::halt(tx, tree, &reason)?;
            }
            Ok(())
        });
        match halted {
            Ok(()) => {
                for tree in &affected {
                    telemetry::tree_halted("ledger_inconsistency");
                    tracing::error!(
                        tree = %tree_label(tree),
                        signature = %txn.signature,
                        code = error.error_code(),
                        reason = %reason,
                        "Tree halted"
                    );
                }
            }
            Err(e) => tracing::error!(
                signature = %txn.signature,
                error = %e,
                "Failed to halt trees after ledger inconsistency"
            ),
        }
    }

    /// Rebuild a tree's projections from its log up to the contiguous
    /// frontier
    pub fn reproject(&self, tree: &TreeId) -> ReplicaResult<ProjectionStats> {
        self.store.write(|tx| {
            let sync = trees::load_sync(tx, tree)?
                .ok_or_else(|| ReplicaError::TreeNotFound(tree_label(tree)))?;
            self.materializer
                .project_range(tx, tree, 1, sync.last_contiguous_seq)
        })
    }

    fn ingest_in(&self, conn: &Connection, txn: &ChainTransaction) -> ReplicaResult<IngestOutcome> {
        if raw_events::record(conn, &txn.signature, txn.slot)? == RecordOutcome::AlreadyProcessed {
            return Ok(IngestOutcome::new(&txn.signature, IngestStatus::Duplicate));
        }

        let mut outcome = IngestOutcome::new(&txn.signature, IngestStatus::Applied);
        for update in &txn.updates {
            self.apply_update(conn, txn, update, &mut outcome)?;
        }
        raw_events::mark_processed(conn, &txn.signature)?;
        Ok(outcome)
    }

    fn apply_update(
        &self,
        conn: &Connection,
        txn: &ChainTransaction,
        update: &TreeUpdate,
        outcome: &mut IngestOutcome,
    ) -> ReplicaResult<()> {
        let tree = &update.tree;
        let mut sync = trees::load_or_init_sync(conn, tree)?;
        if sync.status.is_halted() {
            return Err(ReplicaError::TreeHalted {
                tree: tree_label(tree),
                reason: sync.halted_reason.unwrap_or_default(),
            });
        }
        check_shape(conn, update)?;

        for node in &update.nodes {
            let appended = revisions::append(
                conn,
                revisions::AppendParams {
                    tree,
                    node,
                    seq: update.seq,
                    slot: txn.slot,
                    signature: &txn.signature,
                },
            )?;
            match appended {
                AppendOutcome::Accepted => outcome.accepted += 1,
                AppendOutcome::Rejected(_) => outcome.rejected += 1,
            }
        }
        if let (Some(leaf_idx), Some(payload)) = (update.leaf_idx, &update.payload) {
            changelog::insert(
                conn,
                &LeafChange {
                    tree: *tree,
                    leaf_idx,
                    seq: update.seq,
                    slot: txn.slot,
                    payload: payload.clone(),
                },
            )?;
        }

        let first_sighting =
            revisions::record_seq(conn, tree, update.seq, &txn.signature, txn.slot)?;
        if first_sighting {
            if let Some(gap) =
                detect_gap(*tree, sync.last_contiguous_seq, sync.max_seen_seq, update.seq)
            {
                self.open_gap(conn, &mut sync, gap, txn.slot, outcome)?;
            }
            sync.max_seen_seq = sync.max_seen_seq.max(update.seq);
        }

        let old_frontier = sync.last_contiguous_seq;
        let new_frontier = revisions::advance_frontier(conn, tree, old_frontier)?;

        let released = self.gate.releases(update.seq, old_frontier);
        if released {
            let visible = self.gate.visible_through(old_frontier);
            let stats = self
                .materializer
                .project_update(conn, update, txn.slot, visible)?;
            outcome.add_projection(stats);
        }
        if self.gate.drains_on_advance() && new_frontier > old_frontier {
            let stats = self
                .materializer
                .project_range(conn, tree, old_frontier + 1, new_frontier)?;
            outcome.add_projection(stats);
        }
        if !released && update.seq > new_frontier {
            outcome.deferred += update.nodes.len();
        }

        if new_frontier > update.seq {
            tracing::debug!(
                tree = %tree_label(tree),
                from = old_frontier,
                to = new_frontier,
                "Contiguous frontier advanced"
            );
        }
        sync.last_contiguous_seq = new_frontier;
        trees::save_sync(conn, &sync)
    }

    fn open_gap(
        &self,
        conn: &Connection,
        sync: &mut TreeSyncRecord,
        gap: GapRange,
        slot: u64,
        outcome: &mut IngestOutcome,
    ) -> ReplicaResult<()> {
        tracing::info!(
            tree = %tree_label(&gap.tree),
            start_seq = gap.start_seq,
            end_seq = gap.end_seq,
            missing = gap.len(),
            "Sequence gap detected"
        );
        advance_status(sync, SyncEvent::GapObserved);

        let queued = backfill::enqueue(
            conn,
            &NewBackfillItem {
                tree: gap.tree,
                seq: gap.start_seq,
                until_seq: Some(gap.end_seq),
                slot,
                force_chk: false,
            },
        )?;
        if queued.is_some() {
            outcome.enqueued += 1;
            advance_status(sync, SyncEvent::Enqueued);
        }
        outcome.gaps.push(gap);
        Ok(())
    }
}

/// Apply a state machine event in memory, keeping the state on rejection
pub(crate) fn advance_status(sync: &mut TreeSyncRecord, event: SyncEvent) {
    match sync.status.transition(event) {
        Ok(next) => sync.status = next,
        Err(e) => tracing::debug!(tree = %tree_label(&sync.tree), error = %e, "Ignoring sync event"),
    }
}

/// Reject node or leaf indexes that cannot exist in a registered tree
fn check_shape(conn: &Connection, update: &TreeUpdate) -> ReplicaResult<()> {
    let Some(meta) = trees::get_tree(conn, &update.tree)? else {
        return Ok(());
    };
    let shape = TreeShape::new(meta.max_depth)?;
    if let Some(leaf_idx) = update.leaf_idx {
        shape.leaf_node_idx(leaf_idx)?;
    }
    for node in &update.nodes {
        if shape.level_of(node.node_idx).is_none() {
            return Err(ReplicaError::InvalidEvent(format!(
                "node {} outside tree {} of depth {}",
                node.node_idx,
                tree_label(&update.tree),
                meta.max_depth
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consistency::TreeSyncStatus;
    use crate::storage::projections;
    use crate::types::NodeWrite;

    const TREE: TreeId = [1u8; 32];

    fn ingester(policy: ProjectionPolicy) -> Ingester {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        Ingester::new(
            Arc::new(store),
            TreeMaterializer::default(),
            policy,
            BackfillNotifier::new(),
        )
    }

    fn root_txn(seq: u64) -> ChainTransaction {
        ChainTransaction::single(
            format!("sig-{}", seq),
            seq * 10,
            TreeUpdate {
                tree: TREE,
                seq,
                leaf_idx: None,
                nodes: vec![NodeWrite {
                    node_idx: 1,
                    leaf_idx: None,
                    level: 3,
                    hash: [seq as u8; 32],
                }],
                payload: None,
            },
        )
    }

    fn root_seq(ing: &Ingester) -> Option<u64> {
        ing.store()
            .read(|c| projections::get_node(c, &TREE, 1))
            .unwrap()
            .map(|n| n.seq)
    }

    #[test]
    fn test_redelivery_is_noop() {
        let ing = ingester(ProjectionPolicy::Deferred);
        let first = ing.ingest(&root_txn(1)).unwrap();
        assert_eq!(first.status, IngestStatus::Applied);
        assert_eq!(first.accepted, 1);

        let again = ing.ingest(&root_txn(1)).unwrap();
        assert!(again.is_duplicate());
        assert_eq!(again.accepted, 0);
        assert_eq!(ing.store().stats().unwrap().revision_count, 1);
    }

    #[test]
    fn test_gap_queues_single_range_item() {
        let ing = ingester(ProjectionPolicy::Deferred);
        for seq in [1, 2, 3] {
            ing.ingest(&root_txn(seq)).unwrap();
        }
        let outcome = ing.ingest(&root_txn(7)).unwrap();
        assert_eq!(outcome.gaps.len(), 1);
        assert_eq!((outcome.gaps[0].start_seq, outcome.gaps[0].end_seq), (4, 6));
        assert_eq!(outcome.enqueued, 1);

        // 5 arriving late is inside the reported range
        let late = ing.ingest(&root_txn(5)).unwrap();
        assert!(late.gaps.is_empty());

        let items = ing
            .store()
            .read(|c| backfill::list_for_tree(c, &TREE))
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!((items[0].seq, items[0].until_seq), (4, Some(6)));

        let sync = ing.store().read(|c| trees::load_sync(c, &TREE)).unwrap().unwrap();
        assert_eq!(sync.status, TreeSyncStatus::BackfillRequested);
        assert_eq!(sync.last_contiguous_seq, 3);
        assert_eq!(sync.max_seen_seq, 7);
    }

    #[test]
    fn test_deferred_policy_holds_until_gap_closes() {
        let ing = ingester(ProjectionPolicy::Deferred);
        ing.ingest(&root_txn(1)).unwrap();
        let held = ing.ingest(&root_txn(3)).unwrap();
        assert_eq!(held.deferred, 1);
        assert_eq!(root_seq(&ing), Some(1));

        let closing = ing.ingest(&root_txn(2)).unwrap();
        assert_eq!(closing.deferred, 0);
        assert_eq!(root_seq(&ing), Some(3));
        let sync = ing.store().read(|c| trees::load_sync(c, &TREE)).unwrap().unwrap();
        assert_eq!(sync.last_contiguous_seq, 3);
    }

    #[test]
    fn test_optimistic_policy_projects_immediately() {
        let ing = ingester(ProjectionPolicy::Optimistic);
        ing.ingest(&root_txn(1)).unwrap();
        let outcome = ing.ingest(&root_txn(3)).unwrap();
        assert_eq!(outcome.deferred, 0);
        assert_eq!(root_seq(&ing), Some(3));

        let late = ing.ingest(&root_txn(2)).unwrap();
        assert_eq!(late.stale, 1);
        assert_eq!(root_seq(&ing), Some(3));
    }

    #[test]
    fn test_halted_tree_refuses_updates() {
        let ing = ingester(ProjectionPolicy::Deferred);
        ing.ingest(&root_txn(1)).unwrap();
        ing.store().write(|tx| trees::halt(tx, &TREE, "root mismatch")).unwrap();

        let err = ing.ingest(&root_txn(2)).unwrap_err();
        assert!(matches!(err, ReplicaError::TreeHalted { .. }));
        // nothing from the refused transaction was kept
        assert!(ing
            .store()
            .read(|c| raw_events::get(c, "sig-2"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_ledger_inconsistency_halts_tree() {
        let ing = ingester(ProjectionPolicy::Deferred);
        ing.ingest(&root_txn(1)).unwrap();

        // sig-1 landed at slot 10; a second sighting at slot 20 contradicts it
        let conflicting = ChainTransaction::single("sig-1", 20, root_txn(2).updates[0].clone());
        let err = ing.ingest(&conflicting).unwrap_err();
        assert!(matches!(err, ReplicaError::LedgerInconsistency(_)));

        let sync = ing.store().read(|c| trees::load_sync(c, &TREE)).unwrap().unwrap();
        assert_eq!(sync.status, TreeSyncStatus::Halted);
        assert!(sync.halted_reason.unwrap().contains("sig-1"));

        let refused = ing.ingest(&root_txn(2)).unwrap_err();
        assert!(matches!(refused, ReplicaError::TreeHalted { .. }));
        assert_eq!(root_seq(&ing), Some(1));

        ing.reset_tree(&TREE).unwrap();
        ing.ingest(&root_txn(2)).unwrap();
        assert_eq!(root_seq(&ing), Some(2));
    }

    #[test]
    fn test_shape_checked_for_registered_tree() {
        let ing = ingester(ProjectionPolicy::Deferred);
        ing.register_tree(&TreeMetadata {
            id: TREE,
            discriminator: *b"jsonleaf",
            program: None,
            schema: None,
            max_depth: 1,
            canopy_depth: 0,
        })
        .unwrap();

        let mut txn = root_txn(1);
        txn.updates[0].nodes[0].node_idx = 9;
        assert!(matches!(ing.ingest(&txn), Err(ReplicaError::InvalidEvent(_))));
    }

    #[tokio::test]
    async fn test_gap_notifies_workers() {
        let ing = ingester(ProjectionPolicy::Deferred);
        let mut signal = ing.notifier().subscribe();
        ing.ingest(&root_txn(1)).unwrap();
        ing.ingest(&root_txn(4)).unwrap();
        assert!(signal.has_changed());
        assert!(signal.notified().await);
    }
}
