// File: src/backfill/sweep.rs

//! Periodic consistency sweep
//!
//! Re-discovers holes in every tree's revision log, compares the log tail
//! with the canonical head, and wakes workers so items past their retry
//! cooldown are picked up again.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::consistency::SyncEvent;
use crate::error::ReplicaResult;
use crate::storage::backfill::{self, NewBackfillItem};
use crate::storage::{revisions, trees, SqliteStore};
use crate::telemetry::{self, GapSource};
use crate::traits::ChainFetcher;
use crate::types::{tree_label, CanonicalTreeHead, GapRange, TreeId, TreeSyncRecord};

use super::config::BackfillConfig;
use super::notifier::BackfillNotifier;

/// Counters for one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub trees: usize,
    pub gaps_found: usize,
    pub enqueued: usize,
    pub tail_gaps: usize,
    pub audits_requested: usize,
    pub fetch_failures: usize,
}

pub struct BackfillSweep {
    store: Arc<SqliteStore>,
    fetcher: Option<Arc<dyn ChainFetcher>>,
    notifier: BackfillNotifier,
    config: BackfillConfig,
}

impl BackfillSweep {
    pub fn new(
        store: Arc<SqliteStore>,
        fetcher: Option<Arc<dyn ChainFetcher>>,
        notifier: BackfillNotifier,
        config: BackfillConfig,
    ) -> Self {
        Self {
            store,
            fetcher,
            notifier,
            config,
        }
    }

    /// One pass over every tree that is not halted
    pub async fn sweep_once(&self) -> ReplicaResult<SweepReport> {
        let store = Arc::clone(&self.store);
        let records = tokio::task::spawn_blocking(move || store.read(trees::list_sync)).await??;

        let mut report = SweepReport::default();
        for sync in records.into_iter().filter(|s| !s.status.is_halted()) {
            report.trees += 1;

            let (found, queued) = self.queue_interior_gaps(sync.tree).await?;
            report.gaps_found += found;
            report.enqueued += queued;
            telemetry::gaps_queued(GapSource::Sweep, queued);

            if let Some(fetcher) = &self.fetcher {
                match fetcher.fetch_tree_head(&sync.tree).await {
                    Ok(head) => self.check_head(&sync, head, &mut report).await?,
                    Err(e) => {
                        report.fetch_failures += 1;
                        telemetry::fetch_failed("sweep_head", e.is_transient());
                        warn!(
                            tree = %tree_label(&sync.tree),
                            source = fetcher.source_id(),
                            error = %e,
                            "Tree head unavailable during sweep"
                        );
                    }
                }
            }
        }

        // also re-surfaces items whose retry cooldown has passed
        self.notifier.notify();
        debug!(
            trees = report.trees,
            gaps_found = report.gaps_found,
            enqueued = report.enqueued,
            tail_gaps = report.tail_gaps,
            audits = report.audits_requested,
            "Sweep complete"
        );
        Ok(report)
    }

    /// Queue a forced consistency check for `tree`. Returns false if one is
    /// already open.
    pub async fn request_audit(&self, tree: TreeId) -> ReplicaResult<bool> {
        let store = Arc::clone(&self.store);
        let queued = tokio::task::spawn_blocking(move || {
            store.write(|tx| {
                let sync = trees::load_or_init_sync(tx, &tree)?;
                let item = NewBackfillItem {
                    tree,
                    seq: sync.max_seen_seq,
                    until_seq: None,
                    slot: 0,
                    force_chk: true,
                };
                let queued = backfill::enqueue(tx, &item)?.is_some();
                if queued {
                    trees::apply_event(tx, &tree, SyncEvent::Enqueued)?;
                }
                Ok(queued)
            })
        })
        .await??;

        if queued {
            info!(tree = %tree_label(&tree), "Consistency audit requested");
            self.notifier.notify();
        }
        Ok(queued)
    }

    /// Queue every hole in the log not already covered by an open item
    async fn queue_interior_gaps(&self, tree: TreeId) -> ReplicaResult<(usize, usize)> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            store.write(|tx| {
                let gaps = revisions::interior_gaps(tx, &tree)?;
                if gaps.is_empty() {
                    return Ok((0, 0));
                }
                let open: Vec<_> = backfill::list_for_tree(tx, &tree)?
                    .into_iter()
                    .filter(|i| !i.backfilled && !i.force_chk)
                    .collect();

                let mut queued = 0;
                for gap in &gaps {
                    let covered = open
                        .iter()
                        .any(|i| i.seq <= gap.start_seq && i.end_seq() >= gap.end_seq);
                    if covered {
                        continue;
                    }
                    if backfill::enqueue(tx, &gap_item(gap, 0))?.is_some() {
                        queued += 1;
                    }
                }
                if queued > 0 {
                    trees::apply_event(tx, &tree, SyncEvent::GapObserved)?;
                    trees::apply_event(tx, &tree, SyncEvent::Enqueued)?;
                }
                Ok((gaps.len(), queued))
            })
        })
        .await?
    }

    /// Compare the replica with the canonical head: queue the missing tail
    /// and, when auditing roots, a forced check on mismatch
    async fn check_head(
        &self,
        sync: &TreeSyncRecord,
        head: CanonicalTreeHead,
        report: &mut SweepReport,
    ) -> ReplicaResult<()> {
        let store = Arc::clone(&self.store);
        let sync = sync.clone();
        let audit_roots = self.config.sweep.audit_roots;

        let (tail, audit) = tokio::task::spawn_blocking(move || {
            store.write(|tx| {
                let tree = sync.tree;
                let mut tail = false;
                if head.seq > sync.max_seen_seq {
                    let gap = GapRange {
                        tree,
                        start_seq: sync.max_seen_seq + 1,
                        end_seq: head.seq,
                    };
                    if backfill::enqueue(tx, &gap_item(&gap, head.slot))?.is_some() {
                        trees::apply_event(tx, &tree, SyncEvent::GapObserved)?;
                        trees::apply_event(tx, &tree, SyncEvent::Enqueued)?;
                        tail = true;
                    }
                }

                let mut audit = false;
                if audit_roots && head.seq > 0 && sync.last_contiguous_seq >= head.seq {
                    let logged = revisions::node_at_seq(tx, &tree, 1, head.seq)?;
                    if logged.map(|r| r.hash) != Some(head.root) {
                        let item = NewBackfillItem {
                            tree,
                            seq: head.seq,
                            until_seq: None,
                            slot: head.slot,
                            force_chk: true,
                        };
                        if backfill::enqueue(tx, &item)?.is_some() {
                            trees::apply_event(tx, &tree, SyncEvent::RootMismatch)?;
                            trees::apply_event(tx, &tree, SyncEvent::Enqueued)?;
                            audit = true;
                        }
                    }
                }
                Ok((tail, audit))
            })
        })
        .await??;

        if tail {
            report.tail_gaps += 1;
            report.enqueued += 1;
            telemetry::gaps_queued(GapSource::Tail, 1);
            info!(
                tree = %tree_label(&head.tree),
                canonical_seq = head.seq,
                "Replica behind canonical head, tail queued"
            );
        }
        if audit {
            report.audits_requested += 1;
            report.enqueued += 1;
            warn!(tree = %tree_label(&head.tree), seq = head.seq, "Root differs from canonical head");
        }
        Ok(())
    }

    /// Sweep every `interval_secs` until shutdown
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.config.sweep.interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.sweep.interval_secs,
            audit_roots = self.config.sweep.audit_roots,
            "Backfill sweep started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "Sweep failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Backfill sweep shutting down");
                    break;
                }
            }
        }
    }
}

fn gap_item(gap: &GapRange, slot: u64) -> NewBackfillItem {
    NewBackfillItem {
        tree: gap.tree,
        seq: gap.start_seq,
        until_seq: Some(gap.end_seq),
        slot,
        force_chk: false,
    }
}
