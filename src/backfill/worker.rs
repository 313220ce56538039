// File: src/backfill/worker.rs

//! Backfill worker: claim, reconcile, settle

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::consistency::SyncEvent;
use crate::error::{ReplicaError, ReplicaResult};
use crate::storage::backfill::{self, NewBackfillItem};
use crate::storage::sqlite::now_nanos;
use crate::storage::{revisions, trees, SqliteStore};
use crate::telemetry::{self, GapSource};
use crate::types::{tree_label, BackfillItem, ClaimedItem, TreeLease};

use super::config::BackfillConfig;
use super::notifier::BackfillNotifier;
use super::reconcile::{ReconcileOutcome, Reconciler};

/// What one `step` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing claimable
    Idle,
    Worked {
        item_id: i64,
        outcome: ReconcileOutcome,
    },
    /// Another worker took the tree over mid-reconciliation
    LeaseLost { item_id: i64 },
}

/// One member of the worker pool
pub struct BackfillWorker {
    id: String,
    store: Arc<SqliteStore>,
    reconciler: Arc<Reconciler>,
    notifier: BackfillNotifier,
    config: BackfillConfig,
}

impl BackfillWorker {
    pub fn new(
        id: impl Into<String>,
        store: Arc<SqliteStore>,
        reconciler: Arc<Reconciler>,
        notifier: BackfillNotifier,
        config: BackfillConfig,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            reconciler,
            notifier,
            config,
        }
    }

    /// Worker with a random holder id, unique across processes
    pub fn with_random_id(
        store: Arc<SqliteStore>,
        reconciler: Arc<Reconciler>,
        notifier: BackfillNotifier,
        config: BackfillConfig,
    ) -> Self {
        Self::new(
            format!("worker-{}", Uuid::new_v4()),
            store,
            reconciler,
            notifier,
            config,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim the next eligible item, taking its tree lease
    pub async fn claim_next(&self) -> ReplicaResult<Option<ClaimedItem>> {
        let store = Arc::clone(&self.store);
        let holder = self.id.clone();
        let lease_ms = self.config.lease_ms;

        tokio::task::spawn_blocking(move || {
            store.write(|tx| {
                let claimed = backfill::claim_next(tx, &holder, lease_ms, now_nanos())?;
                if let Some(c) = &claimed {
                    trees::apply_event(tx, &c.item.tree, SyncEvent::Claimed)?;
                }
                Ok(claimed)
            })
        })
        .await?
    }

    /// Claim and work at most one item
    pub async fn step(&self) -> ReplicaResult<StepOutcome> {
        let Some(ClaimedItem {
            item,
            mut lease,
            reclaimed,
        }) = self.claim_next().await?
        else {
            return Ok(StepOutcome::Idle);
        };

        info!(
            worker = %self.id,
            tree = %tree_label(&item.tree),
            item_id = item.id,
            seq = item.seq,
            until_seq = item.end_seq(),
            force_chk = item.force_chk,
            attempts = item.attempts,
            reclaimed,
            "Backfill item claimed"
        );

        let outcome = match self.reconciler.reconcile(&item, &mut lease).await {
            Ok(outcome) => outcome,
            Err(ReplicaError::LeaseExpired { item_id }) => {
                warn!(worker = %self.id, item_id, "Lease lost during reconciliation");
                telemetry::lease_lost();
                return Ok(StepOutcome::LeaseLost { item_id });
            }
            Err(e) if e.is_fatal() => ReconcileOutcome::Fatal {
                reason: e.to_string(),
            },
            Err(e) => ReconcileOutcome::Retry {
                reason: e.to_string(),
            },
        };

        match self.settle(&item, &lease, &outcome).await {
            Ok(()) => {}
            Err(ReplicaError::LeaseExpired { item_id }) => {
                warn!(worker = %self.id, item_id, "Lease lost before settling item");
                telemetry::lease_lost();
                return Ok(StepOutcome::LeaseLost { item_id });
            }
            Err(e) => return Err(e),
        }

        match &outcome {
            ReconcileOutcome::Closed { replayed } => {
                telemetry::backfill_item("closed");
                info!(
                    worker = %self.id,
                    item_id = item.id,
                    replayed,
                    "Backfill item closed"
                )
            }
            ReconcileOutcome::Retry { reason } => {
                telemetry::backfill_item("retry");
                warn!(
                    worker = %self.id,
                    item_id = item.id,
                    retry_in_secs = self.config.retry_cooldown_secs,
                    reason = %reason,
                    "Backfill item left open"
                )
            }
            ReconcileOutcome::Fatal { reason } => {
                telemetry::backfill_item("fatal");
                telemetry::tree_halted("backfill");
                error!(
                    worker = %self.id,
                    tree = %tree_label(&item.tree),
                    item_id = item.id,
                    reason = %reason,
                    "Tree halted"
                )
            }
        }

        Ok(StepOutcome::Worked {
            item_id: item.id,
            outcome,
        })
    }

    /// Record the outcome and drop the lease in one transaction
    async fn settle(
        &self,
        item: &BackfillItem,
        lease: &TreeLease,
        outcome: &ReconcileOutcome,
    ) -> ReplicaResult<()> {
        let store = Arc::clone(&self.store);
        let lease = lease.clone();
        let outcome = outcome.clone();
        let tree = item.tree;
        let slot = item.slot;
        let retry_at = now_nanos() + (self.config.retry_cooldown_secs as i64) * 1_000_000_000;

        let reopened = tokio::task::spawn_blocking(move || {
            store.write(|tx| match &outcome {
                ReconcileOutcome::Closed { .. } => {
                    backfill::complete(tx, &lease)?;
                    let sync = trees::load_or_init_sync(tx, &tree)?;
                    if backfill::count_open(tx, &tree, None)? > 0 {
                        trees::apply_event(tx, &tree, SyncEvent::Released)?;
                        return Ok(0);
                    }
                    if sync.is_caught_up() {
                        trees::apply_event(tx, &tree, SyncEvent::Confirmed)?;
                        return Ok(0);
                    }

                    // a deeper gap with no item covering it
                    let mut queued = 0;
                    for gap in revisions::interior_gaps(tx, &tree)? {
                        if gap.end_seq <= sync.last_contiguous_seq {
                            continue;
                        }
                        let new_item = NewBackfillItem {
                            tree,
                            seq: gap.start_seq,
                            until_seq: Some(gap.end_seq),
                            slot,
                            force_chk: false,
                        };
                        if backfill::enqueue(tx, &new_item)?.is_some() {
                            queued += 1;
                        }
                    }
                    trees::apply_event(tx, &tree, SyncEvent::GapObserved)?;
                    if queued > 0 {
                        trees::apply_event(tx, &tree, SyncEvent::Enqueued)?;
                    }
                    Ok(queued)
                }
                ReconcileOutcome::Retry { reason } => {
                    backfill::release(tx, &lease, reason, Some(retry_at))?;
                    trees::apply_event(tx, &tree, SyncEvent::Released)?;
                    Ok(0)
                }
                ReconcileOutcome::Fatal { reason } => {
                    backfill::release(tx, &lease, reason, None)?;
                    trees::halt(tx, &tree, reason)?;
                    Ok(0)
                }
            })
        })
        .await??;

        telemetry::gaps_queued(GapSource::Settle, reopened);
        if reopened > 0 {
            debug!(tree = %tree_label(&tree), queued = reopened, "Deeper gap queued");
            self.notifier.notify();
        }
        Ok(())
    }

    /// Work the queue until shutdown, sleeping on the notification channel
    /// when it is empty
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            worker = %self.id,
            lease_ms = self.config.lease_ms,
            poll_interval_ms = self.config.poll_interval_ms,
            "Backfill worker started"
        );

        let mut signal = self.notifier.subscribe();
        let mut signal_open = true;
        let mut poll = interval(Duration::from_millis(self.config.poll_interval_ms));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // drain while items close; failures wait for the next wake-up
            loop {
                match shutdown.try_recv() {
                    Ok(()) | Err(TryRecvError::Closed) => {
                        info!(worker = %self.id, "Backfill worker shutting down");
                        return;
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Lagged(_)) => {}
                }
                match self.step().await {
                    Ok(StepOutcome::Worked { outcome, .. }) if outcome.is_closed() => continue,
                    Ok(_) => break,
                    Err(e) => {
                        error!(worker = %self.id, error = %e, "Backfill step failed");
                        break;
                    }
                }
            }

            tokio::select! {
                alive = signal.notified(), if signal_open => {
                    if !alive {
                        signal_open = false;
                    }
                }
                _ = poll.tick() => {}
                _ = shutdown.recv() => {
                    info!(worker = %self.id, "Backfill worker shutting down");
                    return;
                }
            }
        }
    }
}
