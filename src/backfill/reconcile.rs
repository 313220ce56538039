// File: src/backfill/reconcile.rs

//! Reconciliation of one claimed backfill item against the chain

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{FetchError, ReplicaResult};
use crate::consistency::SyncEvent;
use crate::ingest::{advance_status, Ingester};
use crate::storage::{backfill, projections, revisions, trees, SqliteStore};
use crate::storage::sqlite::now_nanos;
use crate::telemetry;
use crate::traits::ChainFetcher;
use crate::types::{tree_label, BackfillItem, CanonicalTreeHead, TreeId, TreeLease};

use super::config::BackfillConfig;

/// Result of working one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Every seq in the item's range is present (and for forced checks the
    /// root matches the canonical head)
    Closed { replayed: usize },
    /// Leave the item open and try again after the cooldown
    Retry { reason: String },
    /// The tree cannot converge; halt it
    Fatal { reason: String },
}

impl ReconcileOutcome {
    pub fn is_closed(&self) -> bool {
        matches!(self, ReconcileOutcome::Closed { .. })
    }
}

enum Segment {
    Replayed(usize),
    Stop(ReconcileOutcome),
}

/// Fetches missing history and replays it through the ingester
pub struct Reconciler {
    ingester: Arc<Ingester>,
    fetcher: Arc<dyn ChainFetcher>,
    config: BackfillConfig,
}

impl Reconciler {
    pub fn new(ingester: Arc<Ingester>, fetcher: Arc<dyn ChainFetcher>, config: BackfillConfig) -> Self {
        Self {
            ingester,
            fetcher,
            config,
        }
    }

    /// Work one item while holding its tree lease.
    ///
    /// The lease is renewed between segments; `Err(LeaseExpired)` means
    /// another worker owns the tree now and the caller must walk away.
    pub async fn reconcile(
        &self,
        item: &BackfillItem,
        lease: &mut TreeLease,
    ) -> ReplicaResult<ReconcileOutcome> {
        if item.force_chk {
            self.audit(item, lease).await
        } else {
            self.fill(&item.tree, item.seq, item.end_seq(), lease).await
        }
    }

    /// Replay every missing seq in `[start, end]`
    async fn fill(
        &self,
        tree: &TreeId,
        start: u64,
        end: u64,
        lease: &mut TreeLease,
    ) -> ReplicaResult<ReconcileOutcome> {
        let missing = self.missing(tree, start, end).await?;
        if missing.is_empty() {
            debug!(tree = %tree_label(tree), start, end, "Range already complete");
            return Ok(ReconcileOutcome::Closed { replayed: 0 });
        }

        let mut replayed = 0;
        for (from, to) in missing {
            match self.replay_segment(tree, from, to, lease).await? {
                Segment::Replayed(n) => replayed += n,
                Segment::Stop(outcome) => return Ok(outcome),
            }
        }

        let still_missing = self.missing(tree, start, end).await?;
        match still_missing.first() {
            None => Ok(ReconcileOutcome::Closed { replayed }),
            Some((from, to)) => Ok(ReconcileOutcome::Retry {
                reason: format!(
                    "chain returned no data for {} range(s), first {}..={}",
                    still_missing.len(),
                    from,
                    to
                ),
            }),
        }
    }

    /// Full consistency check against the canonical head
    async fn audit(&self, item: &BackfillItem, lease: &mut TreeLease) -> ReplicaResult<ReconcileOutcome> {
        let tree = item.tree;
        let head = match self
            .with_fetch_retry("tree_head", || self.fetcher.fetch_tree_head(&tree))
            .await
        {
            Ok(head) => head,
            Err(e) => {
                return Ok(ReconcileOutcome::Retry {
                    reason: format!("tree head unavailable: {}", e),
                })
            }
        };
        if head.seq == 0 {
            return Ok(ReconcileOutcome::Closed { replayed: 0 });
        }

        let replayed = match self.fill(&tree, 1, head.seq, lease).await? {
            ReconcileOutcome::Closed { replayed } => replayed,
            other => return Ok(other),
        };

        let sync = self
            .blocking(move |store| store.read(|c| trees::load_or_init_sync(c, &tree)))
            .await?;
        if sync.last_contiguous_seq < head.seq {
            return Ok(ReconcileOutcome::Retry {
                reason: format!(
                    "contiguous frontier {} behind canonical seq {}",
                    sync.last_contiguous_seq, head.seq
                ),
            });
        }

        let mismatch = self.compare_root(&head).await?;
        match mismatch {
            None => {
                self.blocking(move |store| {
                    store.write(|tx| {
                        let mut sync = trees::load_or_init_sync(tx, &tree)?;
                        sync.root_mismatches = 0;
                        trees::save_sync(tx, &sync)
                    })
                })
                .await?;
                info!(
                    tree = %tree_label(&tree),
                    seq = head.seq,
                    replayed,
                    "Root matches canonical head"
                );
                Ok(ReconcileOutcome::Closed { replayed })
            }
            Some(detail) => self.on_root_mismatch(&head, detail).await,
        }
    }

    /// `None` when both the log and the projection agree with the head
    async fn compare_root(&self, head: &CanonicalTreeHead) -> ReplicaResult<Option<String>> {
        let head = *head;
        self.blocking(move |store| {
            store.read(|c| {
                let logged = revisions::node_at_seq(c, &head.tree, 1, head.seq)?;
                let Some(logged) = logged else {
                    return Ok(Some(format!("no root revision at or below seq {}", head.seq)));
                };
                if logged.hash != head.root {
                    return Ok(Some(format!(
                        "logged root {} != canonical {} at seq {}",
                        hex::encode(logged.hash),
                        hex::encode(head.root),
                        head.seq
                    )));
                }
                if let Some(current) = projections::get_node(c, &head.tree, 1)? {
                    if current.seq == head.seq && current.hash != head.root {
                        return Ok(Some(format!(
                            "projected root {} != canonical {} at seq {}",
                            hex::encode(current.hash),
                            hex::encode(head.root),
                            head.seq
                        )));
                    }
                }
                Ok(None)
            })
        })
        .await
    }

    async fn on_root_mismatch(
        &self,
        head: &CanonicalTreeHead,
        detail: String,
    ) -> ReplicaResult<ReconcileOutcome> {
        let tree = head.tree;
        let mismatches = self
            .blocking(move |store| {
                store.write(|tx| {
                    let mut sync = trees::load_or_init_sync(tx, &tree)?;
                    sync.root_mismatches += 1;
                    advance_status(&mut sync, SyncEvent::RootMismatch);
                    trees::save_sync(tx, &sync)?;
                    Ok(sync.root_mismatches)
                })
            })
            .await?;

        warn!(
            tree = %tree_label(&tree),
            mismatches,
            max_mismatches = self.config.max_root_mismatches,
            detail = %detail,
            "Root mismatch after replay"
        );

        if mismatches >= self.config.max_root_mismatches {
            return Ok(ReconcileOutcome::Fatal {
                reason: format!("root never converged after {} audits: {}", mismatches, detail),
            });
        }

        // rebuild projections from the log before the next audit
        let ingester = Arc::clone(&self.ingester);
        let stats = tokio::task::spawn_blocking(move || ingester.reproject(&tree)).await??;
        debug!(tree = %tree_label(&tree), applied = stats.applied, "Projections rebuilt from log");

        Ok(ReconcileOutcome::Retry { reason: detail })
    }

    async fn replay_segment(
        &self,
        tree: &TreeId,
        from: u64,
        to: u64,
        lease: &mut TreeLease,
    ) -> ReplicaResult<Segment> {
        self.renew(lease).await?;

        let tree_id = *tree;
        let fetched = self
            .with_fetch_retry("segment", || self.fetcher.fetch_segment(&tree_id, from, to))
            .await;
        let txns = match fetched {
            Ok(txns) => txns,
            Err(e) => {
                return Ok(Segment::Stop(ReconcileOutcome::Retry {
                    reason: format!("fetch {}..={} failed: {}", from, to, e),
                }))
            }
        };

        self.renew(lease).await?;

        let count = txns.len();
        let ingester = Arc::clone(&self.ingester);
        let results =
            tokio::task::spawn_blocking(move || txns.iter().map(|t| ingester.ingest(t)).collect::<Vec<_>>())
                .await?;

        let mut replayed = 0;
        for result in results {
            match result {
                Ok(outcome) if !outcome.is_duplicate() => replayed += 1,
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    telemetry::transaction_failed();
                    return Ok(Segment::Stop(ReconcileOutcome::Fatal {
                        reason: format!("replay of {}..={} failed: {}", from, to, e),
                    }))
                }
                Err(e) => {
                    telemetry::transaction_failed();
                    return Ok(Segment::Stop(ReconcileOutcome::Retry {
                        reason: format!("replay of {}..={} failed: {}", from, to, e),
                    }))
                }
            }
        }

        telemetry::transactions_replayed(replayed);
        debug!(
            tree = %tree_label(tree),
            from,
            to,
            fetched = count,
            replayed,
            source = self.fetcher.source_id(),
            "Segment replayed"
        );
        Ok(Segment::Replayed(replayed))
    }

    /// Retry transient fetch failures with exponential backoff
    async fn with_fetch_retry<T, F, Fut>(
        &self,
        what: &'static str,
        mut op: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= self.config.fetch_retry_count {
                        telemetry::fetch_failed(what, true);
                        return Err(e);
                    }
                    let delay_ms = self.config.fetch_retry_delay_ms(attempt - 1);
                    telemetry::fetch_retried(what);
                    warn!(
                        attempt,
                        max_attempts = self.config.fetch_retry_count,
                        delay_ms,
                        what,
                        error = %e,
                        "Chain fetch failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(e) => {
                    telemetry::fetch_failed(what, false);
                    return Err(e);
                }
            }
        }
    }

    async fn missing(&self, tree: &TreeId, start: u64, end: u64) -> ReplicaResult<Vec<(u64, u64)>> {
        let tree = *tree;
        self.blocking(move |store| store.read(|c| revisions::missing_ranges(c, &tree, start, end)))
            .await
    }

    async fn renew(&self, lease: &mut TreeLease) -> ReplicaResult<()> {
        let current = lease.clone();
        let lease_ms = self.config.lease_ms;
        let renewed = self
            .blocking(move |store| {
                store.write(|tx| backfill::renew_lease(tx, &current, lease_ms, now_nanos()))
            })
            .await?;
        *lease = renewed;
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> ReplicaResult<T>
    where
        F: FnOnce(&SqliteStore) -> ReplicaResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self.ingester.store());
        tokio::task::spawn_blocking(move || f(&store)).await?
    }
}
