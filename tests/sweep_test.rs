//! Periodic sweep: interior holes, missing tails and root audits

mod common;

use common::*;
use tree_replica::backfill::{BackfillConfig, BackfillSweep};
use tree_replica::storage::backfill;
use tree_replica::storage::sqlite::now_nanos;
use tree_replica::types::CanonicalTreeHead;
use tree_replica::{ChainFetcher, ProjectionPolicy, TreeSyncStatus};

fn sweep_for(replica: &Replica, fetcher: Option<Arc<MockFetcher>>, config: BackfillConfig) -> BackfillSweep {
    BackfillSweep::new(
        Arc::clone(&replica.store),
        fetcher.map(|f| f as Arc<dyn ChainFetcher>),
        replica.notifier.clone(),
        config,
    )
}

fn chain_with(tree: u8, seqs: u64) -> MockChain {
    let mut chain = MockChain::new(tree_id(tree), 3);
    for i in 0..seqs {
        chain.mint(i % 8, 3);
    }
    chain
}

#[tokio::test]
async fn test_sweep_requeues_uncovered_interior_gap() {
    let chain = chain_with(30, 6);
    let replica = Replica::in_memory(ProjectionPolicy::Deferred);
    let tree = chain.tree();
    replica.ingest_all([1u64, 2, 5, 6].iter().map(|s| chain.transaction(*s)));

    // a worker gave up on the item without filling it
    let claimed = replica
        .store
        .write(|tx| backfill::claim_next(tx, "gone", 60_000, now_nanos()))
        .unwrap()
        .unwrap();
    replica
        .store
        .write(|tx| backfill::complete(tx, &claimed.lease))
        .unwrap();
    assert!(open_items(&replica.store, &tree).is_empty());

    let sweep = sweep_for(&replica, None, fast_backfill_config());
    let generation = replica.notifier.generation();
    let report = sweep.sweep_once().await.unwrap();

    assert_eq!(report.trees, 1);
    assert_eq!(report.gaps_found, 1);
    assert_eq!(report.enqueued, 1);
    assert!(replica.notifier.generation() > generation);

    let open = open_items(&replica.store, &tree);
    assert_eq!(open.len(), 1);
    assert_eq!((open[0].seq, open[0].end_seq()), (3, 4));
    assert_eq!(
        sync_record(&replica.store, &tree).status,
        TreeSyncStatus::BackfillRequested
    );

    // covered gaps are not queued twice
    let report = sweep.sweep_once().await.unwrap();
    assert_eq!(report.gaps_found, 1);
    assert_eq!(report.enqueued, 0);
    assert_eq!(open_items(&replica.store, &tree).len(), 1);
}

#[tokio::test]
async fn test_sweep_queues_missing_tail() {
    let chain = chain_with(31, 9);
    let replica = Replica::in_memory(ProjectionPolicy::Deferred);
    replica.ingest_all(&chain.transactions()[..6]);

    let fetcher = MockFetcher::from_chain(&chain);
    let sweep = sweep_for(&replica, Some(fetcher.clone()), fast_backfill_config());
    let report = sweep.sweep_once().await.unwrap();

    assert_eq!(report.tail_gaps, 1);
    assert_eq!(report.enqueued, 1);
    assert_eq!(report.fetch_failures, 0);
    let open = open_items(&replica.store, &chain.tree());
    assert_eq!((open[0].seq, open[0].end_seq()), (7, 9));

    let worker = replica.worker("w1", fetcher, fast_backfill_config());
    worker.step().await.unwrap();
    assert_converged(&replica.store, &chain);
}

#[tokio::test]
async fn test_sweep_audits_divergent_root() {
    let chain = chain_with(32, 4);
    let healthy = chain_with(33, 4);
    let replica = Replica::in_memory(ProjectionPolicy::Deferred);
    replica.ingest_all(chain.transactions());
    replica.ingest_all(healthy.transactions());

    let fetcher = MockFetcher::from_chain(&chain);
    fetcher.load(&healthy);
    fetcher.set_head(CanonicalTreeHead {
        root: [7u8; 32],
        ..chain.head()
    });

    let mut config = fast_backfill_config();
    config.sweep.audit_roots = true;
    let report = sweep_for(&replica, Some(fetcher), config).sweep_once().await.unwrap();

    assert_eq!(report.trees, 2);
    assert_eq!(report.audits_requested, 1);
    assert_eq!(report.tail_gaps, 0);

    let open = open_items(&replica.store, &chain.tree());
    assert_eq!(open.len(), 1);
    assert!(open[0].force_chk);
    assert!(open_items(&replica.store, &healthy.tree()).is_empty());
    assert_eq!(
        sync_record(&replica.store, &healthy.tree()).status,
        TreeSyncStatus::InSync
    );
}

#[tokio::test]
async fn test_sweep_skips_halted_tree_and_counts_fetch_failures() {
    let halted = chain_with(34, 3);
    let unknown = chain_with(35, 3);
    let replica = Replica::in_memory(ProjectionPolicy::Deferred);
    replica.ingest_all([halted.transaction(1), halted.transaction(3)]);
    replica.ingest_all(unknown.transactions());
    replica
        .store
        .write(|tx| tree_replica::storage::trees::halt(tx, &halted.tree(), "test"))
        .unwrap();

    // the fetcher knows neither tree
    let fetcher = Arc::new(MockFetcher::new());
    let report = sweep_for(&replica, Some(fetcher), fast_backfill_config())
        .sweep_once()
        .await
        .unwrap();

    assert_eq!(report.trees, 1);
    assert_eq!(report.fetch_failures, 1);
    assert_eq!(report.enqueued, 0);
}
