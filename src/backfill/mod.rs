// File: src/backfill/mod.rs

//! Backfill worker pool
//!
//! Workers claim queued gaps (one tree at a time per lease), fetch the
//! missing history from the chain, and replay it through the ingester. A
//! periodic sweep re-discovers holes and re-surfaces items after their
//! retry cooldown. Workers sleep on a notification channel when the queue
//! is empty.

pub mod archive;
pub mod config;
pub mod notifier;
pub mod reconcile;
pub mod sweep;
pub mod worker;

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::ingest::Ingester;
use crate::traits::ChainFetcher;

pub use archive::ArchiveFetcher;
pub use config::{BackfillConfig, SweepConfig};
pub use notifier::{BackfillNotifier, BackfillSignal};
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use sweep::{BackfillSweep, SweepReport};
pub use worker::{BackfillWorker, StepOutcome};

/// Starts and stops the worker pool and sweep
pub struct BackfillRunner {
    ingester: Arc<Ingester>,
    fetcher: Arc<dyn ChainFetcher>,
    config: BackfillConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl BackfillRunner {
    pub fn new(ingester: Arc<Ingester>, fetcher: Arc<dyn ChainFetcher>, config: BackfillConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            ingester,
            fetcher,
            config,
            shutdown_tx,
        }
    }

    /// Sweep sharing this runner's store, fetcher and notifier
    pub fn sweep(&self) -> BackfillSweep {
        BackfillSweep::new(
            Arc::clone(self.ingester.store()),
            Some(Arc::clone(&self.fetcher)),
            self.ingester.notifier().clone(),
            self.config.clone(),
        )
    }

    /// Spawn the workers and the sweep
    pub fn start(&self) -> Vec<tokio::task::JoinHandle<()>> {
        if self.config.disabled {
            tracing::info!("Backfill disabled via REPLICA_BACKFILL_DISABLED");
            return vec![];
        }

        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&self.ingester),
            Arc::clone(&self.fetcher),
            self.config.clone(),
        ));

        let mut handles = Vec::with_capacity(self.config.worker_count + 1);
        for _ in 0..self.config.worker_count {
            let worker = BackfillWorker::with_random_id(
                Arc::clone(self.ingester.store()),
                Arc::clone(&reconciler),
                self.ingester.notifier().clone(),
                self.config.clone(),
            );
            let shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                worker.run(shutdown_rx).await;
            }));
        }

        if self.config.sweep.enabled {
            let sweep = self.sweep();
            let shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                sweep.run(shutdown_rx).await;
            }));
        }

        tracing::info!(
            workers = self.config.worker_count,
            sweep = self.config.sweep.enabled,
            source = self.fetcher.source_id(),
            "Backfill started"
        );
        handles
    }

    /// Signal workers and sweep to stop
    pub fn shutdown(&self) {
        tracing::info!("Signaling backfill workers to shutdown");
        let _ = self.shutdown_tx.send(());
    }
}
