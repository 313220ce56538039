// File: src/backfill/notifier.rs

//! Wake-up channel between the queue and idle workers
//!
//! Carries no payload: a bumped generation only means "new work may exist",
//! workers re-query the queue for specifics.

use std::sync::Arc;
use tokio::sync::watch;

/// Publisher side, cloned into every component that enqueues work
#[derive(Debug, Clone)]
pub struct BackfillNotifier {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for BackfillNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl BackfillNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Wake every subscribed worker
    pub fn notify(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub fn subscribe(&self) -> BackfillSignal {
        BackfillSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of notifications published so far
    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }
}

/// Subscriber side held by a worker
#[derive(Debug)]
pub struct BackfillSignal {
    rx: watch::Receiver<u64>,
}

impl BackfillSignal {
    /// True if a notification arrived since the last `notified`
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    /// Wait for the next notification. Returns false once every publisher
    /// is gone.
    pub async fn notified(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
