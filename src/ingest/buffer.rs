// File: src/ingest/buffer.rs

//! Bounded channel buffer for ingest requests

use tokio::sync::{mpsc, oneshot};

use crate::error::{ReplicaError, ReplicaResult};
use crate::types::ChainTransaction;

use super::ingester::IngestOutcome;

/// A single transaction with its response channel
#[derive(Debug)]
pub struct IngestRequest {
    pub txn: ChainTransaction,

    /// Result of the ingest, sent once committed or failed
    pub response_tx: oneshot::Sender<ReplicaResult<IngestOutcome>>,
}

/// Handle for submitting transactions to the ingest stream
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<IngestRequest>,
}

impl IngestHandle {
    pub(crate) fn new(tx: mpsc::Sender<IngestRequest>) -> Self {
        Self { tx }
    }

    /// Submit one transaction and wait for its outcome.
    ///
    /// Waits while the buffer is full; fails if the stream has shut down.
    pub async fn submit(&self, txn: ChainTransaction) -> ReplicaResult<IngestOutcome> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(IngestRequest { txn, response_tx })
            .await
            .map_err(|_| ReplicaError::ServiceUnavailable("ingest stream closed".into()))?;

        response_rx
            .await
            .map_err(|_| ReplicaError::Internal("ingest stream dropped response channel".into()))?
    }

    /// Submit transactions in order, then wait for all outcomes
    pub async fn submit_all(
        &self,
        txns: Vec<ChainTransaction>,
    ) -> ReplicaResult<Vec<ReplicaResult<IngestOutcome>>> {
        let mut pending = Vec::with_capacity(txns.len());
        for txn in txns {
            let (response_tx, response_rx) = oneshot::channel();
            self.tx
                .send(IngestRequest { txn, response_tx })
                .await
                .map_err(|_| ReplicaError::ServiceUnavailable("ingest stream closed".into()))?;
            pending.push(response_rx);
        }

        let mut results = Vec::with_capacity(pending.len());
        for rx in pending {
            results.push(rx.await.map_err(|_| {
                ReplicaError::Internal("ingest stream dropped response channel".into())
            })?);
        }
        Ok(results)
    }

    /// Check if buffer has capacity
    pub fn has_capacity(&self) -> bool {
        self.tx.capacity() > 0
    }

    /// Current buffer utilization (0.0 - 1.0)
    pub fn buffer_utilization(&self) -> f64 {
        let capacity = self.tx.max_capacity();
        let available = self.tx.capacity();
        1.0 - (available as f64 / capacity as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TreeUpdate;

    fn txn() -> ChainTransaction {
        ChainTransaction::single(
            "sig",
            1,
            TreeUpdate {
                tree: [1u8; 32],
                seq: 1,
                leaf_idx: None,
                nodes: vec![],
                payload: None,
            },
        )
    }

    #[tokio::test]
    async fn test_handle_capacity() {
        let (tx, _rx) = mpsc::channel::<IngestRequest>(4);
        let handle = IngestHandle::new(tx);
        assert!(handle.has_capacity());
        assert_eq!(handle.buffer_utilization(), 0.0);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let (tx, rx) = mpsc::channel::<IngestRequest>(4);
        let handle = IngestHandle::new(tx);
        drop(rx);

        match handle.submit(txn()).await {
            Err(ReplicaError::ServiceUnavailable(msg)) => assert!(msg.contains("closed")),
            other => panic!("expected ServiceUnavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_response() {
        let (tx, mut rx) = mpsc::channel::<IngestRequest>(4);
        let handle = IngestHandle::new(tx);

        let task = tokio::spawn(async move { handle.submit(txn()).await });
        if let Some(_request) = rx.recv().await {
            // dropped without responding
        }

        let result = task.await.expect("task should complete");
        assert!(matches!(result, Err(ReplicaError::Internal(_))));
    }
}
