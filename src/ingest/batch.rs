// File: src/ingest/batch.rs

//! Batch flushing with retry

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ReplicaError, ReplicaResult};
use crate::types::ChainTransaction;

use super::buffer::IngestRequest;
use super::config::IngestConfig;
use super::ingester::{IngestOutcome, Ingester};

/// Ingest accumulated requests in arrival order.
///
/// The whole batch runs in one blocking task; transactions that fail with a
/// recoverable error are retried one by one with backoff.
pub async fn flush_batch(
    batch: &mut Vec<IngestRequest>,
    ingester: &Arc<Ingester>,
    config: &IngestConfig,
) {
    if batch.is_empty() {
        return;
    }

    let batch_size = batch.len();
    let (txns, response_txs): (Vec<_>, Vec<_>) = std::mem::take(batch)
        .into_iter()
        .map(|r| (r.txn, r.response_tx))
        .unzip();

    let first_pass = {
        let ingester = Arc::clone(ingester);
        tokio::task::spawn_blocking(move || {
            let results: Vec<ReplicaResult<IngestOutcome>> =
                txns.iter().map(|txn| ingester.ingest(txn)).collect();
            (txns, results)
        })
        .await
    };

    let (txns, results) = match first_pass {
        Ok(pass) => pass,
        Err(e) => {
            let msg = format!("ingest task failed: {}", e);
            for tx in response_txs {
                let _ = tx.send(Err(ReplicaError::Internal(msg.clone())));
            }
            return;
        }
    };

    let mut failed = 0usize;
    for ((txn, result), tx) in txns.into_iter().zip(results).zip(response_txs) {
        let result = match result {
            Err(e) if e.is_recoverable() && config.retry_count > 1 => {
                retry_ingest(ingester, txn, e, config).await
            }
            other => other,
        };
        if let Err(e) = &result {
            failed += 1;
            debug!(error = %e, code = e.error_code(), "Transaction rejected");
        }
        // receiver may have gone away
        let _ = tx.send(result);
    }
    debug!(batch_size, failed, "Batch ingested");
}

/// Retry one transaction with exponential backoff
async fn retry_ingest(
    ingester: &Arc<Ingester>,
    txn: ChainTransaction,
    first_error: ReplicaError,
    config: &IngestConfig,
) -> ReplicaResult<IngestOutcome> {
    let txn = Arc::new(txn);
    let mut attempt = 1;
    let mut delay_ms = config.retry_base_ms;
    let mut last_error = first_error;

    loop {
        warn!(
            attempt,
            max_attempts = config.retry_count,
            delay_ms,
            signature = %txn.signature,
            error = %last_error,
            "Ingest failed, retrying"
        );
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        delay_ms *= 2;

        let ingester = Arc::clone(ingester);
        let txn_ref = Arc::clone(&txn);
        let result = tokio::task::spawn_blocking(move || ingester.ingest(&txn_ref)).await?;

        match result {
            Ok(outcome) => return Ok(outcome),
            Err(e) => {
                attempt += 1;
                if attempt >= config.retry_count || !e.is_recoverable() {
                    return Err(e);
                }
                last_error = e;
            }
        }
    }
}
