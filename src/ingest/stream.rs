// File: src/ingest/stream.rs

//! Ingest stream - ordered delivery of chain transactions to the ingester

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{debug, info};

use super::batch::flush_batch;
use super::buffer::{IngestHandle, IngestRequest};
use super::config::IngestConfig;
use super::ingester::Ingester;

/// Accumulates submitted transactions and ingests them in arrival order
pub struct IngestStream {
    ingester: Arc<Ingester>,
    config: IngestConfig,
    rx: mpsc::Receiver<IngestRequest>,
}

impl IngestStream {
    /// Create a stream and the handle used to feed it
    pub fn new(ingester: Arc<Ingester>, config: IngestConfig) -> (Self, IngestHandle) {
        let (tx, rx) = mpsc::channel(config.buffer_size);
        let stream = Self {
            ingester,
            config,
            rx,
        };
        (stream, IngestHandle::new(tx))
    }

    /// Run until every handle is dropped (spawn as tokio task)
    pub async fn run(mut self) {
        info!(
            batch_size = self.config.batch_size,
            batch_timeout_ms = self.config.batch_timeout_ms,
            buffer_size = self.config.buffer_size,
            policy = %self.ingester.policy(),
            "Ingest stream started"
        );

        let mut batch: Vec<IngestRequest> = Vec::with_capacity(self.config.batch_size);
        let mut flush_interval = interval(Duration::from_millis(self.config.batch_timeout_ms));
        let mut batch_start = Instant::now();

        loop {
            tokio::select! {
                request = self.rx.recv() => {
                    match request {
                        Some(req) => {
                            if batch.is_empty() {
                                batch_start = Instant::now();
                            }
                            batch.push(req);

                            if batch.len() >= self.config.batch_size {
                                debug!(batch_size = batch.len(), trigger = "size", "Flushing batch");
                                flush_batch(&mut batch, &self.ingester, &self.config).await;
                            }
                        }
                        None => {
                            if !batch.is_empty() {
                                info!(batch_size = batch.len(), "Flushing final batch before shutdown");
                                flush_batch(&mut batch, &self.ingester, &self.config).await;
                            }
                            info!("Ingest stream shutting down");
                            return;
                        }
                    }
                }

                _ = flush_interval.tick() => {
                    if !batch.is_empty() {
                        debug!(
                            batch_size = batch.len(),
                            elapsed_ms = batch_start.elapsed().as_millis() as u64,
                            trigger = "timeout",
                            "Flushing batch"
                        );
                        flush_batch(&mut batch, &self.ingester, &self.config).await;
                    }
                }
            }
        }
    }
}
