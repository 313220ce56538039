// File: src/telemetry.rs

//! Replica counters
//!
//! Emitted through the `metrics` facade. Nothing is recorded until the host
//! installs a recorder; the binary installs a Prometheus exporter when
//! `REPLICA_METRICS_ADDR` is set.

use std::net::SocketAddr;
use std::sync::OnceLock;

use metrics::{counter, describe_counter, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

pub const TRANSACTIONS_INGESTED: &str = "tree_replica_transactions_ingested_total";
pub const GAPS_QUEUED: &str = "tree_replica_gaps_queued_total";
pub const TREES_HALTED: &str = "tree_replica_trees_halted_total";
pub const FETCH_RETRIES: &str = "tree_replica_fetch_retries_total";
pub const FETCH_FAILURES: &str = "tree_replica_fetch_failures_total";
pub const TRANSACTIONS_REPLAYED: &str = "tree_replica_transactions_replayed_total";
pub const TRANSACTIONS_FAILED: &str = "tree_replica_transactions_failed_total";
pub const BACKFILL_ITEMS: &str = "tree_replica_backfill_items_total";
pub const LEASES_LOST: &str = "tree_replica_leases_lost_total";

static DESCRIPTORS: OnceLock<()> = OnceLock::new();

/// Where a backfill item came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapSource {
    /// Seq jump seen during ingestion
    Ingest,
    /// Hole found by the periodic sweep
    Sweep,
    /// Replica behind the canonical head
    Tail,
    /// Deeper hole uncovered when an item closed
    Settle,
}

impl GapSource {
    fn as_str(&self) -> &'static str {
        match self {
            GapSource::Ingest => "ingest",
            GapSource::Sweep => "sweep",
            GapSource::Tail => "tail",
            GapSource::Settle => "settle",
        }
    }
}

/// Install the Prometheus exporter with its HTTP listener. Must run inside a
/// tokio runtime.
pub fn install_prometheus(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe();
    Ok(())
}

/// Register metric descriptions with the installed recorder
pub fn describe() {
    DESCRIPTORS.get_or_init(|| {
        describe_counter!(
            TRANSACTIONS_INGESTED,
            Unit::Count,
            "Chain transactions ingested grouped by status"
        );
        describe_counter!(GAPS_QUEUED, Unit::Count, "Backfill items queued grouped by source");
        describe_counter!(TREES_HALTED, Unit::Count, "Trees halted grouped by cause");
        describe_counter!(
            FETCH_RETRIES,
            Unit::Count,
            "Transient chain fetch failures that were retried"
        );
        describe_counter!(
            FETCH_FAILURES,
            Unit::Count,
            "Chain fetches that failed after retries or permanently"
        );
        describe_counter!(
            TRANSACTIONS_REPLAYED,
            Unit::Count,
            "Transactions replayed from the chain by backfill"
        );
        describe_counter!(
            TRANSACTIONS_FAILED,
            Unit::Count,
            "Backfilled transactions the ingester refused"
        );
        describe_counter!(
            BACKFILL_ITEMS,
            Unit::Count,
            "Backfill items worked grouped by outcome"
        );
        describe_counter!(LEASES_LOST, Unit::Count, "Tree leases lost mid-reconciliation");
    });
}

pub fn transaction_ingested(duplicate: bool) {
    let status = if duplicate { "duplicate" } else { "applied" };
    counter!(TRANSACTIONS_INGESTED, "status" => status).increment(1);
}

pub fn gaps_queued(source: GapSource, count: usize) {
    if count > 0 {
        counter!(GAPS_QUEUED, "source" => source.as_str()).increment(count as u64);
    }
}

pub fn tree_halted(cause: &'static str) {
    counter!(TREES_HALTED, "cause" => cause).increment(1);
}

pub fn fetch_retried(what: &'static str) {
    counter!(FETCH_RETRIES, "what" => what).increment(1);
}

pub fn fetch_failed(what: &'static str, transient: bool) {
    let kind = if transient { "transient" } else { "permanent" };
    counter!(FETCH_FAILURES, "what" => what, "kind" => kind).increment(1);
}

pub fn transactions_replayed(count: usize) {
    if count > 0 {
        counter!(TRANSACTIONS_REPLAYED).increment(count as u64);
    }
}

pub fn transaction_failed() {
    counter!(TRANSACTIONS_FAILED).increment(1);
}

pub fn backfill_item(outcome: &'static str) {
    counter!(BACKFILL_ITEMS, "outcome" => outcome).increment(1);
}

pub fn lease_lost() {
    counter!(LEASES_LOST).increment(1);
}
