// File: src/storage/sqlite/raw_events.rs

//! Raw event store: one row per chain transaction signature

use super::store::now_nanos;
use crate::error::{ReplicaError, ReplicaResult};
use crate::types::RecordOutcome;
use rusqlite::{params, Connection, OptionalExtension};

/// Stored raw event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub signature: String,
    pub slot: u64,
    pub processed: bool,
}

/// Record a signature before processing it.
///
/// Returns `AlreadyProcessed` for a signature whose processing committed
/// earlier. A signature recorded but not marked processed is processed again.
/// A second, different slot for a known signature means the chain data is
/// inconsistent.
pub fn record(conn: &Connection, signature: &str, slot: u64) -> ReplicaResult<RecordOutcome> {
    let existing = get(conn, signature)?;

    match existing {
        Some(event) if event.slot != slot => Err(ReplicaError::LedgerInconsistency(format!(
            "signature {} seen at slot {} and slot {}",
            signature, event.slot, slot
        ))),
        Some(event) if event.processed => Ok(RecordOutcome::AlreadyProcessed),
        Some(_) => Ok(RecordOutcome::Inserted),
        None => {
            conn.execute(
                "INSERT INTO raw_events (signature, slot, processed, created_at) VALUES (?1, ?2, 0, ?3)",
                params![signature, slot as i64, now_nanos()],
            )?;
            Ok(RecordOutcome::Inserted)
        }
    }
}

/// Flag a signature as fully processed
pub fn mark_processed(conn: &Connection, signature: &str) -> ReplicaResult<()> {
    let updated = conn.execute(
        "UPDATE raw_events SET processed = 1 WHERE signature = ?1",
        params![signature],
    )?;
    if updated == 0 {
        return Err(ReplicaError::NotFound(format!("raw event {}", signature)));
    }
    Ok(())
}

pub fn get(conn: &Connection, signature: &str) -> ReplicaResult<Option<RawEvent>> {
    let event = conn
        .query_row(
            "SELECT signature, slot, processed FROM raw_events WHERE signature = ?1",
            params![signature],
            |row| {
                Ok(RawEvent {
                    signature: row.get(0)?,
                    slot: row.get::<_, i64>(1)? as u64,
                    processed: row.get::<_, i64>(2)? != 0,
                })
            },
        )
        .optional()?;
    Ok(event)
}
