// File: src/consistency/mod.rs

//! Ordering and gap bookkeeping between the revision log and projections
//!
//! - `gate`: decides when a logged revision may reach the projections and
//!   whether it is stale against a projection's watermark
//! - `gap`: pure sequence arithmetic (gap detection, frontier, missing ranges)
//! - `state`: per-tree sync state machine

pub mod gap;
pub mod gate;
pub mod state;

pub use gap::{detect_gap, missing_ranges};
pub use gate::{admit, Admission, ConsistencyGate, ProjectionPolicy};
pub use state::{SyncEvent, TreeSyncStatus};
