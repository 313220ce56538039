// File: src/consistency/state.rs

use std::fmt;

/// Per-tree sync state
///
/// ```text
/// InSync -> GapDetected -> BackfillRequested -> Reconciling -> InSync
///    any non-halted state --gap / root mismatch--> GapDetected
///    any state --fatal--> Halted --operator reset--> InSync
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TreeSyncStatus {
    #[default]
    InSync,
    GapDetected,
    BackfillRequested,
    Reconciling,
    Halted,
}

impl TreeSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TreeSyncStatus::InSync => "in_sync",
            TreeSyncStatus::GapDetected => "gap_detected",
            TreeSyncStatus::BackfillRequested => "backfill_requested",
            TreeSyncStatus::Reconciling => "reconciling",
            TreeSyncStatus::Halted => "halted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_sync" => Some(TreeSyncStatus::InSync),
            "gap_detected" => Some(TreeSyncStatus::GapDetected),
            "backfill_requested" => Some(TreeSyncStatus::BackfillRequested),
            "reconciling" => Some(TreeSyncStatus::Reconciling),
            "halted" => Some(TreeSyncStatus::Halted),
            _ => None,
        }
    }

    pub fn is_halted(&self) -> bool {
        *self == TreeSyncStatus::Halted
    }

    /// Compute the state after `event`
    pub fn transition(self, event: SyncEvent) -> Result<Self, InvalidTransition> {
        use SyncEvent::*;
        use TreeSyncStatus::*;

        let next = match (self, event) {
            (Halted, Reset) => InSync,
            (Halted, _) => return Err(InvalidTransition { from: self, event }),
            (_, Fatal) => Halted,
            (_, GapObserved) | (_, RootMismatch) => GapDetected,
            (InSync | GapDetected | BackfillRequested, Enqueued) => BackfillRequested,
            // An audit or older item may land while another is being worked on
            (Reconciling, Enqueued) => Reconciling,
            (_, Claimed) => Reconciling,
            (_, Confirmed) => InSync,
            (GapDetected, Released) => GapDetected,
            (_, Released) => BackfillRequested,
            (_, Reset) => return Err(InvalidTransition { from: self, event }),
        };
        Ok(next)
    }
}

impl fmt::Display for TreeSyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the sync state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// A sequence discontinuity was found
    GapObserved,
    /// Materialized root differs from the canonical root
    RootMismatch,
    /// A backfill item was queued for the tree
    Enqueued,
    /// A worker took the tree lease
    Claimed,
    /// All work for the tree is done and the log is contiguous
    Confirmed,
    /// Worker released the tree with work remaining
    Released,
    /// Irrecoverable inconsistency
    Fatal,
    /// Operator cleared a halt
    Reset,
}

/// Event not allowed in the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: TreeSyncStatus,
    pub event: SyncEvent,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid transition {:?} from {}", self.event, self.from)
    }
}

impl std::error::Error for InvalidTransition {}
