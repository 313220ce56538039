// File: src/types.rs

//! Chain-facing and replica-facing domain types
//!
//! Everything that crosses the ingestion boundary is serde-serializable with
//! hashes, tree ids and raw payload bytes encoded as lowercase hex.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::consistency::TreeSyncStatus;
use crate::materializer::SchemaDescriptor;

/// Identity of a tree on chain (account address)
pub type TreeId = [u8; 32];

/// 32-byte node hash
pub type NodeHash = [u8; 32];

/// 32-byte account key (owner, delegate, authority, creator)
pub type Pubkey = [u8; 32];

/// Account-type tag selecting the leaf decoder
pub type Discriminator = [u8; 8];

/// Hex label for a tree id, used in logs and error messages
pub fn tree_label(tree: &TreeId) -> String {
    hex::encode(tree)
}

/// Stable identifier of the asset stored at a leaf position
///
/// `SHA-256(tree || leaf_idx as little-endian u64)`
pub fn leaf_asset_id(tree: &TreeId, leaf_idx: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(tree);
    hasher.update(leaf_idx.to_le_bytes());
    hasher.finalize().into()
}

// ========== Ingestion boundary ==========

/// One chain transaction carrying revisions for one or more trees
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    /// Unique transaction signature (idempotency key)
    pub signature: String,

    /// Slot the transaction landed in
    pub slot: u64,

    /// Per-tree revisions, in instruction order
    pub updates: Vec<TreeUpdate>,
}

impl ChainTransaction {
    /// Transaction carrying a single tree update
    pub fn single(signature: impl Into<String>, slot: u64, update: TreeUpdate) -> Self {
        Self {
            signature: signature.into(),
            slot,
            updates: vec![update],
        }
    }

    /// Check that the transaction is structurally usable
    pub fn validate(&self) -> Result<(), String> {
        if self.signature.is_empty() {
            return Err("empty signature".into());
        }
        check_storable("slot", self.slot)?;
        for update in &self.updates {
            check_storable("seq", update.seq)?;
            if let Some(leaf_idx) = update.leaf_idx {
                check_storable("leaf_idx", leaf_idx)?;
            }
            for node in &update.nodes {
                check_storable("node_idx", node.node_idx)?;
            }
            if update.seq == 0 {
                return Err(format!(
                    "tree {} update has seq 0 (sequence numbers start at 1)",
                    tree_label(&update.tree)
                ));
            }
            if update.payload.is_some() && update.leaf_idx.is_none() {
                return Err(format!(
                    "tree {} seq {} carries a leaf payload without leaf_idx",
                    tree_label(&update.tree),
                    update.seq
                ));
            }
        }
        Ok(())
    }
}

/// Storage keeps integers as SQLite INTEGER (i64)
fn check_storable(field: &str, value: u64) -> Result<(), String> {
    if value > i64::MAX as u64 {
        return Err(format!("{} {} exceeds {}", field, value, i64::MAX));
    }
    Ok(())
}

/// One tree revision: the path of node writes produced by a single
/// modification plus the optional leaf payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeUpdate {
    #[serde(with = "hex::serde")]
    pub tree: TreeId,

    /// Tree-local sequence number, strictly increasing on chain
    pub seq: u64,

    /// Leaf touched by this revision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf_idx: Option<u64>,

    /// Node hashes written, usually leaf-to-root
    #[serde(default)]
    pub nodes: Vec<NodeWrite>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<LeafPayload>,
}

/// A single node hash written by a revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeWrite {
    pub node_idx: u64,

    /// Set only for leaf nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf_idx: Option<u64>,

    /// Distance from the leaves (leaves are level 0)
    pub level: u32,

    #[serde(with = "hex::serde")]
    pub hash: NodeHash,
}

/// Leaf data accompanying a revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LeafPayload {
    /// Complete account data
    Full {
        #[serde(with = "hex::serde")]
        discriminator: Discriminator,
        #[serde(with = "hex::serde")]
        data: Vec<u8>,
    },

    /// Single-field update of previously materialized data
    Patch {
        key: String,
        value: serde_json::Value,
    },

    /// Leaf was cleared
    Empty,
}

impl LeafPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            LeafPayload::Full { .. } => "full",
            LeafPayload::Patch { .. } => "patch",
            LeafPayload::Empty => "empty",
        }
    }
}

// ========== Revision log ==========

/// Stored node revision (append-only)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRevision {
    pub id: i64,
    pub tree: TreeId,
    pub node_idx: u64,
    pub leaf_idx: Option<u64>,
    pub seq: u64,
    pub level: u32,
    pub hash: NodeHash,
    pub slot: u64,
    pub signature: String,
}

/// Leaf payload change recorded alongside the revision log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafChange {
    pub tree: TreeId,
    pub leaf_idx: u64,
    pub seq: u64,
    pub slot: u64,
    pub payload: LeafPayload,
}

/// Result of recording a signature in the raw event store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First delivery, caller should process the transaction
    Inserted,
    /// Signature was already fully processed
    AlreadyProcessed,
}

/// Why an append was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendRejection {
    /// `(tree, node_idx, seq)` already logged
    StaleSequence,
}

/// Result of appending to the node revision log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Accepted,
    Rejected(AppendRejection),
}

// ========== Gaps and backfill ==========

/// Inclusive range of missing sequence numbers for one tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapRange {
    #[serde(with = "hex::serde")]
    pub tree: TreeId,
    pub start_seq: u64,
    pub end_seq: u64,
}

impl GapRange {
    /// Number of missing sequence numbers
    pub fn len(&self) -> u64 {
        self.end_seq - self.start_seq + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end_seq < self.start_seq
    }

    pub fn contains(&self, seq: u64) -> bool {
        seq >= self.start_seq && seq <= self.end_seq
    }
}

/// Unit of backfill work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillItem {
    pub id: i64,
    pub tree: TreeId,

    /// First missing sequence number
    pub seq: u64,

    /// Last missing sequence number for range items
    pub until_seq: Option<u64>,

    /// Slot at which the gap was observed
    pub slot: u64,

    /// Full consistency audit against the canonical head
    pub force_chk: bool,

    pub backfilled: bool,
    pub attempts: u32,
    pub last_error: Option<String>,

    /// Not claimable before this time (unix nanos)
    pub retry_at: Option<i64>,
    pub created_at: i64,
}

impl BackfillItem {
    /// Inclusive end of the missing range
    pub fn end_seq(&self) -> u64 {
        self.until_seq.unwrap_or(self.seq).max(self.seq)
    }
}

/// Exclusive right to reconcile one tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeLease {
    pub tree: TreeId,
    pub holder: String,
    pub item_id: i64,
    pub expires_at: i64,
}

/// Item claimed by a worker together with its tree lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedItem {
    pub item: BackfillItem,
    pub lease: TreeLease,

    /// Lease was taken over from a holder whose lease had expired
    pub reclaimed: bool,
}

// ========== Trees ==========

/// Registered tree configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeMetadata {
    #[serde(with = "hex::serde")]
    pub id: TreeId,

    /// Leaf decoder selector
    #[serde(with = "hex::serde")]
    pub discriminator: Discriminator,

    /// Owning program, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,

    /// Expected shape of parsed leaf data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaDescriptor>,

    pub max_depth: u32,

    #[serde(default)]
    pub canopy_depth: u32,
}

/// Canonical state of a tree as reported by the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalTreeHead {
    #[serde(with = "hex::serde")]
    pub tree: TreeId,
    pub seq: u64,
    #[serde(with = "hex::serde")]
    pub root: NodeHash,
    pub slot: u64,
}

/// Persisted per-tree consistency state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeSyncRecord {
    pub tree: TreeId,
    pub status: TreeSyncStatus,

    /// Largest n such that every seq in `1..=n` is in the log
    pub last_contiguous_seq: u64,

    /// Highest seq observed so far
    pub max_seen_seq: u64,

    /// Consecutive canonical root mismatches
    pub root_mismatches: u32,
    pub halted_reason: Option<String>,
    pub updated_at: i64,
}

impl TreeSyncRecord {
    /// Fresh record for a tree seen for the first time
    pub fn new(tree: TreeId) -> Self {
        Self {
            tree,
            status: TreeSyncStatus::InSync,
            last_contiguous_seq: 0,
            max_seen_seq: 0,
            root_mismatches: 0,
            halted_reason: None,
            updated_at: 0,
        }
    }

    /// Replica holds every revision up to the highest one observed
    pub fn is_caught_up(&self) -> bool {
        self.last_contiguous_seq >= self.max_seen_seq
    }
}
