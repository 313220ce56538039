//! Mock chain, fetcher and replica setup

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tree_replica::backfill::{BackfillWorker, Reconciler, SweepConfig};
use tree_replica::materializer::decoder::ASSET_LEAF_V1;
use tree_replica::materializer::shape::{empty_node, hash_children};
use tree_replica::types::{
    CanonicalTreeHead, ChainTransaction, LeafPayload, NodeHash, NodeWrite, TreeId, TreeMetadata,
    TreeUpdate,
};
use tree_replica::{
    BackfillConfig, BackfillNotifier, ChainFetcher, FetchError, Ingester, ProjectionPolicy,
    SqliteStore, TreeMaterializer,
};

/// Deterministic tree id
pub fn tree_id(b: u8) -> TreeId {
    [b; 32]
}

/// Hex pubkey as carried in asset leaves
pub fn key(b: u8) -> String {
    hex::encode([b; 32])
}

/// In-memory chain holding the canonical history of one tree
///
/// Every mutation produces one transaction whose node writes cover the full
/// leaf-to-root path, computed against the current canonical siblings.
pub struct MockChain {
    tree: TreeId,
    depth: u32,
    nodes: HashMap<u64, NodeHash>,
    history: Vec<ChainTransaction>,
    roots: Vec<NodeHash>,
}

impl MockChain {
    pub fn new(tree: TreeId, depth: u32) -> Self {
        Self {
            tree,
            depth,
            nodes: HashMap::new(),
            history: Vec::new(),
            roots: Vec::new(),
        }
    }

    pub fn tree(&self) -> TreeId {
        self.tree
    }

    pub fn metadata(&self) -> TreeMetadata {
        TreeMetadata {
            id: self.tree,
            discriminator: ASSET_LEAF_V1,
            program: Some("mock-program".to_string()),
            schema: None,
            max_depth: self.depth,
            canopy_depth: 0,
        }
    }

    /// Seq of the latest transaction (0 before any)
    pub fn seq(&self) -> u64 {
        self.history.len() as u64
    }

    /// Assign leaf `leaf_idx` to `owner`
    pub fn mint(&mut self, leaf_idx: u64, owner: u8) -> ChainTransaction {
        let data = serde_json::json!({
            "owner": key(owner),
            "name": format!("asset-{}", leaf_idx),
        })
        .to_string()
        .into_bytes();
        self.set_leaf(
            leaf_idx,
            LeafPayload::Full {
                discriminator: ASSET_LEAF_V1,
                data,
            },
        )
    }

    /// Update one field of the leaf's data
    pub fn patch(&mut self, leaf_idx: u64, key: &str, value: serde_json::Value) -> ChainTransaction {
        self.set_leaf(
            leaf_idx,
            LeafPayload::Patch {
                key: key.to_string(),
                value,
            },
        )
    }

    /// Clear the leaf
    pub fn clear(&mut self, leaf_idx: u64) -> ChainTransaction {
        self.set_leaf(leaf_idx, LeafPayload::Empty)
    }

    /// Write `payload` at `leaf_idx` and return the resulting transaction
    pub fn set_leaf(&mut self, leaf_idx: u64, payload: LeafPayload) -> ChainTransaction {
        let seq = self.seq() + 1;
        let leaf_hash: NodeHash = match &payload {
            LeafPayload::Empty => [0u8; 32],
            other => {
                let encoded = serde_json::to_vec(other).unwrap_or_default();
                Sha256::digest(&encoded).into()
            }
        };

        let mut idx = (1u64 << self.depth) + leaf_idx;
        let mut level = 0u32;
        let mut hash = leaf_hash;
        let mut writes = Vec::with_capacity(self.depth as usize + 1);
        loop {
            self.nodes.insert(idx, hash);
            writes.push(NodeWrite {
                node_idx: idx,
                leaf_idx: (level == 0).then_some(leaf_idx),
                level,
                hash,
            });
            if idx == 1 {
                break;
            }
            let sibling = self.node(idx ^ 1, level);
            hash = if idx % 2 == 0 {
                hash_children(&hash, &sibling)
            } else {
                hash_children(&sibling, &hash)
            };
            idx /= 2;
            level += 1;
        }

        let txn = ChainTransaction::single(
            format!("sig-{:02x}-{}", self.tree[0], seq),
            100 + seq,
            TreeUpdate {
                tree: self.tree,
                seq,
                leaf_idx: Some(leaf_idx),
                nodes: writes,
                payload: Some(payload),
            },
        );
        self.roots.push(hash);
        self.history.push(txn.clone());
        txn
    }

    fn node(&self, idx: u64, level: u32) -> NodeHash {
        self.nodes.get(&idx).copied().unwrap_or_else(|| empty_node(level))
    }

    /// Canonical root after the revision at `seq`
    pub fn root_at(&self, seq: u64) -> NodeHash {
        self.roots[(seq - 1) as usize]
    }

    pub fn root(&self) -> NodeHash {
        self.root_at(self.seq())
    }

    pub fn transaction(&self, seq: u64) -> &ChainTransaction {
        &self.history[(seq - 1) as usize]
    }

    pub fn transactions(&self) -> &[ChainTransaction] {
        &self.history
    }

    pub fn head(&self) -> CanonicalTreeHead {
        CanonicalTreeHead {
            tree: self.tree,
            seq: self.seq(),
            root: if self.history.is_empty() {
                empty_node(self.depth)
            } else {
                self.root()
            },
            slot: 100 + self.seq(),
        }
    }
}

/// `ChainFetcher` serving the history of one or more mock chains
#[derive(Default)]
pub struct MockFetcher {
    history: Mutex<HashMap<TreeId, Vec<ChainTransaction>>>,
    heads: Mutex<HashMap<TreeId, CanonicalTreeHead>>,
    fail_next: AtomicU32,
    segment_calls: AtomicUsize,
    head_calls: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetcher serving the current state of `chain`
    pub fn from_chain(chain: &MockChain) -> Arc<Self> {
        let fetcher = Self::new();
        fetcher.load(chain);
        Arc::new(fetcher)
    }

    /// Replace what is served for `chain`'s tree
    pub fn load(&self, chain: &MockChain) {
        self.history
            .lock()
            .unwrap()
            .insert(chain.tree(), chain.transactions().to_vec());
        self.heads.lock().unwrap().insert(chain.tree(), chain.head());
    }

    /// Serve a head that disagrees with the served history
    pub fn set_head(&self, head: CanonicalTreeHead) {
        self.heads.lock().unwrap().insert(head.tree, head);
    }

    /// Drop a transaction from the served history
    pub fn withhold(&self, tree: &TreeId, seq: u64) {
        if let Some(txns) = self.history.lock().unwrap().get_mut(tree) {
            txns.retain(|t| t.updates.iter().all(|u| u.seq != seq));
        }
    }

    /// Fail the next `n` calls with a timeout
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn segment_calls(&self) -> usize {
        self.segment_calls.load(Ordering::SeqCst)
    }

    pub fn head_calls(&self) -> usize {
        self.head_calls.load(Ordering::SeqCst)
    }

    fn injected_failure(&self) -> Result<(), FetchError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(FetchError::Timeout(50));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainFetcher for MockFetcher {
    async fn fetch_segment(
        &self,
        tree: &TreeId,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<Vec<ChainTransaction>, FetchError> {
        self.segment_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;

        let history = self.history.lock().unwrap();
        let txns = history
            .get(tree)
            .ok_or_else(|| FetchError::NotFound(hex::encode(tree)))?;
        Ok(txns
            .iter()
            .filter(|t| {
                t.updates
                    .iter()
                    .any(|u| &u.tree == tree && u.seq >= from_seq && u.seq <= to_seq)
            })
            .cloned()
            .collect())
    }

    async fn fetch_tree_head(&self, tree: &TreeId) -> Result<CanonicalTreeHead, FetchError> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;

        self.heads
            .lock()
            .unwrap()
            .get(tree)
            .copied()
            .ok_or_else(|| FetchError::NotFound(hex::encode(tree)))
    }

    fn source_id(&self) -> &str {
        "mock"
    }
}

/// Backfill settings that make tests fast
pub fn fast_backfill_config() -> BackfillConfig {
    BackfillConfig {
        disabled: false,
        worker_count: 2,
        lease_ms: 2_000,
        poll_interval_ms: 20,
        fetch_retry_count: 4,
        fetch_retry_base_ms: 1,
        fetch_retry_max_ms: 4,
        retry_cooldown_secs: 0,
        max_root_mismatches: 2,
        sweep: SweepConfig {
            enabled: false,
            interval_secs: 3600,
            audit_roots: false,
        },
    }
}

/// Replica wired the way the binary wires it
pub struct Replica {
    pub store: Arc<SqliteStore>,
    pub notifier: BackfillNotifier,
    pub ingester: Arc<Ingester>,
}

impl Replica {
    pub fn in_memory(policy: ProjectionPolicy) -> Self {
        let store = SqliteStore::in_memory().expect("Failed to create in-memory storage");
        store.initialize().expect("Failed to initialize storage");
        Self::with_store(Arc::new(store), policy)
    }

    /// Replica on a database file, shareable with other replicas
    pub fn on_file(path: &Path, policy: ProjectionPolicy) -> Self {
        let store = SqliteStore::new(path).expect("Failed to open storage");
        store.initialize().expect("Failed to initialize storage");
        Self::with_store(Arc::new(store), policy)
    }

    fn with_store(store: Arc<SqliteStore>, policy: ProjectionPolicy) -> Self {
        let notifier = BackfillNotifier::new();
        let ingester = Arc::new(Ingester::new(
            Arc::clone(&store),
            TreeMaterializer::default(),
            policy,
            notifier.clone(),
        ));
        Self {
            store,
            notifier,
            ingester,
        }
    }

    pub fn register(&self, chain: &MockChain) {
        self.ingester
            .register_tree(&chain.metadata())
            .expect("Failed to register tree");
    }

    /// Ingest each transaction, panicking on error
    pub fn ingest_all<'a>(&self, txns: impl IntoIterator<Item = &'a ChainTransaction>) {
        for txn in txns {
            self.ingester.ingest(txn).expect("Failed to ingest transaction");
        }
    }

    pub fn worker(
        &self,
        id: &str,
        fetcher: Arc<dyn ChainFetcher>,
        config: BackfillConfig,
    ) -> BackfillWorker {
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&self.ingester),
            fetcher,
            config.clone(),
        ));
        BackfillWorker::new(
            id,
            Arc::clone(&self.store),
            reconciler,
            self.notifier.clone(),
            config,
        )
    }
}
