//! Chain access used by backfill

use async_trait::async_trait;

use crate::error::FetchError;
use crate::types::{CanonicalTreeHead, ChainTransaction, TreeId};

/// Source of canonical tree history
///
/// Implementations talk to an RPC node, an archive, or a test double. Errors
/// classified as transient (`FetchError::is_transient`) are retried by the
/// caller with backoff.
#[async_trait]
pub trait ChainFetcher: Send + Sync {
    /// Transactions carrying revisions of `tree` with seq in
    /// `[from_seq, to_seq]`, in chain order. Transactions may carry updates
    /// for other trees as well.
    async fn fetch_segment(
        &self,
        tree: &TreeId,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<Vec<ChainTransaction>, FetchError>;

    /// Latest canonical seq and root of `tree`
    async fn fetch_tree_head(&self, tree: &TreeId) -> Result<CanonicalTreeHead, FetchError>;

    /// Human-readable source name for logs
    fn source_id(&self) -> &str;
}
