// File: src/backfill/archive.rs

//! File-backed chain history
//!
//! One JSON-lines file per tree, `<dir>/<tree hex>.jsonl`, each line a
//! `ChainTransaction`. An optional `<tree hex>.head.json` pins the
//! canonical head; without it the head is the last archived root.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::FetchError;
use crate::traits::ChainFetcher;
use crate::types::{tree_label, CanonicalTreeHead, ChainTransaction, TreeId};

#[derive(Debug, Clone)]
pub struct ArchiveFetcher {
    dir: PathBuf,
    source: String,
}

impl ArchiveFetcher {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let source = format!("archive:{}", dir.display());
        Self { dir, source }
    }

    fn history_path(&self, tree: &TreeId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", tree_label(tree)))
    }

    fn head_path(&self, tree: &TreeId) -> PathBuf {
        self.dir.join(format!("{}.head.json", tree_label(tree)))
    }

    async fn load(&self, tree: &TreeId) -> Result<Vec<ChainTransaction>, FetchError> {
        let path = self.history_path(tree);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound(format!(
                    "no archive for tree {}",
                    tree_label(tree)
                )))
            }
            Err(e) => return Err(FetchError::Unavailable(format!("{}: {}", path.display(), e))),
        };

        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str::<ChainTransaction>(line).map_err(|e| {
                    FetchError::Malformed(format!("{}:{}: {}", path.display(), n + 1, e))
                })
            })
            .collect()
    }
}

#[async_trait]
impl ChainFetcher for ArchiveFetcher {
    async fn fetch_segment(
        &self,
        tree: &TreeId,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<Vec<ChainTransaction>, FetchError> {
        let history = self.load(tree).await?;
        Ok(history
            .into_iter()
            .filter(|txn| {
                txn.updates
                    .iter()
                    .any(|u| &u.tree == tree && u.seq >= from_seq && u.seq <= to_seq)
            })
            .collect())
    }

    async fn fetch_tree_head(&self, tree: &TreeId) -> Result<CanonicalTreeHead, FetchError> {
        match tokio::fs::read_to_string(self.head_path(tree)).await {
            Ok(text) => {
                return serde_json::from_str(&text)
                    .map_err(|e| FetchError::Malformed(format!("tree head: {}", e)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FetchError::Unavailable(e.to_string())),
        }

        let history = self.load(tree).await?;
        let mut head: Option<CanonicalTreeHead> = None;
        for txn in &history {
            for update in txn.updates.iter().filter(|u| &u.tree == tree) {
                let Some(root) = update.nodes.iter().find(|n| n.node_idx == 1) else {
                    continue;
                };
                if head.map_or(true, |h| update.seq > h.seq) {
                    head = Some(CanonicalTreeHead {
                        tree: *tree,
                        seq: update.seq,
                        root: root.hash,
                        slot: txn.slot,
                    });
                }
            }
        }
        head.ok_or_else(|| FetchError::NotFound(format!("no root in archive for {}", tree_label(tree))))
    }

    fn source_id(&self) -> &str {
        &self.source
    }
}
