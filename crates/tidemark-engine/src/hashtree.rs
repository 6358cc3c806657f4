//! Time-partitioned hash index over a group's change history
//!
//! Change records are bucketed into fixed-width time blocks by their
//! `modified` stamp. Each leaf hashes the ordered `{id, modified}` keys of
//! one block; internal nodes hash their children's `(id, hex digest)`
//! pairs, up through shared decimal prefixes of the block index to a
//! single root per group. Two replicas whose histories match produce the
//! same root, and a mismatch is narrowed block by block walking down the
//! tree.
//!
//! Recomputation is lazy: writers only mark a block dirty, and the next
//! read refreshes dirty leaves and their ancestors. Nodes whose subtree
//! holds no records are pruned.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use tidemark_core::error::{ProtocolError, TidemarkResult};
use tidemark_core::keyring::Digest;
use tidemark_core::model::{canonical_bytes, ChangeKey};
use tidemark_core::store::{ChangeStore, Store};

/// Width of one leaf block in milliseconds (one day).
pub const BLOCK_SIZE: u64 = 86_400_000;
/// Decimal digits in a full block index.
pub const BLOCK_DIGITS: usize = 8;
/// Length of a leaf block id (`B` plus the index digits).
pub const BLOCK_ID_LEN: usize = BLOCK_DIGITS + 1;
/// Largest representable block index.
pub const MAX_BLOCK_INDEX: u64 = 99_999_999;

/// The leaf block id covering a timestamp, e.g. `B00000000` for day zero.
pub fn block_id(modified: u64) -> Result<String, ProtocolError> {
    let index = modified / BLOCK_SIZE;
    if index > MAX_BLOCK_INDEX {
        return Err(ProtocolError::BlockOverflow(modified));
    }
    Ok(format!("B{:08}", index))
}

/// The half-open timestamp range a node id covers.
///
/// Works for leaves and for internal prefixes: `B0000001` spans the ten
/// blocks `B00000010..B00000019`, and the bare root `B` spans everything.
/// Returns `None` for ids that are not valid block prefixes.
pub fn block_range(node: &str) -> Option<Range<u64>> {
    let digits = node.strip_prefix('B')?;
    if digits.len() > BLOCK_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let scale = 10u64.pow((BLOCK_DIGITS - digits.len()) as u32);
    let index: u64 = if digits.is_empty() {
        0
    } else {
        digits.parse().ok()?
    };
    Some(index * scale * BLOCK_SIZE..(index + 1) * scale * BLOCK_SIZE)
}

/// Per-group node table plus the set of leaves awaiting recomputation.
#[derive(Debug, Default)]
struct GroupTree {
    /// Node id to digest, leaves and internal nodes alike.
    nodes: BTreeMap<String, Digest>,
    /// Leaf ids invalidated since the last refresh.
    dirty: BTreeSet<String>,
}

/// The divergence index: one lazily maintained hash tree per group.
pub struct HashTree {
    store: Arc<dyn Store>,
    groups: DashMap<String, Arc<Mutex<GroupTree>>>,
}

impl HashTree {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            groups: DashMap::new(),
        }
    }

    fn group_tree(&self, group: &str) -> Arc<Mutex<GroupTree>> {
        self.groups
            .entry(group.to_string())
            .or_default()
            .clone()
    }

    /// Mark the block covering `modified` dirty for the group.
    ///
    /// Called after every accepted change (including deletions); the
    /// recomputation itself happens on the next read.
    pub async fn invalidate(&self, group: &str, modified: u64) -> TidemarkResult<()> {
        let leaf = block_id(modified)?;
        let tree = self.group_tree(group);
        let mut tree = tree.lock().await;
        tree.dirty.insert(leaf);
        Ok(())
    }

    /// The group's root digest in hex, or `None` when the group has no
    /// change history at all.
    pub async fn root_hash(&self, group: &str) -> TidemarkResult<Option<String>> {
        let tree = self.group_tree(group);
        let mut tree = tree.lock().await;
        self.refresh(group, &mut tree).await?;
        Ok(tree.nodes.get("B").map(hex::encode))
    }

    /// The digest of one node (leaf or internal) in hex, if present.
    pub async fn node_hash(&self, group: &str, node: &str) -> TidemarkResult<Option<String>> {
        let tree = self.group_tree(group);
        let mut tree = tree.lock().await;
        self.refresh(group, &mut tree).await?;
        Ok(tree.nodes.get(node).map(hex::encode))
    }

    /// The children of a node as `(id, hex digest)` pairs, in id order.
    ///
    /// Chains with a single child are collapsed: each returned id is the
    /// deepest descendant reachable without passing a branch, so a sparse
    /// tree walks in few steps.
    pub async fn prefix_hashes(
        &self,
        group: &str,
        prefix: &str,
    ) -> TidemarkResult<Vec<(String, String)>> {
        let tree = self.group_tree(group);
        let mut tree = tree.lock().await;
        self.refresh(group, &mut tree).await?;

        let mut out = Vec::new();
        for child in direct_children(&tree.nodes, prefix) {
            let collapsed = collapse(&tree.nodes, child);
            if let Some(digest) = tree.nodes.get(&collapsed) {
                out.push((collapsed, hex::encode(digest)));
            }
        }
        Ok(out)
    }

    /// The ordered change keys inside one leaf block.
    pub async fn block_keys(&self, group: &str, block: &str) -> TidemarkResult<Vec<ChangeKey>> {
        let range = block_range(block).ok_or_else(|| {
            ProtocolError::MalformedMessage(format!("invalid block id: {}", block))
        })?;
        Ok(self.store.block_entries(group, range).await?)
    }

    /// Recompute dirty leaves and rebuild their ancestors bottom-up.
    async fn refresh(&self, group: &str, tree: &mut GroupTree) -> TidemarkResult<()> {
        if tree.dirty.is_empty() {
            return Ok(());
        }
        let dirty = std::mem::take(&mut tree.dirty);
        debug!(group, leaves = dirty.len(), "refreshing hash tree");

        let mut ancestors: BTreeSet<String> = BTreeSet::new();
        for leaf in &dirty {
            let range = block_range(leaf).ok_or_else(|| {
                ProtocolError::MalformedMessage(format!("invalid block id: {}", leaf))
            })?;
            let entries = self.store.block_entries(group, range).await?;
            if entries.is_empty() {
                tree.nodes.remove(leaf);
            } else {
                let digest = *blake3::hash(&canonical_bytes(&entries)?).as_bytes();
                tree.nodes.insert(leaf.clone(), digest);
            }
            let mut prefix = leaf.as_str();
            while prefix.len() > 1 {
                prefix = &prefix[..prefix.len() - 1];
                ancestors.insert(prefix.to_string());
            }
        }

        // Children sort after their parent, so reverse id order visits
        // every node before its ancestors.
        for node in ancestors.iter().rev() {
            let mut children: Vec<(String, String)> = Vec::new();
            for (key, digest) in tree.nodes.range(node.clone()..) {
                if !key.starts_with(node.as_str()) {
                    break;
                }
                if key.len() == node.len() + 1 {
                    children.push((key.clone(), hex::encode(digest)));
                }
            }
            if children.is_empty() {
                tree.nodes.remove(node);
            } else {
                let digest = *blake3::hash(&canonical_bytes(&children)?).as_bytes();
                tree.nodes.insert(node.clone(), digest);
            }
        }
        Ok(())
    }
}

fn direct_children(nodes: &BTreeMap<String, Digest>, prefix: &str) -> Vec<String> {
    let mut out = Vec::new();
    for key in nodes.range(prefix.to_string()..).map(|(k, _)| k) {
        if !key.starts_with(prefix) {
            break;
        }
        if key.len() == prefix.len() + 1 {
            out.push(key.clone());
        }
    }
    out
}

fn collapse(nodes: &BTreeMap<String, Digest>, mut id: String) -> String {
    while id.len() < BLOCK_ID_LEN {
        let children = direct_children(nodes, &id);
        if children.len() != 1 {
            break;
        }
        id = children.into_iter().next().unwrap_or(id);
    }
    id
}
