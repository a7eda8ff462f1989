//! The coordination backend capability.
//!
//! A backend offers hierarchical key/value operations with explicit
//! directory markers and subtree watches. Backends that have no native
//! notion of directories (etcd v3, plain maps) emulate them; the
//! [`TreeNode`] helpers below give every backend the same view of a
//! subtree.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::StoreResult;
use crate::keys;

/// A key and its value. Directory entries carry an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
}

impl KvPair {
    /// Last segment of the key.
    pub fn name(&self) -> &str {
        keys::last_segment(&self.key)
    }
}

/// Stream of full subtree snapshots produced by [`KvBackend::watch_tree`].
///
/// Every item is the complete, key-ordered list of values below the
/// watched directory. An `Err` item or the channel closing ends the watch.
pub type SnapshotReceiver = mpsc::Receiver<StoreResult<Vec<Vec<u8>>>>;

/// Operations a coordination backend must provide.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Store a value without expiry.
    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Store a value that expires after `ttl` unless re-written.
    async fn put_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()>;

    /// Read a value key. Directory markers read as absent.
    async fn get(&self, key: &str) -> StoreResult<Option<KvPair>>;

    /// Remove a single key. Returns true if it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// True for a value key, a directory marker, or any path with descendants.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Direct children of `dir`, ordered by key.
    async fn list(&self, dir: &str) -> StoreResult<Vec<KvPair>>;

    /// Create a directory marker.
    async fn put_tree(&self, dir: &str) -> StoreResult<()>;

    /// Remove a directory and everything below it.
    async fn delete_tree(&self, dir: &str) -> StoreResult<()>;

    /// Watch the subtree under `dir`. The first snapshot is sent as soon
    /// as the watch is established.
    async fn watch_tree(&self, dir: &str) -> StoreResult<SnapshotReceiver>;
}

/// A live entry as seen by the tree helpers. `value == None` marks a
/// directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TreeNode {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// Direct children of `dir` among `nodes` (which may contain anything).
/// Intermediate directories implied by deeper keys are reported too.
pub(crate) fn children(dir: &str, nodes: &[TreeNode]) -> Vec<KvPair> {
    let prefix = keys::descendant_prefix(dir);
    let mut out: Vec<KvPair> = Vec::new();

    for node in nodes {
        let Some(rest) = node.key.strip_prefix(&prefix) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        let (child, nested) = match rest.split_once('/') {
            Some((child, _)) => (child, true),
            None => (rest, false),
        };
        let key = format!("{prefix}{child}");
        let value = if nested {
            Vec::new()
        } else {
            node.value.clone().unwrap_or_default()
        };

        match out.iter_mut().find(|p| p.key == key) {
            // A direct value wins over an implied directory.
            Some(existing) if !nested => existing.value = value,
            Some(_) => {}
            None => out.push(KvPair { key, value }),
        }
    }

    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

/// Values of every value key strictly below `dir`, ordered by key.
pub(crate) fn snapshot(dir: &str, nodes: &[TreeNode]) -> Vec<Vec<u8>> {
    let prefix = keys::descendant_prefix(dir);
    let mut matching: Vec<&TreeNode> = nodes
        .iter()
        .filter(|n| n.key.starts_with(&prefix) && n.key.len() > prefix.len())
        .filter(|n| n.value.is_some())
        .collect();
    matching.sort_by(|a, b| a.key.cmp(&b.key));
    matching
        .into_iter()
        .filter_map(|n| n.value.clone())
        .collect()
}
