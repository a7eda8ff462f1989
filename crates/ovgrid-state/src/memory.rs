//! In-process backend.
//!
//! Keeps every entry in a `BTreeMap` behind a lock. Useful for tests and
//! for running the control plane and an agent inside one process.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::backend::{self, KvBackend, KvPair, SnapshotReceiver, TreeNode};
use crate::error::StoreResult;
use crate::keys;
use crate::watch::{Revisions, spawn_tree_watch};

#[derive(Debug, Clone)]
struct Entry {
    /// `None` marks a directory.
    value: Option<Vec<u8>>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug)]
struct Inner {
    entries: RwLock<BTreeMap<String, Entry>>,
    revisions: Revisions,
}

impl Inner {
    /// Live entries equal to `key` or below it.
    fn subtree(&self, key: &str) -> Vec<TreeNode> {
        let now = Instant::now();
        let prefix = keys::descendant_prefix(key);
        self.entries
            .read()
            .iter()
            .filter(|(k, _)| k.as_str() == key || k.starts_with(&prefix))
            .filter(|(_, e)| e.live(now))
            .map(|(k, e)| TreeNode {
                key: k.clone(),
                value: e.value.clone(),
            })
            .collect()
    }
}

/// Thread-safe in-memory backend.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(BTreeMap::new()),
                revisions: Revisions::new(),
            }),
        }
    }

    /// Number of live value keys (for tests).
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .entries
            .read()
            .values()
            .filter(|e| e.value.is_some() && e.live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn store(&self, key: &str, value: &[u8], ttl: Option<Duration>) {
        let entry = Entry {
            value: Some(value.to_vec()),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.inner.entries.write().insert(keys::normalize(key), entry);
        self.inner.revisions.bump();
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.store(key, value, None);
        Ok(())
    }

    async fn put_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.store(key, value, Some(ttl));
        self.inner.revisions.bump_after(ttl);
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<KvPair>> {
        let key = keys::normalize(key);
        let now = Instant::now();
        let entries = self.inner.entries.read();
        Ok(entries
            .get(&key)
            .filter(|e| e.live(now))
            .and_then(|e| e.value.clone())
            .map(|value| KvPair { key, value }))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let key = keys::normalize(key);
        let existed = self.inner.entries.write().remove(&key).is_some();
        if existed {
            self.inner.revisions.bump();
        }
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let key = keys::normalize(key);
        Ok(!self.inner.subtree(&key).is_empty())
    }

    async fn list(&self, dir: &str) -> StoreResult<Vec<KvPair>> {
        let dir = keys::normalize(dir);
        Ok(backend::children(&dir, &self.inner.subtree(&dir)))
    }

    async fn put_tree(&self, dir: &str) -> StoreResult<()> {
        let dir = keys::normalize(dir);
        let mut entries = self.inner.entries.write();
        let now = Instant::now();
        let present = entries.get(&dir).is_some_and(|e| e.live(now));
        if !present {
            entries.insert(
                dir,
                Entry {
                    value: None,
                    expires_at: None,
                },
            );
            drop(entries);
            self.inner.revisions.bump();
        }
        Ok(())
    }

    async fn delete_tree(&self, dir: &str) -> StoreResult<()> {
        let dir = keys::normalize(dir);
        let prefix = keys::descendant_prefix(&dir);
        let mut entries = self.inner.entries.write();
        let before = entries.len();
        entries.retain(|k, _| *k != dir && !k.starts_with(&prefix));
        let removed = before != entries.len();
        drop(entries);
        if removed {
            self.inner.revisions.bump();
        }
        Ok(())
    }

    async fn watch_tree(&self, dir: &str) -> StoreResult<SnapshotReceiver> {
        let inner = Arc::clone(&self.inner);
        Ok(spawn_tree_watch(
            keys::normalize(dir),
            self.inner.revisions.subscribe(),
            move |dir| Ok(backend::snapshot(dir, &inner.subtree(dir))),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let kv = MemoryBackend::new();
        kv.put("/a/b", b"1").await.unwrap();

        let pair = kv.get("a/b/").await.unwrap().unwrap();
        assert_eq!(pair.key, "a/b");
        assert_eq!(pair.value, b"1");

        assert!(kv.delete("a/b").await.unwrap());
        assert!(!kv.delete("a/b").await.unwrap());
        assert!(kv.get("a/b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn directory_markers() {
        let kv = MemoryBackend::new();
        kv.put_tree("groups/web").await.unwrap();

        assert!(kv.exists("groups/web").await.unwrap());
        assert!(kv.exists("groups").await.unwrap());
        assert!(kv.get("groups/web").await.unwrap().is_none());

        kv.put_tree("groups/web/c1").await.unwrap();
        let members = kv.list("groups/web").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name(), "c1");

        kv.delete_tree("groups/web").await.unwrap();
        assert!(!kv.exists("groups/web").await.unwrap());
        assert!(!kv.exists("groups/web/c1").await.unwrap());
    }

    #[tokio::test]
    async fn put_tree_keeps_existing_value() {
        let kv = MemoryBackend::new();
        kv.put("k", b"v").await.unwrap();
        kv.put_tree("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().unwrap().value, b"v");
    }

    #[tokio::test]
    async fn ttl_expires_lazily() {
        let kv = MemoryBackend::new();
        kv.put_with_ttl("gw/dp1", b"x", Duration::from_millis(20)).await.unwrap();
        kv.put("gw/dp2", b"y").await.unwrap();
        assert!(kv.get("gw/dp1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(kv.get("gw/dp1").await.unwrap().is_none());
        let listed = kv.list("gw").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name(), "dp2");
    }

    #[tokio::test]
    async fn watch_sends_full_snapshots() {
        let kv = MemoryBackend::new();
        kv.put("net/a", b"1").await.unwrap();

        let mut rx = kv.watch_tree("net").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap(), vec![b"1".to_vec()]);

        kv.put("net/b", b"2").await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap().unwrap(),
            vec![b"1".to_vec(), b"2".to_vec()]
        );

        kv.delete("net/a").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap(), vec![b"2".to_vec()]);
    }

    #[tokio::test]
    async fn watch_ignores_unrelated_changes() {
        let kv = MemoryBackend::new();
        let mut rx = kv.watch_tree("net").await.unwrap();
        assert!(rx.recv().await.unwrap().unwrap().is_empty());

        kv.put("elsewhere", b"x").await.unwrap();
        kv.put("net/a", b"1").await.unwrap();

        // The unrelated write produced no snapshot of its own.
        assert_eq!(rx.recv().await.unwrap().unwrap(), vec![b"1".to_vec()]);
    }

    #[tokio::test]
    async fn watch_sees_ttl_expiry() {
        let kv = MemoryBackend::new();
        kv.put("net/a", b"1").await.unwrap();
        kv.put_with_ttl("net/b", b"2", Duration::from_millis(30)).await.unwrap();

        let mut rx = kv.watch_tree("net").await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap().unwrap(),
            vec![b"1".to_vec(), b"2".to_vec()]
        );

        let next = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no snapshot after expiry");
        assert_eq!(next.unwrap().unwrap(), vec![b"1".to_vec()]);
    }
}
