//! RedbBackend: embedded, persistent coordination backend.
//!
//! Stores registry entries in a redb database on the local host. Suitable
//! for a single-host cluster or as the control plane's own registry; the
//! database supports both on-disk and in-memory backends (the latter for
//! testing). TTLs are enforced lazily: expired keys read as absent.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::backend::{self, KvBackend, KvPair, SnapshotReceiver, TreeNode};
use crate::error::{StoreError, StoreResult};
use crate::keys;
use crate::tables::*;
use crate::watch::{Revisions, spawn_tree_watch};

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

struct Inner {
    db: Database,
    revisions: Revisions,
}

impl Inner {
    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(VALUES).map_err(map_err!(Table))?;
        txn.open_table(DIRECTORIES).map_err(map_err!(Table))?;
        txn.open_table(EXPIRES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Live entries equal to `key` or below it.
    fn subtree(&self, key: &str) -> StoreResult<Vec<TreeNode>> {
        let now = now_millis();
        let prefix = keys::descendant_prefix(key);
        let in_tree = |k: &str| k == key || k.starts_with(&prefix);

        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let values = txn.open_table(VALUES).map_err(map_err!(Table))?;
        let dirs = txn.open_table(DIRECTORIES).map_err(map_err!(Table))?;
        let expires = txn.open_table(EXPIRES).map_err(map_err!(Table))?;

        let mut nodes = Vec::new();

        // Every key of the subtree shares `key` as a string prefix, so the
        // scan stops at the first key that does not.
        for entry in values.range(key..).map_err(map_err!(Read))? {
            let (k, v) = entry.map_err(map_err!(Read))?;
            let k = k.value();
            if !k.starts_with(key) {
                break;
            }
            if !in_tree(k) {
                continue;
            }
            let expired = expires
                .get(k)
                .map_err(map_err!(Read))?
                .is_some_and(|at| at.value() <= now);
            if !expired {
                nodes.push(TreeNode {
                    key: k.to_string(),
                    value: Some(v.value().to_vec()),
                });
            }
        }

        for entry in dirs.range(key..).map_err(map_err!(Read))? {
            let (k, _) = entry.map_err(map_err!(Read))?;
            let k = k.value();
            if !k.starts_with(key) {
                break;
            }
            if in_tree(k) {
                nodes.push(TreeNode {
                    key: k.to_string(),
                    value: None,
                });
            }
        }

        Ok(nodes)
    }
}

/// Thread-safe backend backed by redb.
#[derive(Clone)]
pub struct RedbBackend {
    inner: Arc<Inner>,
}

impl RedbBackend {
    /// Open (or create) a persistent backend at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let backend = Self::from_db(db)?;
        debug!(?path, "redb backend opened");
        Ok(backend)
    }

    /// Create an ephemeral in-memory database (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(map_err!(Open))?;
        let backend = Self::from_db(db)?;
        debug!("in-memory redb backend opened");
        Ok(backend)
    }

    fn store(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        let key = keys::normalize(key);
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut values = txn.open_table(VALUES).map_err(map_err!(Table))?;
            values.insert(key.as_str(), value).map_err(map_err!(Write))?;

            let mut dirs = txn.open_table(DIRECTORIES).map_err(map_err!(Table))?;
            dirs.remove(key.as_str()).map_err(map_err!(Write))?;

            let mut expires = txn.open_table(EXPIRES).map_err(map_err!(Table))?;
            match ttl {
                Some(ttl) => {
                    let at = now_millis() + ttl.as_millis() as u64;
                    expires.insert(key.as_str(), at).map_err(map_err!(Write))?;
                }
                None => {
                    expires.remove(key.as_str()).map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.inner.revisions.bump();
        debug!(%key, "value stored");
        Ok(())
    }

    fn from_db(db: Database) -> StoreResult<Self> {
        let inner = Inner {
            db,
            revisions: Revisions::new(),
        };
        inner.ensure_tables()?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }
}

#[async_trait]
impl KvBackend for RedbBackend {
    fn name(&self) -> &'static str {
        "redb"
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.store(key, value, None)
    }

    async fn put_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.store(key, value, Some(ttl))?;
        self.inner.revisions.bump_after(ttl);
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<KvPair>> {
        let key = keys::normalize(key);
        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let values = txn.open_table(VALUES).map_err(map_err!(Table))?;
        let expires = txn.open_table(EXPIRES).map_err(map_err!(Table))?;

        let expired = expires
            .get(key.as_str())
            .map_err(map_err!(Read))?
            .is_some_and(|at| at.value() <= now_millis());
        if expired {
            return Ok(None);
        }

        match values.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = guard.value().to_vec();
                Ok(Some(KvPair { key, value }))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let key = keys::normalize(key);
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut values = txn.open_table(VALUES).map_err(map_err!(Table))?;
            let mut dirs = txn.open_table(DIRECTORIES).map_err(map_err!(Table))?;
            let mut expires = txn.open_table(EXPIRES).map_err(map_err!(Table))?;
            let had_value = values.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
            let had_dir = dirs.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
            expires.remove(key.as_str()).map_err(map_err!(Write))?;
            existed = had_value || had_dir;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if existed {
            self.inner.revisions.bump();
        }
        debug!(%key, existed, "key deleted");
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let key = keys::normalize(key);
        Ok(!self.inner.subtree(&key)?.is_empty())
    }

    async fn list(&self, dir: &str) -> StoreResult<Vec<KvPair>> {
        let dir = keys::normalize(dir);
        Ok(backend::children(&dir, &self.inner.subtree(&dir)?))
    }

    async fn put_tree(&self, dir: &str) -> StoreResult<()> {
        let dir = keys::normalize(dir);
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        let created;
        {
            let values = txn.open_table(VALUES).map_err(map_err!(Table))?;
            let mut dirs = txn.open_table(DIRECTORIES).map_err(map_err!(Table))?;
            let is_value = values.get(dir.as_str()).map_err(map_err!(Read))?.is_some();
            created = !is_value && dirs.insert(dir.as_str(), ()).map_err(map_err!(Write))?.is_none();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if created {
            self.inner.revisions.bump();
        }
        Ok(())
    }

    async fn delete_tree(&self, dir: &str) -> StoreResult<()> {
        let dir = keys::normalize(dir);
        // Collect keys in a read transaction first.
        let doomed: Vec<String> = self
            .inner
            .subtree(&dir)?
            .into_iter()
            .map(|n| n.key)
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }

        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut values = txn.open_table(VALUES).map_err(map_err!(Table))?;
            let mut dirs = txn.open_table(DIRECTORIES).map_err(map_err!(Table))?;
            let mut expires = txn.open_table(EXPIRES).map_err(map_err!(Table))?;
            for key in &doomed {
                values.remove(key.as_str()).map_err(map_err!(Write))?;
                dirs.remove(key.as_str()).map_err(map_err!(Write))?;
                expires.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.inner.revisions.bump();
        debug!(%dir, removed = doomed.len(), "tree deleted");
        Ok(())
    }

    async fn watch_tree(&self, dir: &str) -> StoreResult<SnapshotReceiver> {
        let inner = Arc::clone(&self.inner);
        Ok(spawn_tree_watch(
            keys::normalize(dir),
            self.inner.revisions.subscribe(),
            move |dir| Ok(backend::snapshot(dir, &inner.subtree(dir)?)),
        ))
    }
}
