//! Store: the coordination facade handed to the control plane and agents.
//!
//! Wraps a [`KvBackend`] with the discovery URI's key prefix, the
//! instance's registration root and its heartbeat/TTL settings. Every key
//! passed in is relative to the prefix; keys handed back have it stripped.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::backend::{KvBackend, KvPair};
use crate::error::{StoreError, StoreResult};
use crate::keys;
use crate::memory::MemoryBackend;

/// Snapshots buffered per watch session.
const SESSION_BUFFER: usize = 16;

/// Cloneable handle to the shared registry.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn KvBackend>,
    prefix: String,
    root: String,
    heartbeat: Duration,
    ttl: Duration,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("backend", &self.backend.name())
            .field("prefix", &self.prefix)
            .field("root", &self.root)
            .field("heartbeat", &self.heartbeat)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Store {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        prefix: &str,
        root: &str,
        heartbeat: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            backend,
            prefix: keys::normalize(prefix),
            root: keys::normalize(root),
            heartbeat,
            ttl,
        }
    }

    /// Fresh in-memory store rooted at the gateway table, for tests and
    /// single-process setups.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryBackend::new()),
            "",
            keys::GATEWAYS,
            Duration::from_secs(20),
            Duration::ZERO,
        )
    }

    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Registration root, relative to the prefix.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn full(&self, key: &str) -> String {
        keys::join(&[&self.prefix, key])
    }

    fn strip(&self, mut pair: KvPair) -> KvPair {
        if !self.prefix.is_empty()
            && let Some(rest) = pair.key.strip_prefix(&keys::descendant_prefix(&self.prefix))
        {
            pair.key = rest.to_string();
        }
        pair
    }

    /// Create the registration root directory.
    pub async fn init_root(&self) -> StoreResult<()> {
        self.put_tree(&self.root).await
    }

    /// Write `value` under the registration root. A zero TTL means the
    /// entry never expires; otherwise callers re-register before it lapses.
    pub async fn register(&self, id: &str, value: &[u8]) -> StoreResult<()> {
        let key = self.full(&keys::join(&[&self.root, id]));
        if self.ttl.is_zero() {
            self.backend.put(&key, value).await?;
        } else {
            self.backend.put_with_ttl(&key, value, self.ttl).await?;
        }
        debug!(%key, ttl = ?self.ttl, "registered");
        Ok(())
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<KvPair>> {
        Ok(self.backend.get(&self.full(key)).await?.map(|p| self.strip(p)))
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.backend.put(&self.full(key), value).await
    }

    pub async fn put_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.backend.put_with_ttl(&self.full(key), value, ttl).await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.backend.delete(&self.full(key)).await
    }

    pub async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.backend.exists(&self.full(key)).await
    }

    pub async fn list(&self, dir: &str) -> StoreResult<Vec<KvPair>> {
        Ok(self
            .backend
            .list(&self.full(dir))
            .await?
            .into_iter()
            .map(|p| self.strip(p))
            .collect())
    }

    pub async fn put_tree(&self, dir: &str) -> StoreResult<()> {
        self.backend.put_tree(&self.full(dir)).await
    }

    pub async fn delete_tree(&self, dir: &str) -> StoreResult<()> {
        self.backend.delete_tree(&self.full(dir)).await
    }

    /// Read and decode a JSON record. Absent keys are `None`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.get(key).await? {
            Some(pair) => serde_json::from_slice(&pair.value)
                .map(Some)
                .map_err(|e| StoreError::Deserialize(format!("{key}: {e}"))),
            None => Ok(None),
        }
    }

    pub async fn put_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Serialize(e.to_string()))?;
        self.put(key, &bytes).await
    }

    /// Open a watch session on the subtree under `path`.
    ///
    /// Each item on the first channel is the full set of values below
    /// `path`. The session ends for good after one error on the second
    /// channel, or when either channel closes. Flipping `stop` to `true`
    /// (or dropping its sender) ends the session and closes both channels.
    pub async fn watch(
        &self,
        path: &str,
        mut stop: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<Vec<Vec<u8>>>, mpsc::Receiver<StoreError>) {
        let (values_tx, values_rx) = mpsc::channel(SESSION_BUFFER);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let path = self.full(path);

        if *stop.borrow_and_update() {
            return (values_rx, errors_rx);
        }

        let mut snapshots = match self.backend.watch_tree(&path).await {
            Ok(rx) => rx,
            Err(e) => {
                let _ = errors_tx.send(e).await;
                return (values_rx, errors_rx);
            }
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = snapshots.recv() => match item {
                        Some(Ok(values)) => {
                            if values_tx.send(values).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(%path, error = %e, "watch session failed");
                            let _ = errors_tx.send(e).await;
                            break;
                        }
                        None => {
                            let _ = errors_tx.send(StoreError::WatchClosed(path.clone())).await;
                            break;
                        }
                    },
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                    _ = values_tx.closed() => break,
                }
            }
            debug!(%path, "watch session closed");
        });

        (values_rx, errors_rx)
    }
}
