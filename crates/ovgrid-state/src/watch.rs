//! Snapshot watches for in-process backends.
//!
//! Local backends bump a revision counter on every mutation. A tree watch
//! waits for the counter to move, re-reads the subtree, and forwards the
//! snapshot when it differs from the last one sent. Entries with a TTL
//! expire lazily, so the counter is also moved once each TTL runs out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::backend::SnapshotReceiver;
use crate::error::{StoreError, StoreResult};

/// Buffered snapshots per watch before the producer waits on the consumer.
const SNAPSHOT_BUFFER: usize = 16;

/// Revision counter shared by a local backend and its watches.
#[derive(Debug)]
pub(crate) struct Revisions {
    tx: Arc<watch::Sender<u64>>,
}

impl Revisions {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Record a mutation once `delay` has passed, unless the backend is
    /// gone by then. Must be called from within a tokio runtime.
    pub fn bump_after(&self, delay: Duration) {
        let tx = Arc::downgrade(&self.tx);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                tx.send_modify(|rev| *rev += 1);
            }
        });
    }

    /// Record a mutation.
    pub fn bump(&self) {
        self.tx.send_modify(|rev| *rev += 1);
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

/// Spawn a task that emits a snapshot of `dir` on every relevant change.
///
/// The task ends when the consumer drops the receiver, when the backend
/// (and with it the revision sender) is dropped, or after the first read
/// error, which is forwarded. `read` runs on the blocking pool.
pub(crate) fn spawn_tree_watch<F>(
    dir: String,
    mut revisions: watch::Receiver<u64>,
    read: F,
) -> SnapshotReceiver
where
    F: Fn(&str) -> StoreResult<Vec<Vec<u8>>> + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
    let read = Arc::new(read);

    tokio::spawn(async move {
        let mut last: Option<Vec<Vec<u8>>> = None;
        loop {
            revisions.borrow_and_update();
            let snapshot = {
                let (read, dir) = (Arc::clone(&read), dir.clone());
                tokio::task::spawn_blocking(move || read(&dir))
                    .await
                    .unwrap_or_else(|e| Err(StoreError::Read(format!("snapshot task failed: {e}"))))
            };
            match snapshot {
                Ok(values) => {
                    if last.as_ref() != Some(&values) {
                        if tx.send(Ok(values.clone())).await.is_err() {
                            break;
                        }
                        last = Some(values);
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }

            tokio::select! {
                changed = revisions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tx.closed() => break,
            }
        }
        debug!(%dir, "tree watch ended");
    });

    rx
}
