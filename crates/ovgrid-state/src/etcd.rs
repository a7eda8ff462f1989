//! etcd v3 backend over the JSON gateway.
//!
//! Keys and values travel base64-encoded. etcd has no directories, so a
//! directory marker is stored as the key `<dir>/` with an empty value and
//! subtree reads are prefix ranges. TTLs are leases granted per write.
//! Endpoints are tried in order; the first one that answers wins.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use ovgrid_client::{ClientError, HttpClient, Method, TlsOptions};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::{self, KvBackend, KvPair, SnapshotReceiver, TreeNode};
use crate::error::{StoreError, StoreResult};
use crate::keys;

const SNAPSHOT_BUFFER: usize = 16;

#[derive(Debug, Default, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<RawKv>,
}

#[derive(Debug, Deserialize)]
struct RawKv {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct DeleteResponse {
    /// int64 fields are rendered as strings by the gateway.
    #[serde(default)]
    deleted: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LeaseGrantResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct WatchFrame {
    #[serde(default)]
    result: Option<WatchResult>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct WatchResult {
    #[serde(default)]
    events: Vec<Value>,
    #[serde(default)]
    canceled: bool,
}

/// Exclusive upper bound of the range of keys starting with `prefix`.
fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Every byte was 0xff: range to the end of the keyspace.
    vec![0]
}

/// Range bounds covering `key` and every key that starts with it.
fn tree_range(key: &str) -> (Vec<u8>, Vec<u8>) {
    if key.is_empty() {
        (vec![0], vec![0])
    } else {
        (key.as_bytes().to_vec(), prefix_end(key.as_bytes()))
    }
}

fn encode(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

fn decode(text: &str) -> StoreResult<Vec<u8>> {
    B64.decode(text)
        .map_err(|e| StoreError::Deserialize(format!("base64: {e}")))
}

/// etcd client bound to one or more gateway endpoints.
#[derive(Clone)]
pub struct EtcdBackend {
    endpoints: Vec<HttpClient>,
}

impl EtcdBackend {
    /// Build a client for `addrs` (`host:port`), optionally over TLS.
    pub fn connect(addrs: &[String], tls: Option<&TlsOptions>) -> StoreResult<Self> {
        if addrs.is_empty() {
            return Err(StoreError::InvalidUri("etcd needs at least one address".into()));
        }
        let endpoints = addrs
            .iter()
            .map(|addr| HttpClient::new(&format!("tcp://{addr}"), tls))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(endpoints = addrs.len(), tls = tls.is_some(), "etcd backend configured");
        Ok(Self { endpoints })
    }

    /// POST a JSON body to the first endpoint that answers.
    async fn call<T: DeserializeOwned + Default>(&self, path: &str, body: Value) -> StoreResult<T> {
        let mut last = None;
        for client in &self.endpoints {
            match client.post_json(path, Some(&body)).await {
                Ok(resp) => {
                    let resp = resp.error_for_status()?;
                    if resp.body.is_empty() {
                        return Ok(T::default());
                    }
                    return resp.json().map_err(StoreError::from);
                }
                Err(e @ (ClientError::Connect { .. } | ClientError::Timeout(_))) => {
                    warn!(endpoint = %client.endpoint().base_url(), error = %e, "etcd endpoint unavailable");
                    last = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last
            .map(StoreError::from)
            .unwrap_or_else(|| StoreError::Open("no etcd endpoints".into())))
    }

    async fn range(&self, key: &[u8], range_end: Option<&[u8]>) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let mut body = json!({ "key": encode(key) });
        if let Some(end) = range_end {
            body["range_end"] = json!(encode(end));
        }
        let resp: RangeResponse = self.call("/v3/kv/range", body).await?;
        resp.kvs
            .into_iter()
            .map(|kv| {
                let key = String::from_utf8(decode(&kv.key)?)
                    .map_err(|e| StoreError::Deserialize(e.to_string()))?;
                Ok((key, decode(&kv.value)?))
            })
            .collect()
    }

    async fn delete_range(&self, key: &[u8], range_end: Option<&[u8]>) -> StoreResult<u64> {
        let mut body = json!({ "key": encode(key) });
        if let Some(end) = range_end {
            body["range_end"] = json!(encode(end));
        }
        let resp: DeleteResponse = self.call("/v3/kv/deleterange", body).await?;
        Ok(resp
            .deleted
            .and_then(|n| n.parse().ok())
            .unwrap_or_default())
    }

    async fn grant_lease(&self, ttl: Duration) -> StoreResult<String> {
        let secs = ttl.as_secs().max(1);
        let resp: Option<LeaseGrantResponse> =
            self.call("/v3/lease/grant", json!({ "TTL": secs })).await?;
        resp.map(|r| r.id)
            .ok_or_else(|| StoreError::Write("lease grant returned no ID".into()))
    }

    async fn write(&self, key: &str, value: &[u8], lease: Option<String>) -> StoreResult<()> {
        let mut body = json!({ "key": encode(key.as_bytes()), "value": encode(value) });
        if let Some(id) = lease {
            body["lease"] = json!(id);
        }
        let _: Value = self.call("/v3/kv/put", body).await?;
        Ok(())
    }

    /// Entries equal to `key` or below it, with markers mapped to directories.
    async fn subtree(&self, key: &str) -> StoreResult<Vec<TreeNode>> {
        let (start, end) = tree_range(key);
        let prefix = keys::descendant_prefix(key);
        let mut nodes = Vec::new();

        for (raw, value) in self.range(&start, Some(&end)).await? {
            if raw == key {
                nodes.push(TreeNode { key: raw, value: Some(value) });
                continue;
            }
            let in_tree = key.is_empty() || raw.starts_with(&prefix);
            if !in_tree {
                continue;
            }
            match raw.strip_suffix('/') {
                Some(dir) => nodes.push(TreeNode {
                    key: keys::normalize(dir),
                    value: None,
                }),
                None => nodes.push(TreeNode { key: raw, value: Some(value) }),
            }
        }
        Ok(nodes)
    }

    async fn read_snapshot(&self, dir: &str) -> StoreResult<Vec<Vec<u8>>> {
        Ok(backend::snapshot(dir, &self.subtree(dir).await?))
    }

    /// Drive one watch stream, forwarding changed snapshots until the
    /// stream or the consumer goes away.
    async fn run_watch(
        &self,
        dir: &str,
        tx: &mpsc::Sender<StoreResult<Vec<Vec<u8>>>>,
    ) -> StoreResult<()> {
        let (start, end) = tree_range(dir);
        let body = json!({
            "create_request": { "key": encode(&start), "range_end": encode(&end) }
        });
        let body = serde_json::to_vec(&body).map_err(|e| StoreError::Serialize(e.to_string()))?;

        let mut stream = self.open_stream(body).await?;

        let mut last = self.read_snapshot(dir).await?;
        if tx.send(Ok(last.clone())).await.is_err() {
            return Ok(());
        }

        let mut buf: Vec<u8> = Vec::new();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next_chunk() => chunk,
                _ = tx.closed() => return Ok(()),
            };
            let chunk = match chunk {
                Some(chunk) => chunk?,
                None => return Err(StoreError::WatchClosed(dir.to_string())),
            };
            buf.extend_from_slice(&chunk);

            let mut changed = false;
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = line.trim_ascii();
                if line.is_empty() {
                    continue;
                }
                let frame: WatchFrame = serde_json::from_slice(line)
                    .map_err(|e| StoreError::Deserialize(format!("watch frame: {e}")))?;
                if let Some(err) = frame.error {
                    return Err(StoreError::Read(format!("watch error: {err}")));
                }
                if let Some(result) = frame.result {
                    if result.canceled {
                        return Err(StoreError::WatchClosed(dir.to_string()));
                    }
                    changed |= !result.events.is_empty();
                }
            }

            if changed {
                let snapshot = self.read_snapshot(dir).await?;
                if snapshot != last {
                    if tx.send(Ok(snapshot.clone())).await.is_err() {
                        return Ok(());
                    }
                    last = snapshot;
                }
            }
        }
    }

    async fn open_stream(&self, body: Vec<u8>) -> StoreResult<ovgrid_client::BodyStream> {
        let mut last = None;
        for client in &self.endpoints {
            match client.stream(Method::POST, "/v3/watch", Some(body.clone())).await {
                Ok(stream) if stream.status().is_success() => return Ok(stream),
                Ok(stream) => {
                    return Err(StoreError::Read(format!(
                        "watch rejected with status {}",
                        stream.status()
                    )));
                }
                Err(e) => {
                    warn!(endpoint = %client.endpoint().base_url(), error = %e, "etcd watch endpoint unavailable");
                    last = Some(e);
                }
            }
        }
        Err(last
            .map(StoreError::from)
            .unwrap_or_else(|| StoreError::Open("no etcd endpoints".into())))
    }
}

#[async_trait]
impl KvBackend for EtcdBackend {
    fn name(&self) -> &'static str {
        "etcd"
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.write(&keys::normalize(key), value, None).await
    }

    async fn put_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let lease = self.grant_lease(ttl).await?;
        self.write(&keys::normalize(key), value, Some(lease)).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<KvPair>> {
        let key = keys::normalize(key);
        let found = self.range(key.as_bytes(), None).await?;
        Ok(found
            .into_iter()
            .next()
            .map(|(key, value)| KvPair { key, value }))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let key = keys::normalize(key);
        let value = self.delete_range(key.as_bytes(), None).await?;
        let marker = self.delete_range(format!("{key}/").as_bytes(), None).await?;
        Ok(value + marker > 0)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let key = keys::normalize(key);
        Ok(!self.subtree(&key).await?.is_empty())
    }

    async fn list(&self, dir: &str) -> StoreResult<Vec<KvPair>> {
        let dir = keys::normalize(dir);
        Ok(backend::children(&dir, &self.subtree(&dir).await?))
    }

    async fn put_tree(&self, dir: &str) -> StoreResult<()> {
        let dir = keys::normalize(dir);
        if self.get(&dir).await?.is_some() {
            return Ok(());
        }
        self.write(&format!("{dir}/"), &[], None).await
    }

    async fn delete_tree(&self, dir: &str) -> StoreResult<()> {
        let dir = keys::normalize(dir);
        if dir.is_empty() {
            let (start, end) = tree_range("");
            self.delete_range(&start, Some(&end)).await?;
            return Ok(());
        }
        let below = format!("{dir}/");
        self.delete_range(below.as_bytes(), Some(&prefix_end(below.as_bytes())))
            .await?;
        self.delete_range(dir.as_bytes(), None).await?;
        Ok(())
    }

    async fn watch_tree(&self, dir: &str) -> StoreResult<SnapshotReceiver> {
        let dir = keys::normalize(dir);
        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let backend = self.clone();

        tokio::spawn(async move {
            if let Err(e) = backend.run_watch(&dir, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
            debug!(%dir, "etcd watch ended");
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned JSON response and return the request body seen.
    async fn one_shot(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut seen = Vec::new();
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&seen).to_string();
                if let Some((head, body)) = text.split_once("\r\n\r\n") {
                    let len = head
                        .lines()
                        .map(|l| l.to_ascii_lowercase())
                        .find_map(|l| {
                            l.strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if body.len() >= len {
                        let reply = format!(
                            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                            response.len(),
                            response
                        );
                        sock.write_all(reply.as_bytes()).await.unwrap();
                        return body.to_string();
                    }
                }
            }
        });
        (addr, handle)
    }

    #[test]
    fn prefix_end_increments_last_byte() {
        assert_eq!(prefix_end(b"abc"), b"abd".to_vec());
        assert_eq!(prefix_end(b"a\xff"), b"b".to_vec());
        assert_eq!(prefix_end(b"\xff"), vec![0]);
    }

    #[test]
    fn root_range_covers_everything() {
        assert_eq!(tree_range(""), (vec![0], vec![0]));
        assert_eq!(tree_range("a/b"), (b"a/b".to_vec(), b"a/c".to_vec()));
    }

    #[test]
    fn connect_requires_addresses() {
        assert!(EtcdBackend::connect(&[], None).is_err());
    }

    #[tokio::test]
    async fn get_decodes_base64() {
        // key "a/b", value "hello"
        let (addr, server) =
            one_shot(r#"{"header":{},"kvs":[{"key":"YS9i","value":"aGVsbG8="}],"count":"1"}"#).await;
        let kv = EtcdBackend::connect(&[addr], None).unwrap();

        let pair = kv.get("/a/b/").await.unwrap().unwrap();
        assert_eq!(pair.key, "a/b");
        assert_eq!(pair.value, b"hello");

        let body = server.await.unwrap();
        assert!(body.contains(r#""key":"YS9i""#));
    }

    #[tokio::test]
    async fn list_maps_markers_to_directories() {
        // "g/", "g/db" = "x", "g/web/"
        let (addr, _server) = one_shot(
            r#"{"kvs":[{"key":"Zy8="},{"key":"Zy9kYg==","value":"eA=="},{"key":"Zy93ZWIv"}]}"#,
        )
        .await;
        let kv = EtcdBackend::connect(&[addr], None).unwrap();

        let kids = kv.list("g").await.unwrap();
        let names: Vec<_> = kids.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["db", "web"]);
        assert_eq!(kids[0].value, b"x");
        assert!(kids[1].value.is_empty());
    }

    #[tokio::test]
    async fn unreachable_endpoint_falls_through() {
        let dead = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().to_string()
        };
        let (addr, _server) = one_shot(r#"{"header":{}}"#).await;
        let kv = EtcdBackend::connect(&[dead, addr], None).unwrap();

        assert!(kv.get("missing").await.unwrap().is_none());
    }
}
