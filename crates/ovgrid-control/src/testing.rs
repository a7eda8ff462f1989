//! In-memory collaborators for exercising the control plane without a
//! container engine, SDN controller or coordination cluster.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use ovgrid_state::{
    KvBackend, KvPair, MemoryBackend, SnapshotReceiver, StoreError, StoreResult,
};
use parking_lot::Mutex;

use crate::engine::{
    ContainerEngine, ContainerInfo, ContainerSummary, CreateSpec, EndpointNetwork, SwarmNode,
};
use crate::error::{ControlError, ControlResult, NotFound};
use crate::sdn::{SdnController, SdnEndpoint};

#[derive(Debug, Default)]
struct EngineState {
    containers: BTreeMap<String, ContainerInfo>,
    next_id: u32,
    failing_creates: usize,
    failing_renames: usize,
    failing_starts: usize,
    calls: Vec<String>,
}

impl EngineState {
    fn resolve(&self, reference: &str) -> Option<String> {
        let wanted = reference.trim_start_matches('/');
        self.containers
            .values()
            .find(|c| c.id == wanted || c.display_name() == wanted)
            .map(|c| c.id.clone())
    }

    fn get_mut(&mut self, id: &str) -> ControlResult<&mut ContainerInfo> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| NotFound::Container(id.to_string()).into())
    }
}

/// Container engine backed by a map, with injectable failures.
#[derive(Debug, Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a running container attached to `network` on node `node_ip`.
    pub fn add_container(&self, id: &str, name: &str, node_ip: &str) -> ContainerInfo {
        let mut info = ContainerInfo {
            id: id.to_string(),
            name: format!("/{name}"),
            ..Default::default()
        };
        info.config.image = "busybox".into();
        info.config.env = Some(vec!["A=1".into()]);
        info.state.running = true;
        info.host_config.network_mode = "ovnet".into();
        info.network_settings.networks.insert(
            "ovnet".into(),
            EndpointNetwork {
                ip_address: "10.1.0.5".into(),
                ip_prefix_len: 24,
                mac_address: "02:42:0a:01:00:05".into(),
                gateway: "10.1.0.1".into(),
            },
        );
        if !node_ip.is_empty() {
            info.node = Some(SwarmNode {
                id: format!("node-{node_ip}"),
                ip: node_ip.to_string(),
                addr: format!("{node_ip}:2375"),
                name: format!("host-{node_ip}"),
            });
        }
        self.state.lock().containers.insert(id.to_string(), info.clone());
        info
    }

    /// Make the next `n` create calls fail.
    pub fn fail_creates(&self, n: usize) {
        self.state.lock().failing_creates = n;
    }

    /// Make the next `n` rename calls fail.
    pub fn fail_renames(&self, n: usize) {
        self.state.lock().failing_renames = n;
    }

    /// Flip a container's running state without recording a call.
    pub fn set_running(&self, id: &str, running: bool) {
        if let Some(c) = self.state.lock().containers.get_mut(id) {
            c.state.running = running;
        }
    }

    /// Make the next `n` start calls fail.
    pub fn fail_starts(&self, n: usize) {
        self.state.lock().failing_starts = n;
    }

    pub fn container(&self, reference: &str) -> Option<ContainerInfo> {
        let state = self.state.lock();
        let id = state.resolve(reference)?;
        state.containers.get(&id).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn inspect(&self, reference: &str) -> ControlResult<ContainerInfo> {
        let state = self.state.lock();
        state
            .resolve(reference)
            .and_then(|id| state.containers.get(&id).cloned())
            .ok_or_else(|| NotFound::Container(reference.to_string()).into())
    }

    async fn stop(&self, id: &str, _grace: Duration) -> ControlResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("stop {id}"));
        state.get_mut(id)?.state.running = false;
        Ok(())
    }

    async fn rename(&self, id: &str, name: &str) -> ControlResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("rename {id} {name}"));
        if state.failing_renames > 0 {
            state.failing_renames -= 1;
            return Err(ControlError::Engine("rename refused".into()));
        }
        if state.resolve(name).is_some_and(|other| other != id) {
            return Err(ControlError::Engine(format!("name {name} is in use")));
        }
        state.get_mut(id)?.name = format!("/{name}");
        Ok(())
    }

    async fn create(&self, spec: &CreateSpec, name: &str) -> ControlResult<String> {
        let mut state = self.state.lock();
        state.calls.push(format!("create {name}"));
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(ControlError::Engine("create refused".into()));
        }
        if state.resolve(name).is_some() {
            return Err(ControlError::Engine(format!("name {name} is in use")));
        }

        state.next_id += 1;
        let id = format!("new{:04}", state.next_id);
        let mut info = ContainerInfo {
            id: id.clone(),
            name: format!("/{name}"),
            ..Default::default()
        };
        info.config.image = spec.image.clone();
        info.config.env = spec.env.clone();
        info.config.cmd = spec.cmd.clone();
        info.config.tty = spec.tty;
        info.host_config = spec.host_config.clone();
        state.containers.insert(id.clone(), info);
        Ok(id)
    }

    async fn start(&self, id: &str) -> ControlResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("start {id}"));
        if state.failing_starts > 0 {
            state.failing_starts -= 1;
            return Err(ControlError::Engine("start refused".into()));
        }
        state.get_mut(id)?.state.running = true;
        Ok(())
    }

    async fn remove(&self, id: &str, _force: bool) -> ControlResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("remove {id}"));
        state
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| NotFound::Container(id.to_string()).into())
    }

    async fn list(&self) -> ControlResult<Vec<ContainerSummary>> {
        Ok(self
            .state
            .lock()
            .containers
            .values()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![c.name.clone()],
            })
            .collect())
    }
}

/// SDN controller that records every call.
#[derive(Debug, Default)]
pub struct FakeSdn {
    calls: Mutex<Vec<String>>,
    endpoints: Mutex<BTreeMap<String, SdnEndpoint>>,
    unreachable: Mutex<bool>,
}

impl FakeSdn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the controller were down.
    pub fn set_unreachable(&self, down: bool) {
        *self.unreachable.lock() = down;
    }

    pub fn set_endpoint(&self, id: &str, endpoint: SdnEndpoint) {
        self.endpoints.lock().insert(id.to_string(), endpoint);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) -> ControlResult<()> {
        self.calls.lock().push(call);
        if *self.unreachable.lock() {
            return Err(ControlError::Sdn("controller unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SdnController for FakeSdn {
    async fn deregister_container(&self, id: &str) -> ControlResult<()> {
        self.record(format!("deregister {id}"))
    }

    async fn disconnect(&self, source_id: &str, dest_id: &str) -> ControlResult<()> {
        self.record(format!("disconnect {source_id} {dest_id}"))
    }

    async fn container_endpoint(&self, id: &str) -> ControlResult<Option<SdnEndpoint>> {
        self.record(format!("endpoint {id}"))?;
        Ok(self.endpoints.lock().get(id).cloned())
    }
}

// ── Coordination backend ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultOp {
    Put,
    Delete,
}

#[derive(Debug)]
struct Fault {
    op: FaultOp,
    fragment: String,
    remaining: usize,
}

/// [`MemoryBackend`] whose writes can be made to fail by key.
///
/// A fault matches any key containing its fragment and fires `n` times
/// before it is spent.
#[derive(Debug, Default)]
pub struct FaultyBackend {
    inner: MemoryBackend,
    faults: Mutex<Vec<Fault>>,
}

impl FaultyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` puts to keys containing `fragment` fail.
    pub fn fail_puts(&self, fragment: &str, n: usize) {
        self.add_fault(FaultOp::Put, fragment, n);
    }

    /// Make the next `n` deletes of keys containing `fragment` fail.
    pub fn fail_deletes(&self, fragment: &str, n: usize) {
        self.add_fault(FaultOp::Delete, fragment, n);
    }

    fn add_fault(&self, op: FaultOp, fragment: &str, remaining: usize) {
        self.faults.lock().push(Fault {
            op,
            fragment: fragment.to_string(),
            remaining,
        });
    }

    fn check(&self, op: FaultOp, key: &str) -> StoreResult<()> {
        let mut faults = self.faults.lock();
        let hit = faults
            .iter_mut()
            .find(|f| f.op == op && f.remaining > 0 && key.contains(&f.fragment));
        match hit {
            Some(fault) => {
                fault.remaining -= 1;
                Err(StoreError::Write(format!("injected {op:?} failure on {key}")))
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl KvBackend for FaultyBackend {
    fn name(&self) -> &'static str {
        "faulty"
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.check(FaultOp::Put, key)?;
        self.inner.put(key, value).await
    }

    async fn put_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.check(FaultOp::Put, key)?;
        self.inner.put_with_ttl(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<KvPair>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check(FaultOp::Delete, key)?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.inner.exists(key).await
    }

    async fn list(&self, dir: &str) -> StoreResult<Vec<KvPair>> {
        self.inner.list(dir).await
    }

    async fn put_tree(&self, dir: &str) -> StoreResult<()> {
        self.check(FaultOp::Put, dir)?;
        self.inner.put_tree(dir).await
    }

    async fn delete_tree(&self, dir: &str) -> StoreResult<()> {
        self.check(FaultOp::Delete, dir)?;
        self.inner.delete_tree(dir).await
    }

    async fn watch_tree(&self, dir: &str) -> StoreResult<SnapshotReceiver> {
        self.inner.watch_tree(dir).await
    }
}
