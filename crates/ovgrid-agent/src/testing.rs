//! Recording stand-ins for the host, used by this crate's tests and by
//! the daemon's integration tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use ovgrid_state::Ipv4Cidr;
use parking_lot::Mutex;
use serde_json::json;

use crate::error::{AgentError, AgentResult};
use crate::exec::CommandRunner;
use crate::host::NodeNetwork;

/// Command runner that records each invocation as one line
/// (`program arg arg ...`) and answers from canned output.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<String>>,
    responses: Mutex<HashMap<String, String>>,
    failing: Mutex<BTreeSet<String>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every call to `program` with `stdout`.
    pub fn respond(&self, program: &str, stdout: &str) {
        self.responses
            .lock()
            .insert(program.to_string(), stdout.to_string());
    }

    /// Make every call to `program` exit non-zero.
    pub fn fail(&self, program: &str) {
        self.failing.lock().insert(program.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[String]) -> AgentResult<String> {
        let line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().push(line);

        if self.failing.lock().contains(program) {
            return Err(AgentError::Command {
                program: program.to_string(),
                args: args.join(" "),
                status: "exit status: 1".into(),
                stderr: "refused".into(),
            });
        }
        Ok(self
            .responses
            .lock()
            .get(program)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct NodeState {
    ports: BTreeMap<String, Option<Ipv4Cidr>>,
    mutations: Vec<String>,
    failing_creates: usize,
}

/// In-memory bridge. Reads are not recorded; every mutation is.
#[derive(Debug)]
pub struct FakeNode {
    bridge: String,
    datapath_id: String,
    state: Mutex<NodeState>,
}

impl FakeNode {
    pub fn new(bridge: &str) -> Self {
        Self {
            bridge: bridge.to_string(),
            datapath_id: "0000aabbccddeeff".to_string(),
            state: Mutex::new(NodeState::default()),
        }
    }

    /// Seed an existing port without recording a mutation.
    pub fn add_port(&self, dev: &str, addr: Option<Ipv4Cidr>) {
        self.state.lock().ports.insert(dev.to_string(), addr);
    }

    pub fn fail_creates(&self, n: usize) {
        self.state.lock().failing_creates = n;
    }

    pub fn ports(&self) -> Vec<String> {
        self.state.lock().ports.keys().cloned().collect()
    }

    pub fn mutations(&self) -> Vec<String> {
        self.state.lock().mutations.clone()
    }
}

#[async_trait]
impl NodeNetwork for FakeNode {
    fn bridge(&self) -> &str {
        &self.bridge
    }

    async fn datapath_id(&self) -> AgentResult<String> {
        Ok(self.datapath_id.clone())
    }

    async fn internal_ports(&self) -> AgentResult<Vec<String>> {
        Ok(self.ports())
    }

    async fn create_port(&self, dev: &str) -> AgentResult<()> {
        let mut state = self.state.lock();
        state.mutations.push(format!("create {dev}"));
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(AgentError::Output {
                program: "ovs-vsctl".into(),
                detail: "create refused".into(),
            });
        }
        state.ports.insert(dev.to_string(), None);
        Ok(())
    }

    async fn delete_port(&self, dev: &str) -> AgentResult<()> {
        let mut state = self.state.lock();
        state.mutations.push(format!("delete {dev}"));
        state.ports.remove(dev);
        Ok(())
    }

    async fn link_up(&self, dev: &str) -> AgentResult<()> {
        self.state.lock().mutations.push(format!("up {dev}"));
        Ok(())
    }

    async fn set_address(&self, dev: &str, cidr: &Ipv4Cidr) -> AgentResult<()> {
        let mut state = self.state.lock();
        state.mutations.push(format!("address {dev} {cidr}"));
        state.ports.insert(dev.to_string(), Some(*cidr));
        Ok(())
    }

    async fn address(&self, dev: &str) -> AgentResult<Option<Ipv4Cidr>> {
        Ok(self.state.lock().ports.get(dev).copied().flatten())
    }

    async fn add_rules(&self, cidr: &Ipv4Cidr) -> AgentResult<()> {
        self.state.lock().mutations.push(format!("add-rules {cidr}"));
        Ok(())
    }

    async fn drop_rules(&self, cidr: &Ipv4Cidr) -> AgentResult<()> {
        self.state.lock().mutations.push(format!("drop-rules {cidr}"));
        Ok(())
    }
}

/// Encode a network record the way the container engine's network layer
/// stores it, with one IPAM entry per gateway address.
pub fn network_record(id: &str, network_type: &str, gateways: &[&str]) -> Vec<u8> {
    let infos: Vec<_> = gateways
        .iter()
        .enumerate()
        .map(|(i, gw)| {
            let data = json!({
                "AddressSpace": "GlobalDefault",
                "Pool": gw,
                "Gateway": gw,
            });
            json!({
                "PoolID": format!("pool-{i}"),
                "Meta": null,
                "IPAMData": data.to_string(),
            })
        })
        .collect();
    let record = json!({
        "id": id,
        "networkType": network_type,
        "ipamV4Info": serde_json::Value::Array(infos).to_string(),
    });
    record.to_string().into_bytes()
}
