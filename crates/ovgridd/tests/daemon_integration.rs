//! Both daemon roles wired over one on-disk store: the agent registers a
//! gateway and reconciles a declared network, the API serves what the
//! agent wrote.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tower::ServiceExt;

use ovgrid_agent::testing::{FakeNode, network_record};
use ovgrid_agent::{AgentConfig, NETWORK_TYPE, NodeAgent, REGISTRATION_TTL};
use ovgrid_control::ControlPlane;
use ovgrid_control::testing::{FakeEngine, FakeSdn};
use ovgrid_state::{BackendOptions, BackendRegistry, Store, keys};

fn open_store(path: &std::path::Path) -> Store {
    let uri = format!("redb://{}", path.display());
    BackendRegistry::with_defaults()
        .open(
            &uri,
            &BackendOptions::default(),
            Duration::from_secs(1),
            REGISTRATION_TTL,
        )
        .unwrap()
}

fn agent_config() -> AgentConfig {
    AgentConfig {
        iface_dev: "eth1".into(),
        iface_ip: "10.0.0.11".into(),
        node_addr: None,
        hostname: "node-1".into(),
        heartbeat: Duration::from_secs(1),
        ttl: Duration::from_secs(3),
    }
}

async fn get_json(router: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn agent_registration_is_visible_through_the_api() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir.path().join("ovgrid.redb"));

    let node = Arc::new(FakeNode::new("ovgrid"));
    let agent = NodeAgent::new(agent_config(), store.clone(), node.clone()).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let agent_handle = tokio::spawn(agent.run(shutdown_rx));

    let engine = Arc::new(FakeEngine::new());
    let cp = ControlPlane::new(store.clone(), engine, Arc::new(FakeSdn::new()), "node-1");
    cp.init().await.unwrap();
    let router = ovgrid_api::build_router(cp);

    let deadline = Instant::now() + Duration::from_secs(5);
    let gateways = loop {
        let (status, body) = get_json(&router, "/api/gateways").await;
        assert_eq!(status, StatusCode::OK);
        if body["data"].as_array().is_some_and(|a| !a.is_empty()) {
            break body["data"].clone();
        }
        assert!(Instant::now() < deadline, "gateway never registered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(gateways[0]["Node"], "10.0.0.11");
    assert_eq!(gateways[0]["DatapathID"], "0000aabbccddeeff");

    let (status, body) = get_json(&router, "/v1.24/api/gateways/0000aabbccddeeff").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["HostName"], "node-1");

    store
        .put(
            &keys::join(&[keys::NETWORKS, "fedcba9876543210"]),
            &network_record("fedcba9876543210", NETWORK_TYPE, &["10.9.0.1/24"]),
        )
        .await
        .unwrap();

    while !node.ports().contains(&"tapfedcba98765".to_string()) {
        assert!(Instant::now() < deadline, "device never created");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(
        node.mutations()
            .contains(&"address tapfedcba98765 10.9.0.1/24".to_string())
    );

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), agent_handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ovgrid.redb");

    {
        let store = open_store(&path);
        let cp = ControlPlane::new(
            store,
            Arc::new(FakeEngine::new()),
            Arc::new(FakeSdn::new()),
            "node-1",
        );
        cp.init().await.unwrap();
        cp.create_group("frontend").await.unwrap();
    }

    let store = open_store(&path);
    let cp = ControlPlane::new(
        store,
        Arc::new(FakeEngine::new()),
        Arc::new(FakeSdn::new()),
        "node-1",
    );
    let router = ovgrid_api::build_router(cp);
    let (status, body) = get_json(&router, "/api/groups").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], serde_json::json!(["frontend"]));
}
