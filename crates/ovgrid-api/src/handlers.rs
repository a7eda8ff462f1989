//! REST API handlers.
//!
//! Each handler calls one `ControlPlane` operation and wraps the outcome
//! in the `{success, data?, error?}` envelope.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::error;

use ovgrid_control::{ControlError, ControlResult};
use ovgrid_state::{Firewall, PolicyAction};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn status_for(e: &ControlError) -> StatusCode {
    match e {
        ControlError::Validation(_) => StatusCode::BAD_REQUEST,
        ControlError::Conflict(_) => StatusCode::CONFLICT,
        ControlError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn control_error(e: ControlError) -> Response {
    let status = status_for(&e);
    if status.is_server_error() {
        error!(error = %e, "request failed");
    }
    error_response(&e.to_string(), status).into_response()
}

fn respond<T: Serialize>(result: ControlResult<T>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(e) => control_error(e),
    }
}

// ── Path parameters ────────────────────────────────────────────
//
// Named so the optional `{version}` capture of the outer mount is ignored.

#[derive(Deserialize)]
pub struct IdPath {
    pub id: String,
}

#[derive(Deserialize)]
pub struct NamePath {
    pub name: String,
}

#[derive(Deserialize)]
pub struct MemberPath {
    pub name: String,
    pub member: String,
}

#[derive(Deserialize)]
pub struct PeerPath {
    pub peer: String,
}

#[derive(Deserialize)]
pub struct KeyPath {
    pub key: String,
}

#[derive(Deserialize)]
pub struct NodePortPath {
    pub key: String,
    pub port: u16,
}

// ── Gateways ───────────────────────────────────────────────────

/// GET /api/gateways
pub async fn list_gateways(State(state): State<ApiState>) -> impl IntoResponse {
    respond(state.cp.list_gateways().await)
}

/// GET /api/gateways/{id}
pub async fn get_gateway(
    State(state): State<ApiState>,
    Path(p): Path<IdPath>,
) -> impl IntoResponse {
    respond(state.cp.get_gateway(&p.id).await)
}

// ── Groups ─────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct GroupRequest {
    pub name: String,
}

#[derive(Serialize, Deserialize)]
pub struct MemberRequest {
    pub member: String,
}

/// GET /api/groups
pub async fn list_groups(State(state): State<ApiState>) -> impl IntoResponse {
    respond(state.cp.list_groups().await)
}

/// POST /api/groups
pub async fn create_group(
    State(state): State<ApiState>,
    Json(req): Json<GroupRequest>,
) -> impl IntoResponse {
    match state.cp.create_group(&req.name).await {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(req.name)).into_response(),
        Err(e) => control_error(e),
    }
}

/// GET /api/groups/{name}
pub async fn group_members(
    State(state): State<ApiState>,
    Path(p): Path<NamePath>,
) -> impl IntoResponse {
    respond(state.cp.group_members(&p.name).await)
}

/// POST /api/groups/{name}
pub async fn add_member(
    State(state): State<ApiState>,
    Path(p): Path<NamePath>,
    Json(req): Json<MemberRequest>,
) -> impl IntoResponse {
    match state.cp.add_member(&p.name, &req.member).await {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(req.member)).into_response(),
        Err(e) => control_error(e),
    }
}

/// DELETE /api/groups/{name}
pub async fn delete_group(
    State(state): State<ApiState>,
    Path(p): Path<NamePath>,
) -> impl IntoResponse {
    respond(state.cp.delete_group(&p.name).await.map(|()| "deleted"))
}

/// DELETE /api/groups/{name}/{member}
pub async fn remove_member(
    State(state): State<ApiState>,
    Path(p): Path<MemberPath>,
) -> impl IntoResponse {
    respond(
        state
            .cp
            .remove_member(&p.name, &p.member)
            .await
            .map(|()| "deleted"),
    )
}

// ── Policy ─────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct PolicyRequest {
    pub action: PolicyAction,
}

#[derive(Serialize)]
struct PolicyView {
    peer: String,
    action: PolicyAction,
}

/// GET /api/policy
pub async fn list_policies(State(state): State<ApiState>) -> impl IntoResponse {
    respond(state.cp.list_policies().await)
}

/// GET /api/policy/{peer}
pub async fn get_policy(
    State(state): State<ApiState>,
    Path(p): Path<PeerPath>,
) -> impl IntoResponse {
    match state.cp.get_policy(&p.peer).await {
        Ok(Some(action)) => ApiResponse::ok(PolicyView {
            peer: p.peer,
            action,
        })
        .into_response(),
        Ok(None) => error_response("policy not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => control_error(e),
    }
}

/// POST /api/policy/{peer}
pub async fn set_policy(
    State(state): State<ApiState>,
    Path(p): Path<PeerPath>,
    Json(req): Json<PolicyRequest>,
) -> impl IntoResponse {
    respond(
        state
            .cp
            .set_policy(&p.peer, req.action)
            .await
            .map(|key| PolicyView {
                peer: key.to_string(),
                action: req.action,
            }),
    )
}

/// DELETE /api/policy/{peer}
pub async fn delete_policy(
    State(state): State<ApiState>,
    Path(p): Path<PeerPath>,
) -> impl IntoResponse {
    respond(state.cp.delete_policy(&p.peer).await.map(|()| "deleted"))
}

// ── Firewalls ──────────────────────────────────────────────────

/// GET /api/firewalls
pub async fn list_firewalls(State(state): State<ApiState>) -> impl IntoResponse {
    respond(state.cp.list_firewalls().await)
}

/// POST /api/firewalls
pub async fn create_firewall(
    State(state): State<ApiState>,
    Json(req): Json<Firewall>,
) -> impl IntoResponse {
    match state.cp.create_firewall(req).await {
        Ok(fw) => (StatusCode::CREATED, ApiResponse::ok(fw)).into_response(),
        Err(e) => control_error(e),
    }
}

/// GET /api/firewalls/{key}: `key` is a container ID or name.
pub async fn container_firewalls(
    State(state): State<ApiState>,
    Path(p): Path<KeyPath>,
) -> impl IntoResponse {
    respond(state.cp.firewalls_for_container(&p.key).await)
}

/// DELETE /api/firewalls/{key}: `key` is the firewall name.
pub async fn delete_firewall(
    State(state): State<ApiState>,
    Path(p): Path<KeyPath>,
) -> impl IntoResponse {
    respond(state.cp.delete_firewall(&p.key).await)
}

/// GET /api/firewalls/{key}/{port}: `key` is the datapath ID.
pub async fn get_firewall(
    State(state): State<ApiState>,
    Path(p): Path<NodePortPath>,
) -> impl IntoResponse {
    respond(state.cp.get_firewall(&p.key, p.port).await)
}

// ── Containers ─────────────────────────────────────────────────

/// Reset request body. The body may be empty.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ResetRequest {
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Serialize)]
struct ResetView {
    id: String,
}

/// GET /api/containers/{id}
pub async fn show_container(
    State(state): State<ApiState>,
    Path(p): Path<IdPath>,
) -> impl IntoResponse {
    respond(state.cp.show_container(&p.id).await)
}

/// PUT /api/containers/{id}/reset
pub async fn reset_container(
    State(state): State<ApiState>,
    Path(p): Path<IdPath>,
    body: Bytes,
) -> impl IntoResponse {
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        ResetRequest::default()
    } else {
        match serde_json::from_slice::<ResetRequest>(&body) {
            Ok(req) => req,
            Err(e) => {
                return error_response(&format!("invalid reset request: {e}"), StatusCode::BAD_REQUEST)
                    .into_response();
            }
        }
    };
    respond(
        state
            .cp
            .reset_container(&p.id, req.node.as_deref())
            .await
            .map(|id| ResetView { id }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ovgrid_control::ControlPlane;
    use ovgrid_control::testing::{FakeEngine, FakeSdn};
    use ovgrid_state::{Gateway, Store};

    struct Fixture {
        state: ApiState,
        engine: Arc<FakeEngine>,
    }

    async fn fixture() -> Fixture {
        let engine = Arc::new(FakeEngine::new());
        let cp = ControlPlane::new(
            Store::in_memory(),
            engine.clone(),
            Arc::new(FakeSdn::new()),
            "host-a",
        );
        cp.init().await.unwrap();
        let gw = Gateway {
            node_id: "10.0.0.1".into(),
            host_name: "host-a".into(),
            datapath_id: "dp-a".into(),
            int_dev: "eth0".into(),
            int_ip: "10.0.0.1".into(),
            ext_dev: "eth0".into(),
            ext_ip: "10.0.0.1".into(),
        };
        cp.store().put_json(&gw.table_key(), &gw).await.unwrap();
        engine.add_container("c1", "web", "10.0.0.1");
        engine.add_container("c2", "db", "10.0.0.1");
        Fixture {
            state: ApiState { cp },
            engine,
        }
    }

    fn firewall(name: &str, container: &str, port: u16) -> Firewall {
        Firewall {
            name: name.into(),
            container_id: container.into(),
            gateway_port: port,
            service_port: 80,
            ..Default::default()
        }
    }

    #[test]
    fn error_statuses() {
        use ovgrid_control::{Conflict, NotFound};
        assert_eq!(
            status_for(&ControlError::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Conflict::GroupExists("g".into()).into()),
            StatusCode::CONFLICT
        );
        assert_eq!(status_for(&NotFound::Gateway.into()), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&ControlError::Engine("down".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn gateways() {
        let f = fixture().await;
        let resp = list_gateways(State(f.state.clone())).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let resp = get_gateway(State(f.state.clone()), Path(IdPath { id: "dp-a".into() })).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let resp = get_gateway(State(f.state), Path(IdPath { id: "nope".into() })).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn firewall_create_conflict_and_delete() {
        let f = fixture().await;

        let resp = create_firewall(State(f.state.clone()), Json(firewall("fw1", "web", 8080))).await;
        assert_eq!(resp.into_response().status(), StatusCode::CREATED);

        let resp = create_firewall(State(f.state.clone()), Json(firewall("fw2", "db", 8080))).await;
        assert_eq!(resp.into_response().status(), StatusCode::CONFLICT);

        let resp = create_firewall(State(f.state.clone()), Json(firewall("", "db", 1))).await;
        assert_eq!(resp.into_response().status(), StatusCode::BAD_REQUEST);

        let resp = get_firewall(
            State(f.state.clone()),
            Path(NodePortPath {
                key: "dp-a".into(),
                port: 8080,
            }),
        )
        .await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let resp = delete_firewall(State(f.state.clone()), Path(KeyPath { key: "fw1".into() })).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let resp = delete_firewall(State(f.state), Path(KeyPath { key: "fw1".into() })).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn policy_round_trip() {
        let f = fixture().await;
        let peer = |s: &str| Path(PeerPath { peer: s.into() });

        let resp = set_policy(
            State(f.state.clone()),
            peer("web:db"),
            Json(PolicyRequest {
                action: PolicyAction::Disconnected,
            }),
        )
        .await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let resp = get_policy(State(f.state.clone()), peer("db:web")).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let resp = set_policy(
            State(f.state.clone()),
            peer("web:c1"),
            Json(PolicyRequest {
                action: PolicyAction::Connected,
            }),
        )
        .await;
        assert_eq!(resp.into_response().status(), StatusCode::CONFLICT);

        let resp = get_policy(State(f.state.clone()), peer("web")).await;
        assert_eq!(resp.into_response().status(), StatusCode::BAD_REQUEST);

        let resp = delete_policy(State(f.state.clone()), peer("web:db")).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let resp = get_policy(State(f.state), peer("web:db")).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn groups() {
        let f = fixture().await;
        let resp = create_group(
            State(f.state.clone()),
            Json(GroupRequest { name: "g".into() }),
        )
        .await;
        assert_eq!(resp.into_response().status(), StatusCode::CREATED);

        let resp = create_group(
            State(f.state.clone()),
            Json(GroupRequest { name: "g".into() }),
        )
        .await;
        assert_eq!(resp.into_response().status(), StatusCode::CONFLICT);

        let resp = add_member(
            State(f.state.clone()),
            Path(NamePath { name: "missing".into() }),
            Json(MemberRequest { member: "m".into() }),
        )
        .await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);

        let resp = remove_member(
            State(f.state),
            Path(MemberPath {
                name: "g".into(),
                member: "m".into(),
            }),
        )
        .await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn reset_accepts_empty_body() {
        let f = fixture().await;
        let resp = reset_container(
            State(f.state.clone()),
            Path(IdPath { id: "web".into() }),
            Bytes::new(),
        )
        .await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
        assert_ne!(f.engine.container("web").unwrap().id, "c1");

        let resp = reset_container(
            State(f.state),
            Path(IdPath { id: "db".into() }),
            Bytes::from_static(b"{not json"),
        )
        .await;
        assert_eq!(resp.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
