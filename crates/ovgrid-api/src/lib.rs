//! ovgrid-api: REST API for the ovgrid control plane.
//!
//! Every route is served under `/api` and again under a version prefix
//! such as `/v1.24/api`, so clients that prefix paths with the container
//! engine's API version reach the same handlers.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/gateways` | List gateways (NAT gateways only, when any exist) |
//! | GET | `/api/gateways/{id}` | Gateway by datapath ID |
//! | GET | `/api/groups` | List groups |
//! | POST | `/api/groups` | Create a group |
//! | GET | `/api/groups/{name}` | List group members |
//! | POST | `/api/groups/{name}` | Add a member |
//! | DELETE | `/api/groups/{name}` | Delete a group |
//! | DELETE | `/api/groups/{name}/{member}` | Remove a member |
//! | GET | `/api/policy` | List policies by container name |
//! | GET | `/api/policy/{peer}` | Get the policy for `A:B` |
//! | POST | `/api/policy/{peer}` | Set the policy for `A:B` |
//! | DELETE | `/api/policy/{peer}` | Delete the policy for `A:B` |
//! | GET | `/api/firewalls` | List firewalls |
//! | POST | `/api/firewalls` | Allocate a firewall |
//! | GET | `/api/firewalls/{key}` | Firewalls of a container |
//! | DELETE | `/api/firewalls/{key}` | Delete a firewall by name |
//! | GET | `/api/firewalls/{key}/{port}` | Firewall at datapath `key`, port |
//! | GET | `/api/containers/{id}` | Container networks with virtual IP |
//! | PUT | `/api/containers/{id}/reset` | Replace a container |

pub mod handlers;

use axum::Router;
use axum::routing::{delete, get, put};
use ovgrid_control::ControlPlane;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub cp: ControlPlane,
}

fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/gateways", get(handlers::list_gateways))
        .route("/gateways/{id}", get(handlers::get_gateway))
        .route("/groups", get(handlers::list_groups).post(handlers::create_group))
        .route(
            "/groups/{name}",
            get(handlers::group_members)
                .post(handlers::add_member)
                .delete(handlers::delete_group),
        )
        .route("/groups/{name}/{member}", delete(handlers::remove_member))
        .route("/policy", get(handlers::list_policies))
        .route(
            "/policy/{peer}",
            get(handlers::get_policy)
                .post(handlers::set_policy)
                .delete(handlers::delete_policy),
        )
        .route("/firewalls", get(handlers::list_firewalls).post(handlers::create_firewall))
        .route(
            "/firewalls/{key}",
            get(handlers::container_firewalls).delete(handlers::delete_firewall),
        )
        .route("/firewalls/{key}/{port}", get(handlers::get_firewall))
        .route("/containers/{id}", get(handlers::show_container))
        .route("/containers/{id}/reset", put(handlers::reset_container))
        .with_state(state)
}

/// Build the complete API router.
pub fn build_router(cp: ControlPlane) -> Router {
    let state = ApiState { cp };
    Router::new()
        .nest("/api", api_routes(state.clone()))
        .nest("/{version}/api", api_routes(state))
}
