use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use common::{InstanceId, InstanceRuntime, LeaseList, RegisterQuery, REGISTER_PATH};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::registry::LeaseRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<LeaseRegistry>,
    pub runtime: Arc<dyn InstanceRuntime>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(REGISTER_PATH, get(register).post(register))
        .route("/list", get(list_leases))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Heartbeat from a sidecar. `410 Gone` tells it the instance has
/// disappeared from the runtime and the sidecar must restart.
async fn register(
    State(state): State<AppState>,
    Query(query): Query<RegisterQuery>,
) -> StatusCode {
    let id = match query.cid.filter(|cid| !cid.is_empty()) {
        Some(cid) => InstanceId::new(cid),
        None => return StatusCode::BAD_REQUEST,
    };

    match state.runtime.inspect(&id).await {
        Ok(_) => {
            if state.registry.touch(&id) {
                info!(instance_id = %id, total = state.registry.len(), "Registered instance");
            } else {
                debug!(instance_id = %id, "Heartbeat");
            }
            StatusCode::OK
        }
        Err(e) if e.is_not_found() => {
            info!(instance_id = %id, "Instance no longer exists, signalling sidecar restart");
            state.registry.remove(&id);
            StatusCode::GONE
        }
        Err(e) => {
            warn!(instance_id = %id, error = %e, "Could not verify instance");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn list_leases(State(state): State<AppState>) -> Json<LeaseList> {
    Json(LeaseList {
        leases: state.registry.snapshot(),
    })
}
