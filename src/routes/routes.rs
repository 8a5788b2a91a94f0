//! Defines the HTTP surface of the control plane.
//!
//! ## Structure
//! - **Public**
//!   - `GET    /api/health`: liveness + version
//!   - `GET    /api/readyz`: readiness checks
//!
//! - **Pod lifecycle** (bearer token, owner only)
//!   - `POST   /api/pods/{id}/deploy`
//!   - `POST   /api/pods/{id}/stop`
//!   - `POST   /api/pods/{id}/restart`
//!   - `GET    /api/pods/{id}/logs?lines=N`
//!
//! - **Settings** (bearer token)
//!   - `GET | PUT | DELETE /api/settings/domain`

use crate::{
    handlers::{
        health_handlers::{health, readyz},
        pod_handlers::{deploy_pod, pod_logs, restart_pod, stop_pod},
        settings_handlers::{delete_server_domain, get_server_domain, set_server_domain},
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router. State is supplied by the caller with `with_state`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/readyz", get(readyz))
        .route("/api/pods/{id}/deploy", post(deploy_pod))
        .route("/api/pods/{id}/stop", post(stop_pod))
        .route("/api/pods/{id}/restart", post(restart_pod))
        .route("/api/pods/{id}/logs", get(pod_logs))
        .route(
            "/api/settings/domain",
            get(get_server_domain)
                .put(set_server_domain)
                .delete(delete_server_domain),
        )
}
