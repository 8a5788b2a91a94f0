//! Pod lifecycle endpoints.
//!
//! - POST /api/pods/{id}/deploy  -> 202, pipeline runs detached
//! - POST /api/pods/{id}/stop    -> 200
//! - POST /api/pods/{id}/restart -> 200, stop now, deploy detached
//! - GET  /api/pods/{id}/logs    -> build log or container tail

use crate::{
    errors::AppError,
    handlers::{
        auth::AuthUser,
        extract::{ApiPath, ApiQuery},
    },
    models::pod::Pod,
    services::deploy_service::{DEFAULT_LOG_LINES, PodLogs},
    state::AppState,
};
use axum::{Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Serialize, Debug)]
pub struct StatusResponse {
    pub status: &'static str,
}

#[derive(Deserialize, Debug)]
pub struct LogsQuery {
    pub lines: Option<usize>,
}

/// Load a pod and check the caller owns it.
async fn owned_pod(state: &AppState, user_id: Uuid, pod_id: Uuid) -> Result<Pod, AppError> {
    let pod = state.store.get_pod(pod_id).await?;
    if pod.user_id != user_id {
        return Err(AppError::unauthorized("pod belongs to another user"));
    }
    Ok(pod)
}

/// `POST /api/pods/{id}/deploy`
pub async fn deploy_pod(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    ApiPath(pod_id): ApiPath<Uuid>,
) -> Result<(StatusCode, Json<StatusResponse>), AppError> {
    owned_pod(&state, user_id, pod_id).await?;

    let slot = state.deployer.try_acquire(pod_id)?;
    state.deployer.spawn_deploy(slot);
    info!(pod_id = %pod_id, "deploy accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(StatusResponse { status: "building" }),
    ))
}

/// `POST /api/pods/{id}/stop`
pub async fn stop_pod(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    ApiPath(pod_id): ApiPath<Uuid>,
) -> Result<Json<StatusResponse>, AppError> {
    owned_pod(&state, user_id, pod_id).await?;
    state.deployer.stop(pod_id).await?;
    Ok(Json(StatusResponse { status: "stopped" }))
}

/// `POST /api/pods/{id}/restart`
pub async fn restart_pod(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    ApiPath(pod_id): ApiPath<Uuid>,
) -> Result<Json<StatusResponse>, AppError> {
    owned_pod(&state, user_id, pod_id).await?;
    state.deployer.restart_detached(pod_id).await?;
    info!(pod_id = %pod_id, "restart accepted");
    Ok(Json(StatusResponse {
        status: "restarting",
    }))
}

/// `GET /api/pods/{id}/logs?lines=N`
pub async fn pod_logs(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    ApiPath(pod_id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<LogsQuery>,
) -> Result<Json<PodLogs>, AppError> {
    owned_pod(&state, user_id, pod_id).await?;
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES);
    let logs = state.deployer.get_logs(pod_id, lines).await?;
    Ok(Json(logs))
}

#[cfg(test)]
mod tests {
    use crate::{
        models::pod::PodStatus,
        routes::routes::routes,
        services::pod_store::{PodStore, fixtures::*},
        state::test_support::{TestApp, test_app, test_app_with},
    };
    use axum::{
        body::Body,
        http::{Request, StatusCode, header::AUTHORIZATION},
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::{sync::Arc, time::Duration};
    use tokio::sync::Notify;
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn call(app: &TestApp, method: &str, uri: &str, auth: Option<String>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(auth) = auth {
            req = req.header(AUTHORIZATION, auth);
        }
        let resp = routes()
            .with_state(app.state.clone())
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn deployable(app: &TestApp) -> Uuid {
        let pod = insert_pod(&app.store, app.user_id, Some("https://git.example/app")).await;
        insert_domain(&app.store, pod.id, "app.example.com", 8080).await;
        insert_env_var(&app.store, pod.id, "PORT", "8080").await;
        pod.id
    }

    async fn wait_for_status(app: &TestApp, pod_id: Uuid, want: PodStatus) {
        for _ in 0..200 {
            if app.store.get_pod(pod_id).await.unwrap().status == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pod {} never reached {}", pod_id, want);
    }

    #[tokio::test]
    async fn test_deploy_requires_auth() {
        let app = test_app().await;
        let pod_id = deployable(&app).await;
        let uri = format!("/api/pods/{}/deploy", pod_id);

        let (status, body) = call(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["status"], 401);

        let (status, _) = call(&app, "POST", &uri, Some("Bearer wrong".into())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_other_users_pod_is_rejected() {
        let app = test_app().await;
        let foreign = insert_pod(&app.store, Uuid::new_v4(), Some("https://git.example/x")).await;
        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/pods/{}/deploy", foreign.id),
            Some(app.bearer()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(!app.state.deployer.is_deploying(foreign.id));
    }

    #[tokio::test]
    async fn test_unknown_pod_is_not_found() {
        let app = test_app().await;
        let (status, _) = call(
            &app,
            "GET",
            &format!("/api/pods/{}/logs", Uuid::new_v4()),
            Some(app.bearer()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_deploy_accepted_then_running() {
        let app = test_app().await;
        let pod_id = deployable(&app).await;

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/pods/{}/deploy", pod_id),
            Some(app.bearer()),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "building");

        wait_for_status(&app, pod_id, PodStatus::Running).await;
        app.runtime.state().container_logs = vec!["ready".into()];

        let (status, body) = call(
            &app,
            "GET",
            &format!("/api/pods/{}/logs?lines=5", pod_id),
            Some(app.bearer()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");
        assert_eq!(body["logs"], serde_json::json!(["ready"]));
    }

    #[tokio::test]
    async fn test_second_deploy_conflicts_while_building() {
        let app = test_app().await;
        let pod_id = deployable(&app).await;
        let _slot = app.state.deployer.try_acquire(pod_id).unwrap();

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/pods/{}/deploy", pod_id),
            Some(app.bearer()),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], 409);
        assert_eq!(
            app.store.get_pod(pod_id).await.unwrap().status,
            PodStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_stop_without_container_conflicts() {
        let app = test_app().await;
        let pod_id = deployable(&app).await;
        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/pods/{}/stop", pod_id),
            Some(app.bearer()),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_malformed_path_and_query_are_json_errors() {
        let app = test_app().await;
        let (status, body) =
            call(&app, "POST", "/api/pods/not-a-uuid/deploy", Some(app.bearer())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], 400);
        assert!(body["error"].is_string());

        let pod_id = deployable(&app).await;
        let (status, body) = call(
            &app,
            "GET",
            &format!("/api/pods/{}/logs?lines=many", pod_id),
            Some(app.bearer()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], 400);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_stop_conflicts_while_redeploy_builds() {
        let gate = Arc::new(Notify::new());
        let app = test_app_with({
            let gate = gate.clone();
            move |rt| rt.build_gate = Some(gate)
        })
        .await;
        let pod_id = deployable(&app).await;
        let uri = |action: &str| format!("/api/pods/{}/{}", pod_id, action);

        let (status, _) = call(&app, "POST", &uri("deploy"), Some(app.bearer())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        app.runtime.build_started.notified().await;
        gate.notify_one();
        wait_for_status(&app, pod_id, PodStatus::Running).await;
        while app.state.deployer.is_deploying(pod_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (status, _) = call(&app, "POST", &uri("deploy"), Some(app.bearer())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        app.runtime.build_started.notified().await;

        let (status, body) = call(&app, "POST", &uri("stop"), Some(app.bearer())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], 409);
        assert!(app.runtime.state().stopped.is_empty());

        gate.notify_one();
        wait_for_status(&app, pod_id, PodStatus::Running).await;
        assert_eq!(
            app.store.get_pod(pod_id).await.unwrap().container(),
            Some("container-2")
        );
    }

    #[tokio::test]
    async fn test_stop_and_restart() {
        let app = test_app().await;
        let pod_id = deployable(&app).await;
        app.state
            .deployer
            .deploy(&Default::default(), pod_id)
            .await
            .unwrap();

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/pods/{}/stop", pod_id),
            Some(app.bearer()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "stopped");
        let pod = app.store.get_pod(pod_id).await.unwrap();
        assert_eq!(pod.status, PodStatus::Stopped);
        assert_eq!(pod.container(), Some("container-1"));

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/pods/{}/restart", pod_id),
            Some(app.bearer()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "restarting");

        wait_for_status(&app, pod_id, PodStatus::Running).await;
        assert_eq!(
            app.store.get_pod(pod_id).await.unwrap().container(),
            Some("container-2")
        );
    }

    #[tokio::test]
    async fn test_logs_of_failed_deploy_show_error() {
        let app = test_app().await;
        let pod = insert_pod(&app.store, app.user_id, Some("https://git.example/app")).await;

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/pods/{}/deploy", pod.id),
            Some(app.bearer()),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        wait_for_status(&app, pod.id, PodStatus::Failed).await;

        let (_, body) = call(
            &app,
            "GET",
            &format!("/api/pods/{}/logs", pod.id),
            Some(app.bearer()),
        )
        .await;
        assert_eq!(body["status"], "failed");
        let logs = body["logs"].as_array().unwrap();
        assert_eq!(
            logs.last().unwrap(),
            "ERROR: no domain configured - add a domain first"
        );
    }
}
