//! Control-plane domain setting.
//!
//! - GET    /api/settings/domain -> `{domain}` or `{domain: null}`
//! - PUT    /api/settings/domain -> validate, persist, rewrite routing file
//! - DELETE /api/settings/domain -> clear setting, remove routing file

use crate::{
    errors::AppError,
    handlers::{auth::AuthUser, extract::ApiJson},
    services::routing_service::{SERVER_DOMAIN_KEY, normalize_domain},
    state::AppState,
};
use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Serialize, Deserialize, Debug)]
pub struct DomainSetting {
    pub domain: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct SetDomainRequest {
    pub domain: String,
}

/// `GET /api/settings/domain`
pub async fn get_server_domain(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
) -> Result<Json<DomainSetting>, AppError> {
    let domain = state.store.get_setting(SERVER_DOMAIN_KEY).await?;
    Ok(Json(DomainSetting { domain }))
}

/// `PUT /api/settings/domain`
pub async fn set_server_domain(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    ApiJson(body): ApiJson<SetDomainRequest>,
) -> Result<Json<DomainSetting>, AppError> {
    let domain = normalize_domain(&body.domain)?;
    state.store.set_setting(SERVER_DOMAIN_KEY, &domain).await?;
    state.routing.set_server_domain(&domain).await?;
    info!(domain = %domain, "server domain updated");
    Ok(Json(DomainSetting {
        domain: Some(domain),
    }))
}

/// `DELETE /api/settings/domain`
pub async fn delete_server_domain(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
) -> Result<Json<DomainSetting>, AppError> {
    if state.store.delete_setting(SERVER_DOMAIN_KEY).await? {
        info!("server domain cleared");
    }
    state.routing.delete_server_domain().await?;
    Ok(Json(DomainSetting { domain: None }))
}

#[cfg(test)]
mod tests {
    use crate::{
        routes::routes::routes,
        services::routing_service::SERVER_ROUTE_FILE,
        state::test_support::{TestApp, test_app},
    };
    use axum::{
        body::Body,
        http::{Request, StatusCode, header::AUTHORIZATION, header::CONTENT_TYPE},
    };
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    async fn call(app: &TestApp, method: &str, body: Option<Value>) -> (StatusCode, Value) {
        call_raw(app, method, body.map(|v| v.to_string())).await
    }

    async fn call_raw(app: &TestApp, method: &str, body: Option<String>) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri("/api/settings/domain")
            .header(AUTHORIZATION, app.bearer())
            .header(CONTENT_TYPE, "application/json");
        let body = match body {
            Some(text) => Body::from(text),
            None => Body::empty(),
        };
        let resp = routes()
            .with_state(app.state.clone())
            .oneshot(req.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_set_get_delete_domain() {
        let app = test_app().await;
        let file = app.routing_dir.path().join(SERVER_ROUTE_FILE);

        let (status, body) = call(&app, "GET", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"domain": null}));

        let (status, body) =
            call(&app, "PUT", Some(json!({"domain": "Panel.Example.com."}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["domain"], "panel.example.com");
        let written = std::fs::read_to_string(&file).unwrap();
        assert!(written.contains("Host(`panel.example.com`)"));

        let (_, body) = call(&app, "GET", None).await;
        assert_eq!(body["domain"], "panel.example.com");

        let (status, body) = call(&app, "DELETE", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"domain": null}));
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_invalid_domain_rejected() {
        let app = test_app().await;
        let (status, body) = call(&app, "PUT", Some(json!({"domain": "not a host"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], 400);
        assert!(
            !app.routing_dir
                .path()
                .join(SERVER_ROUTE_FILE)
                .exists()
        );
    }

    #[tokio::test]
    async fn test_bad_request_bodies_are_json_errors() {
        let app = test_app().await;

        let (status, body) = call(&app, "PUT", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], 400);
        assert!(body["error"].as_str().unwrap().contains("domain"));

        let (status, body) = call_raw(&app, "PUT", Some("{\"domain\":".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], 400);
        assert!(body["error"].is_string());

        let (_, body) = call(&app, "GET", None).await;
        assert_eq!(body, json!({"domain": null}));
    }
}
