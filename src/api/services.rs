// 凭证库管理接口：配置、测试、启停与删除用户服务配置。
use crate::api::errors::{error_response, error_response_with_detail};
use crate::schemas::Environment;
use crate::state::AppState;
use crate::vault::InvalidCredentials;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/portway/services", get(list_services))
        .route("/portway/services/configure", post(configure_service))
        .route("/portway/services/test", post(test_service))
        .route("/portway/services/toggle", post(toggle_service))
        .route("/portway/services/{service_key}", delete(delete_service))
}

fn parse_environment(raw: Option<&str>) -> Result<Environment, Response> {
    match raw {
        None => Ok(Environment::default()),
        Some(value) => Environment::from_str(value).ok_or_else(|| {
            error_response_with_detail(
                StatusCode::BAD_REQUEST,
                Some("INVALID_ENVIRONMENT"),
                format!("unknown environment: {value}"),
                Some("Use development, staging or production."),
                None,
            )
        }),
    }
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: String,
}

async fn list_services(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Response {
    match state.vault.list(&query.user_id) {
        Ok(items) => Json(json!({ "ok": true, "services": items })).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct ConfigurePayload {
    user_id: String,
    service_key: String,
    credentials: HashMap<String, String>,
    #[serde(default)]
    environment: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

async fn configure_service(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ConfigurePayload>,
) -> Response {
    let environment = match parse_environment(payload.environment.as_deref()) {
        Ok(environment) => environment,
        Err(response) => return response,
    };
    match state.catalog.get_by_key(&payload.service_key) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response(
                StatusCode::NOT_FOUND,
                format!("service not found: {}", payload.service_key),
            )
        }
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
    match state.vault.configure(
        &payload.user_id,
        &payload.service_key,
        &payload.credentials,
        environment,
        payload.enabled,
    ) {
        Ok(record) => Json(json!({
            "ok": true,
            "service_key": record.service_key,
            "environment": record.environment,
            "is_enabled": record.is_enabled,
            "health_status": record.health_status,
        }))
        .into_response(),
        Err(err) => match err.downcast_ref::<InvalidCredentials>() {
            Some(invalid) => error_response_with_detail(
                StatusCode::UNPROCESSABLE_ENTITY,
                Some("INVALID_CREDENTIALS"),
                "credential validation failed",
                None,
                Some(json!({ "errors": invalid.errors })),
            ),
            None => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        },
    }
}

#[derive(Debug, Deserialize)]
struct TestPayload {
    user_id: String,
    service_key: String,
    #[serde(default)]
    credentials: Option<HashMap<String, String>>,
    #[serde(default)]
    environment: Option<String>,
}

async fn test_service(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TestPayload>,
) -> Response {
    let environment = match parse_environment(payload.environment.as_deref()) {
        Ok(environment) => environment,
        Err(response) => return response,
    };
    match state
        .vault
        .test_connection(
            &payload.user_id,
            &payload.service_key,
            payload.credentials,
            environment,
        )
        .await
    {
        Ok(report) => Json(json!({ "ok": true, "report": report })).into_response(),
        Err(err) => error_response(StatusCode::BAD_REQUEST, err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct TogglePayload {
    user_id: String,
    service_key: String,
    #[serde(default)]
    environment: Option<String>,
    enabled: bool,
}

async fn toggle_service(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TogglePayload>,
) -> Response {
    let environment = match parse_environment(payload.environment.as_deref()) {
        Ok(environment) => environment,
        Err(response) => return response,
    };
    match state.vault.toggle(
        &payload.user_id,
        &payload.service_key,
        environment,
        payload.enabled,
    ) {
        Ok(true) => Json(json!({ "ok": true, "enabled": payload.enabled })).into_response(),
        Ok(false) => error_response(
            StatusCode::NOT_FOUND,
            format!("service not configured: {}", payload.service_key),
        ),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    user_id: String,
    #[serde(default)]
    environment: Option<String>,
}

async fn delete_service(
    State(state): State<Arc<AppState>>,
    Path(service_key): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Response {
    let environment = match parse_environment(query.environment.as_deref()) {
        Ok(environment) => environment,
        Err(response) => return response,
    };
    match state.vault.delete(&query.user_id, &service_key, environment) {
        Ok(true) => Json(json!({ "ok": true })).into_response(),
        Ok(false) => error_response(
            StatusCode::NOT_FOUND,
            format!("service not configured: {service_key}"),
        ),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}
