// 调用面入口：/portway/invoke 与存活探针。
use crate::api::errors::{error_response_with_detail, status_for_error_code};
use crate::auth;
use crate::schemas::{Environment, RouteContext, RouteRequest};
use crate::state::AppState;
use axum::extract::State;
use axum::http::header::USER_AGENT;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/portway/invoke", post(invoke))
}

async fn healthz() -> Response {
    Json(json!({ "ok": true })).into_response()
}

#[derive(Debug, Deserialize)]
struct InvokePayload {
    service: String,
    action: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    environment: Option<String>,
}

async fn invoke(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<InvokePayload>,
) -> Response {
    let Some(api_key) = auth::extract_api_key(&headers) else {
        return error_response_with_detail(
            StatusCode::UNAUTHORIZED,
            Some("INVALID_API_KEY"),
            "missing API key",
            None,
            None,
        );
    };
    let environment = match payload.environment.as_deref() {
        None => None,
        Some(raw) => match Environment::from_str(raw) {
            Some(environment) => Some(environment),
            None => {
                return error_response_with_detail(
                    StatusCode::BAD_REQUEST,
                    Some("INVALID_ENVIRONMENT"),
                    format!("unknown environment: {raw}"),
                    Some("Use development, staging or production."),
                    None,
                );
            }
        },
    };
    let context = RouteContext {
        api_key,
        client_ip: auth::extract_client_ip(&headers),
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        environment,
    };
    let request = RouteRequest {
        service: payload.service,
        action: payload.action,
        params: payload.params,
    };

    let response = state.router.route(&request, &context).await;
    let status = if response.success {
        StatusCode::OK
    } else {
        response
            .error
            .as_ref()
            .map(|error| status_for_error_code(&error.code))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    };
    (status, Json(response)).into_response()
}
