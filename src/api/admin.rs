// 运营接口：目录维护、使用日志查询与池状态快照。
use crate::api::errors::error_response;
use crate::state::AppState;
use crate::storage::{ServiceDefinitionRecord, UsageLogFilter, UsageLogRecord};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/portway/admin/catalog", post(add_service))
        .route("/portway/admin/catalog/{service_key}", put(update_service))
        .route(
            "/portway/admin/catalog/{service_key}/disable",
            post(disable_service),
        )
        .route("/portway/admin/pool", get(pool_snapshot))
        .route("/portway/usage", get(usage_logs))
}

async fn add_service(
    State(state): State<Arc<AppState>>,
    Json(record): Json<ServiceDefinitionRecord>,
) -> Response {
    match state.catalog.add(record) {
        Ok(record) => Json(json!({ "ok": true, "service_key": record.service_key })).into_response(),
        Err(err) => {
            let status = if err.to_string().contains("already exists") {
                StatusCode::CONFLICT
            } else {
                StatusCode::BAD_REQUEST
            };
            error_response(status, err.to_string())
        }
    }
}

async fn update_service(
    State(state): State<Arc<AppState>>,
    Path(service_key): Path<String>,
    Json(mut record): Json<ServiceDefinitionRecord>,
) -> Response {
    record.service_key = service_key;
    match state.catalog.update(record) {
        Ok(record) => Json(json!({ "ok": true, "service_key": record.service_key })).into_response(),
        Err(err) => {
            let status = if err.to_string().contains("not found") {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::BAD_REQUEST
            };
            error_response(status, err.to_string())
        }
    }
}

async fn disable_service(
    State(state): State<Arc<AppState>>,
    Path(service_key): Path<String>,
) -> Response {
    match state.catalog.disable(&service_key) {
        Ok(true) => Json(json!({ "ok": true })).into_response(),
        Ok(false) => error_response(
            StatusCode::NOT_FOUND,
            format!("service not found: {service_key}"),
        ),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn pool_snapshot(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "ok": true, "units": state.pool.snapshot() })).into_response()
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    service_key: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    since: Option<f64>,
    #[serde(default)]
    until: Option<f64>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn usage_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UsageQuery>,
) -> Response {
    let filter = UsageLogFilter {
        user_id: query.user_id,
        service_key: query.service_key,
        status: query.status,
        since: query.since,
        until: query.until,
        limit: query.limit,
    };
    match state.storage.load_usage_logs(&filter) {
        Ok(records) => {
            let items = records.iter().map(log_view).collect::<Vec<_>>();
            Json(json!({ "ok": true, "logs": items })).into_response()
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn log_view(record: &UsageLogRecord) -> Value {
    json!({
        "request_id": record.request_id,
        "user_id": record.user_id,
        "api_key_id": record.api_key_id,
        "service_key": record.service_key,
        "action": record.action,
        "status": record.status,
        "error_code": record.error_code,
        "total_ms": record.total_ms,
        "pool_acquisition_ms": record.pool_acquisition_ms,
        "external_call_ms": record.external_call_ms,
        "client_ip": record.client_ip,
        "user_agent": record.user_agent,
        "response_preview": record.response_preview,
        "created_at": record.created_at,
    })
}
