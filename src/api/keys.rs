// 密钥管理接口：签发、列举、吊销、恢复与删除。
use crate::api::errors::{error_response, error_response_with_detail};
use crate::keys::CreateKeyRequest;
use crate::state::AppState;
use crate::storage::ApiKeyRecord;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/portway/keys", post(create_key).get(list_keys))
        .route("/portway/keys/revoke", post(revoke_key))
        .route("/portway/keys/reactivate", post(reactivate_key))
        .route("/portway/keys/{id}", delete(delete_key).get(get_key))
}

async fn create_key(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateKeyRequest>,
) -> Response {
    match state.keys.create(&request) {
        Ok(created) => Json(json!({
            "ok": true,
            "key": masked_view(&created.record),
            // 完整明文只在这里出现一次。
            "secret": created.secret,
        }))
        .into_response(),
        Err(err) => error_response(StatusCode::BAD_REQUEST, err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: String,
}

async fn list_keys(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Response {
    match state.keys.list(&query.user_id) {
        Ok(records) => {
            let items = records.iter().map(masked_view).collect::<Vec<_>>();
            Json(json!({ "ok": true, "keys": items })).into_response()
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn get_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Response {
    match state.keys.get(&query.user_id, &id) {
        Ok(record) => {
            let scopes = match state.keys.list_scopes(&record) {
                Ok(scopes) => scopes
                    .iter()
                    .map(|scope| {
                        json!({
                            "service_key": scope.service_key,
                            "allowed_actions": scope.allowed_actions,
                        })
                    })
                    .collect::<Vec<_>>(),
                Err(err) => {
                    return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
                }
            };
            Json(json!({ "ok": true, "key": masked_view(&record), "scopes": scopes }))
                .into_response()
        }
        Err(err) => not_found(err),
    }
}

#[derive(Debug, Deserialize)]
struct RevokePayload {
    user_id: String,
    id: String,
    #[serde(default)]
    reason: String,
}

async fn revoke_key(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RevokePayload>,
) -> Response {
    match state
        .keys
        .revoke(&payload.user_id, &payload.id, &payload.reason)
    {
        Ok(record) => Json(json!({ "ok": true, "key": masked_view(&record) })).into_response(),
        Err(err) => not_found(err),
    }
}

#[derive(Debug, Deserialize)]
struct ReactivatePayload {
    user_id: String,
    id: String,
}

async fn reactivate_key(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ReactivatePayload>,
) -> Response {
    match state.keys.reactivate(&payload.user_id, &payload.id) {
        Ok(record) => Json(json!({ "ok": true, "key": masked_view(&record) })).into_response(),
        Err(err) => not_found(err),
    }
}

async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Response {
    match state.keys.delete(&query.user_id, &id) {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(err) => not_found(err),
    }
}

fn not_found(err: anyhow::Error) -> Response {
    error_response_with_detail(
        StatusCode::NOT_FOUND,
        Some("KEY_NOT_FOUND"),
        err.to_string(),
        None,
        None,
    )
}

/// 管理视图：绝不包含散列或明文。
fn masked_view(record: &ApiKeyRecord) -> Value {
    json!({
        "id": record.id,
        "user_id": record.user_id,
        "name": record.name,
        "key_prefix": record.key_prefix,
        "scope_type": record.scope_type,
        "allowed_environments": record.allowed_environments,
        "rate_limit_per_minute": record.rate_limit_per_minute,
        "rate_limit_per_day": record.rate_limit_per_day,
        "allowed_ips": record.allowed_ips,
        "expires_at": record.expires_at,
        "is_active": record.is_active,
        "revoked_at": record.revoked_at,
        "revoked_reason": record.revoked_reason,
        "created_at": record.created_at,
        "last_used_at": record.last_used_at,
    })
}
