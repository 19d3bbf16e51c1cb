// 目录只读接口：服务列表与单服务详情。
use crate::api::errors::error_response;
use crate::state::AppState;
use crate::storage::{ServiceDefinitionRecord, ServiceListFilter};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/portway/catalog", get(list_catalog))
        .route("/portway/catalog/{service_key}", get(get_catalog_entry))
}

#[derive(Debug, Deserialize)]
struct CatalogQuery {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    include_beta: bool,
}

async fn list_catalog(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CatalogQuery>,
) -> Response {
    let filter = ServiceListFilter {
        category: query.category,
        search: query.search,
        include_beta: query.include_beta,
    };
    match state.catalog.list(&filter) {
        Ok(records) => {
            let items = records.iter().map(public_view).collect::<Vec<_>>();
            Json(json!({ "ok": true, "services": items })).into_response()
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn get_catalog_entry(
    State(state): State<Arc<AppState>>,
    Path(service_key): Path<String>,
) -> Response {
    match state.catalog.get_by_key(&service_key) {
        Ok(Some(record)) => {
            Json(json!({ "ok": true, "service": public_view(&record) })).into_response()
        }
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            format!("service not found: {service_key}"),
        ),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// 对外视图：凭证字段规则公开，调用模板细节不公开。
fn public_view(record: &ServiceDefinitionRecord) -> Value {
    json!({
        "service_key": record.service_key,
        "name": record.name,
        "description": record.description,
        "category": record.category,
        "credential_fields": record.credential_fields,
        "has_health_check": record
            .health_check_url
            .as_deref()
            .map(str::trim)
            .is_some_and(|value| !value.is_empty()),
        "is_available": record.is_available,
        "is_beta": record.is_beta,
    })
}
