// API 路由汇总入口，按领域拆分以保持结构清晰。
pub mod admin;
pub mod catalog;
pub mod core;
pub mod errors;
pub mod keys;
pub mod services;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;

pub fn build_router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(core::router())
        .merge(catalog::router())
        .merge(keys::router())
        .merge(services::router())
        .merge(admin::router())
}
