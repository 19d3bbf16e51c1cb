// 存储模块：封装 SQLite/Postgres 持久化读写，提供统一的目录/密钥/日志接口。

mod postgres;
mod sqlite;

use crate::config::StorageConfig;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CredentialFieldRule {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InvocationTemplate {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// 凭证字段名到进程环境变量名的映射。
    #[serde(default)]
    pub env_mapping: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinitionRecord {
    pub service_key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub credential_fields: Vec<CredentialFieldRule>,
    #[serde(default)]
    pub invocation: InvocationTemplate,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default = "default_true")]
    pub is_available: bool,
    #[serde(default)]
    pub is_beta: bool,
    #[serde(default)]
    pub created_at: f64,
    #[serde(default)]
    pub updated_at: f64,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct ServiceConfigRecord {
    pub user_id: String,
    pub service_key: String,
    pub environment: String,
    pub encrypted_credentials: String,
    pub is_enabled: bool,
    pub health_status: String,
    pub total_calls: i64,
    pub successful_calls: i64,
    pub failed_calls: i64,
    pub last_used_at: Option<f64>,
    pub created_at: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub key_prefix: String,
    pub key_hash: String,
    pub scope_type: String,
    pub allowed_environments: Vec<String>,
    pub rate_limit_per_minute: i64,
    pub rate_limit_per_day: i64,
    pub allowed_ips: Vec<String>,
    pub expires_at: Option<f64>,
    pub is_active: bool,
    pub revoked_at: Option<f64>,
    pub revoked_reason: Option<String>,
    pub created_at: f64,
    pub last_used_at: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ApiKeyScopeRecord {
    pub api_key_id: String,
    pub service_key: String,
    /// 为空表示该服务下所有动作均被允许。
    pub allowed_actions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct UsageLogRecord {
    pub request_id: String,
    pub user_id: String,
    pub api_key_id: Option<String>,
    pub service_key: String,
    pub action: String,
    pub status: String,
    pub error_code: Option<String>,
    pub total_ms: f64,
    pub pool_acquisition_ms: f64,
    pub external_call_ms: f64,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub response_preview: Option<String>,
    pub created_at: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceListFilter {
    pub category: Option<String>,
    pub search: Option<String>,
    pub include_beta: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UsageLogFilter {
    pub user_id: Option<String>,
    pub service_key: Option<String>,
    pub status: Option<String>,
    pub since: Option<f64>,
    pub until: Option<f64>,
    pub limit: Option<i64>,
}

/// 存储后端抽象，统一封装目录/配置/密钥/限流/日志的持久化读写。
pub trait StorageBackend: Send + Sync {
    fn ensure_initialized(&self) -> Result<()>;

    fn upsert_service_definition(&self, record: &ServiceDefinitionRecord) -> Result<()>;
    fn get_service_definition(&self, service_key: &str) -> Result<Option<ServiceDefinitionRecord>>;
    fn list_service_definitions(
        &self,
        filter: &ServiceListFilter,
    ) -> Result<Vec<ServiceDefinitionRecord>>;
    fn set_service_availability(&self, service_key: &str, available: bool) -> Result<bool>;

    fn upsert_service_config(&self, record: &ServiceConfigRecord) -> Result<()>;
    fn get_service_config(
        &self,
        user_id: &str,
        service_key: &str,
        environment: &str,
    ) -> Result<Option<ServiceConfigRecord>>;
    fn list_service_configs(&self, user_id: &str) -> Result<Vec<ServiceConfigRecord>>;
    fn set_service_config_enabled(
        &self,
        user_id: &str,
        service_key: &str,
        environment: &str,
        enabled: bool,
        updated_at: f64,
    ) -> Result<bool>;
    fn set_service_config_health(
        &self,
        user_id: &str,
        service_key: &str,
        environment: &str,
        health_status: &str,
        updated_at: f64,
    ) -> Result<()>;
    fn record_service_config_usage(
        &self,
        user_id: &str,
        service_key: &str,
        environment: &str,
        success: bool,
        used_at: f64,
    ) -> Result<()>;
    fn delete_service_config(
        &self,
        user_id: &str,
        service_key: &str,
        environment: &str,
    ) -> Result<i64>;

    fn create_api_key(&self, record: &ApiKeyRecord) -> Result<()>;
    fn update_api_key(&self, record: &ApiKeyRecord) -> Result<()>;
    fn get_api_key(&self, id: &str) -> Result<Option<ApiKeyRecord>>;
    fn get_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>>;
    fn list_api_keys(&self, user_id: &str) -> Result<Vec<ApiKeyRecord>>;
    fn touch_api_key(&self, id: &str, last_used_at: f64) -> Result<()>;
    fn delete_api_key(&self, id: &str) -> Result<i64>;
    fn insert_api_key_scopes(&self, scopes: &[ApiKeyScopeRecord]) -> Result<()>;
    fn list_api_key_scopes(&self, api_key_id: &str) -> Result<Vec<ApiKeyScopeRecord>>;

    /// 读取限流桶计数，桶不存在时返回 0。
    fn get_rate_limit_count(
        &self,
        api_key_id: &str,
        window_type: &str,
        window_start: f64,
    ) -> Result<i64>;
    /// 原子自增限流桶并返回新计数。
    fn increment_rate_limit(
        &self,
        api_key_id: &str,
        window_type: &str,
        window_start: f64,
    ) -> Result<i64>;
    fn delete_rate_limit_buckets_before(&self, before: f64) -> Result<i64>;

    fn append_usage_log(&self, record: &UsageLogRecord) -> Result<()>;
    fn load_usage_logs(&self, filter: &UsageLogFilter) -> Result<Vec<UsageLogRecord>>;
}

/// 构建存储后端，根据 backend 配置选择 SQLite/Postgres。
pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    let backend = config.backend.trim().to_lowercase();
    let backend = if backend.is_empty() {
        "sqlite".to_string()
    } else {
        backend
    };
    match backend.as_str() {
        "sqlite" | "default" => Ok(Arc::new(SqliteStorage::new(
            config.db_path.trim().to_string(),
        ))),
        "postgres" | "postgresql" | "pg" | "auto" => Ok(Arc::new(PostgresStorage::new(
            config.postgres.dsn.clone(),
            config.postgres.connect_timeout_s,
            config.postgres.pool_size,
        )?)),
        other => Err(anyhow!("unknown storage backend: {other}")),
    }
}
