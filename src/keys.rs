// API Key 注册表：签发、散列查找、作用域与限流记账、吊销恢复。
use crate::config::RateLimitConfig;
use crate::crypto::hash_secret;
use crate::schemas::Environment;
use crate::storage::{ApiKeyRecord, ApiKeyScopeRecord, StorageBackend};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub const SECRET_PREFIX: &str = "ptw_";
pub const DISPLAY_PREFIX_LEN: usize = 12;

pub const SCOPE_ALL: &str = "all";
pub const SCOPE_SPECIFIC: &str = "specific";

pub const WINDOW_MINUTE: &str = "minute";
pub const WINDOW_DAY: &str = "day";

const MINUTE_WINDOW_S: f64 = 60.0;
const DAY_WINDOW_S: f64 = 86_400.0;

#[derive(Debug, Clone, Deserialize)]
pub struct ScopeSpec {
    pub service_key: String,
    #[serde(default)]
    pub allowed_actions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateKeyRequest {
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_scope_type")]
    pub scope_type: String,
    #[serde(default)]
    pub scopes: Vec<ScopeSpec>,
    #[serde(default)]
    pub allowed_environments: Vec<Environment>,
    #[serde(default)]
    pub rate_limit_per_minute: Option<i64>,
    #[serde(default)]
    pub rate_limit_per_day: Option<i64>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<f64>,
}

fn default_scope_type() -> String {
    SCOPE_ALL.to_string()
}

#[derive(Debug, Clone)]
pub struct CreatedKey {
    pub record: ApiKeyRecord,
    /// 完整明文仅在创建时返回一次，之后不可再取回。
    pub secret: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub minute_limit: i64,
    pub minute_used: i64,
    pub minute_remaining: i64,
    pub minute_resets_at: f64,
    pub day_limit: i64,
    pub day_used: i64,
    pub day_remaining: i64,
    pub day_resets_at: f64,
}

pub struct KeyRegistry {
    storage: Arc<dyn StorageBackend>,
    defaults: RateLimitConfig,
}

impl KeyRegistry {
    pub fn new(storage: Arc<dyn StorageBackend>, defaults: RateLimitConfig) -> Self {
        Self { storage, defaults }
    }

    /// 签发新密钥；specific 作用域行写入失败时回滚删除半成品密钥。
    pub fn create(&self, request: &CreateKeyRequest) -> Result<CreatedKey> {
        let user_id = request.user_id.trim();
        if user_id.is_empty() {
            return Err(anyhow!("user_id is required"));
        }
        let scope_type = request.scope_type.trim().to_lowercase();
        if scope_type != SCOPE_ALL && scope_type != SCOPE_SPECIFIC {
            return Err(anyhow!("unknown scope_type: {scope_type}"));
        }
        if scope_type == SCOPE_SPECIFIC && request.scopes.is_empty() {
            return Err(anyhow!("specific-scoped keys need at least one scope"));
        }

        let secret = generate_secret();
        let now = now_ts();
        let record = ApiKeyRecord {
            id: format!("key_{}", Uuid::new_v4().simple()),
            user_id: user_id.to_string(),
            name: request.name.trim().to_string(),
            key_prefix: secret.chars().take(DISPLAY_PREFIX_LEN).collect(),
            key_hash: hash_secret(&secret),
            scope_type: scope_type.clone(),
            allowed_environments: request
                .allowed_environments
                .iter()
                .map(|env| env.as_str().to_string())
                .collect(),
            rate_limit_per_minute: request
                .rate_limit_per_minute
                .filter(|limit| *limit > 0)
                .unwrap_or(self.defaults.default_per_minute),
            rate_limit_per_day: request
                .rate_limit_per_day
                .filter(|limit| *limit > 0)
                .unwrap_or(self.defaults.default_per_day),
            allowed_ips: request
                .allowed_ips
                .iter()
                .map(|ip| ip.trim().to_string())
                .filter(|ip| !ip.is_empty())
                .collect(),
            expires_at: request.expires_at,
            is_active: true,
            revoked_at: None,
            revoked_reason: None,
            created_at: now,
            last_used_at: None,
        };
        self.storage.create_api_key(&record)?;

        if scope_type == SCOPE_SPECIFIC {
            let scopes = request
                .scopes
                .iter()
                .map(|scope| ApiKeyScopeRecord {
                    api_key_id: record.id.clone(),
                    service_key: scope.service_key.trim().to_string(),
                    allowed_actions: scope
                        .allowed_actions
                        .iter()
                        .map(|action| action.trim().to_string())
                        .filter(|action| !action.is_empty())
                        .collect(),
                })
                .collect::<Vec<_>>();
            if let Err(err) = self.storage.insert_api_key_scopes(&scopes) {
                let _ = self.storage.delete_api_key(&record.id);
                return Err(err);
            }
        }

        Ok(CreatedKey { record, secret })
    }

    /// 按散列查找并校验；未命中/停用/吊销/过期一律对外表现为同一种失败。
    pub fn validate(&self, secret: &str) -> Result<Option<ApiKeyRecord>> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Ok(None);
        }
        let Some(record) = self.storage.get_api_key_by_hash(&hash_secret(secret))? else {
            debug!("api key rejected: unknown hash");
            return Ok(None);
        };
        if !record.is_active {
            match record.revoked_reason.as_deref() {
                Some(reason) => debug!("api key rejected: revoked ({reason})"),
                None => debug!("api key rejected: inactive"),
            }
            return Ok(None);
        }
        if let Some(expires_at) = record.expires_at {
            if expires_at <= now_ts() {
                debug!("api key rejected: expired");
                return Ok(None);
            }
        }
        self.storage.touch_api_key(&record.id, now_ts())?;
        Ok(Some(record))
    }

    pub fn check_service_access(&self, record: &ApiKeyRecord, service_key: &str) -> Result<bool> {
        if record.scope_type == SCOPE_ALL {
            return Ok(true);
        }
        let scopes = self.storage.list_api_key_scopes(&record.id)?;
        Ok(scopes.iter().any(|scope| scope.service_key == service_key))
    }

    pub fn check_action_access(
        &self,
        record: &ApiKeyRecord,
        service_key: &str,
        action: &str,
    ) -> Result<bool> {
        if record.scope_type == SCOPE_ALL {
            return Ok(true);
        }
        let scopes = self.storage.list_api_key_scopes(&record.id)?;
        let Some(scope) = scopes.iter().find(|scope| scope.service_key == service_key) else {
            return Ok(false);
        };
        if scope.allowed_actions.is_empty() {
            return Ok(true);
        }
        Ok(scope.allowed_actions.iter().any(|item| item == action))
    }

    /// 空列表放行全部环境。
    pub fn check_environment_access(record: &ApiKeyRecord, environment: Environment) -> bool {
        if record.allowed_environments.is_empty() {
            return true;
        }
        record
            .allowed_environments
            .iter()
            .any(|item| item == environment.as_str())
    }

    /// 空列表放行全部来源，否则要求逐字匹配。
    pub fn check_ip_access(record: &ApiKeyRecord, client_ip: &str) -> bool {
        if record.allowed_ips.is_empty() {
            return true;
        }
        record.allowed_ips.iter().any(|item| item == client_ip)
    }

    pub fn check_rate_limit(&self, record: &ApiKeyRecord, now: f64) -> Result<RateLimitStatus> {
        let minute_start = (now / MINUTE_WINDOW_S).floor() * MINUTE_WINDOW_S;
        let day_start = (now / DAY_WINDOW_S).floor() * DAY_WINDOW_S;
        let minute_used =
            self.storage
                .get_rate_limit_count(&record.id, WINDOW_MINUTE, minute_start)?;
        let day_used = self
            .storage
            .get_rate_limit_count(&record.id, WINDOW_DAY, day_start)?;
        let minute_remaining = (record.rate_limit_per_minute - minute_used).max(0);
        let day_remaining = (record.rate_limit_per_day - day_used).max(0);
        Ok(RateLimitStatus {
            allowed: minute_remaining > 0 && day_remaining > 0,
            minute_limit: record.rate_limit_per_minute,
            minute_used,
            minute_remaining,
            minute_resets_at: minute_start + MINUTE_WINDOW_S,
            day_limit: record.rate_limit_per_day,
            day_used,
            day_remaining,
            day_resets_at: day_start + DAY_WINDOW_S,
        })
    }

    /// 仅在调用完全通过准入后调用，绝不预扣。
    pub fn increment_rate_limit(&self, record: &ApiKeyRecord, now: f64) -> Result<()> {
        let minute_start = (now / MINUTE_WINDOW_S).floor() * MINUTE_WINDOW_S;
        let day_start = (now / DAY_WINDOW_S).floor() * DAY_WINDOW_S;
        self.storage
            .increment_rate_limit(&record.id, WINDOW_MINUTE, minute_start)?;
        self.storage
            .increment_rate_limit(&record.id, WINDOW_DAY, day_start)?;
        Ok(())
    }

    pub fn revoke(&self, user_id: &str, id: &str, reason: &str) -> Result<ApiKeyRecord> {
        let mut record = self.owned_key(user_id, id)?;
        record.is_active = false;
        record.revoked_at = Some(now_ts());
        record.revoked_reason = Some(reason.trim().to_string());
        self.storage.update_api_key(&record)?;
        Ok(record)
    }

    pub fn reactivate(&self, user_id: &str, id: &str) -> Result<ApiKeyRecord> {
        let mut record = self.owned_key(user_id, id)?;
        record.is_active = true;
        record.revoked_at = None;
        record.revoked_reason = None;
        self.storage.update_api_key(&record)?;
        Ok(record)
    }

    /// 硬删除，不可恢复；作用域行与限流桶一并清理。
    pub fn delete(&self, user_id: &str, id: &str) -> Result<()> {
        let record = self.owned_key(user_id, id)?;
        self.storage.delete_api_key(&record.id)?;
        Ok(())
    }

    pub fn list(&self, user_id: &str) -> Result<Vec<ApiKeyRecord>> {
        self.storage.list_api_keys(user_id)
    }

    pub fn get(&self, user_id: &str, id: &str) -> Result<ApiKeyRecord> {
        self.owned_key(user_id, id)
    }

    pub fn list_scopes(&self, record: &ApiKeyRecord) -> Result<Vec<ApiKeyScopeRecord>> {
        self.storage.list_api_key_scopes(&record.id)
    }

    fn owned_key(&self, user_id: &str, id: &str) -> Result<ApiKeyRecord> {
        let record = self
            .storage
            .get_api_key(id)?
            .ok_or_else(|| anyhow!("api key not found"))?;
        if record.user_id != user_id {
            return Err(anyhow!("api key not found"));
        }
        Ok(record)
    }
}

fn generate_secret() -> String {
    format!(
        "{SECRET_PREFIX}{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    fn registry() -> (KeyRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Arc::new(SqliteStorage::new(
            dir.path().join("keys.db").to_string_lossy().to_string(),
        ));
        storage.ensure_initialized().expect("init storage");
        (
            KeyRegistry::new(storage, RateLimitConfig::default()),
            dir,
        )
    }

    fn all_scope_request() -> CreateKeyRequest {
        CreateKeyRequest {
            user_id: "alice".to_string(),
            name: "ci".to_string(),
            scope_type: SCOPE_ALL.to_string(),
            scopes: Vec::new(),
            allowed_environments: Vec::new(),
            rate_limit_per_minute: None,
            rate_limit_per_day: None,
            allowed_ips: Vec::new(),
            expires_at: None,
        }
    }

    #[test]
    fn created_secret_has_prefix_and_is_not_persisted() {
        let (registry, _dir) = registry();
        let created = registry.create(&all_scope_request()).expect("create");
        assert!(created.secret.starts_with(SECRET_PREFIX));
        assert_eq!(created.record.key_prefix.len(), DISPLAY_PREFIX_LEN);
        assert!(created.secret.starts_with(&created.record.key_prefix));
        assert_ne!(created.record.key_hash, created.secret);
        assert_eq!(created.record.rate_limit_per_minute, 60);
        assert_eq!(created.record.rate_limit_per_day, 10_000);

        let validated = registry
            .validate(&created.secret)
            .expect("validate")
            .expect("valid");
        assert_eq!(validated.id, created.record.id);
        assert!(registry
            .validate("ptw_not_a_real_secret")
            .expect("validate")
            .is_none());
    }

    #[test]
    fn specific_scope_requires_scope_rows() {
        let (registry, _dir) = registry();
        let mut request = all_scope_request();
        request.scope_type = SCOPE_SPECIFIC.to_string();
        assert!(registry.create(&request).is_err());

        request.scopes = vec![ScopeSpec {
            service_key: "stripe".to_string(),
            allowed_actions: vec!["create-charge".to_string()],
        }];
        let created = registry.create(&request).expect("create");
        assert!(registry
            .check_service_access(&created.record, "stripe")
            .expect("check"));
        assert!(!registry
            .check_service_access(&created.record, "github")
            .expect("check"));
        assert!(registry
            .check_action_access(&created.record, "stripe", "create-charge")
            .expect("check"));
        assert!(!registry
            .check_action_access(&created.record, "stripe", "create-customer")
            .expect("check"));
    }

    #[test]
    fn all_scope_passes_every_check() {
        let (registry, _dir) = registry();
        let created = registry.create(&all_scope_request()).expect("create");
        assert!(registry
            .check_service_access(&created.record, "anything")
            .expect("check"));
        assert!(registry
            .check_action_access(&created.record, "anything", "any-action")
            .expect("check"));
        assert!(KeyRegistry::check_environment_access(
            &created.record,
            Environment::Development
        ));
        assert!(KeyRegistry::check_ip_access(&created.record, "10.0.0.1"));
    }

    #[test]
    fn revoke_is_generic_outside_and_reason_stays_queryable() {
        let (registry, _dir) = registry();
        let created = registry.create(&all_scope_request()).expect("create");
        registry
            .revoke("alice", &created.record.id, "compromised")
            .expect("revoke");
        assert!(registry
            .validate(&created.secret)
            .expect("validate")
            .is_none());
        let stored = registry.get("alice", &created.record.id).expect("get");
        assert_eq!(stored.revoked_reason.as_deref(), Some("compromised"));
        assert!(stored.revoked_at.is_some());

        registry
            .reactivate("alice", &created.record.id)
            .expect("reactivate");
        assert!(registry
            .validate(&created.secret)
            .expect("validate")
            .is_some());
    }

    #[test]
    fn expired_keys_fail_validation() {
        let (registry, _dir) = registry();
        let mut request = all_scope_request();
        request.expires_at = Some(now_ts() - 1.0);
        let created = registry.create(&request).expect("create");
        assert!(registry
            .validate(&created.secret)
            .expect("validate")
            .is_none());
    }

    #[test]
    fn ownership_guards_key_mutation() {
        let (registry, _dir) = registry();
        let created = registry.create(&all_scope_request()).expect("create");
        assert!(registry
            .revoke("mallory", &created.record.id, "hijack")
            .is_err());
        assert!(registry.delete("mallory", &created.record.id).is_err());
        registry.delete("alice", &created.record.id).expect("delete");
        assert!(registry
            .validate(&created.secret)
            .expect("validate")
            .is_none());
    }

    #[test]
    fn rate_limit_counts_within_minute_bucket() {
        let (registry, _dir) = registry();
        let mut request = all_scope_request();
        request.rate_limit_per_minute = Some(3);
        let created = registry.create(&request).expect("create");
        let now = 1_700_000_000.0;
        for _ in 0..3 {
            let status = registry
                .check_rate_limit(&created.record, now)
                .expect("check");
            assert!(status.allowed);
            registry
                .increment_rate_limit(&created.record, now)
                .expect("increment");
        }
        let status = registry
            .check_rate_limit(&created.record, now)
            .expect("check");
        assert!(!status.allowed);
        assert_eq!(status.minute_remaining, 0);
        assert_eq!(status.minute_resets_at, 1_700_000_040.0);

        // 下一分钟桶从零开始计数。
        let status = registry
            .check_rate_limit(&created.record, now + 60.0)
            .expect("check");
        assert!(status.allowed);
        assert_eq!(status.minute_used, 0);
    }

    #[test]
    fn environment_allow_list_is_enforced_when_present() {
        let (registry, _dir) = registry();
        let mut request = all_scope_request();
        request.allowed_environments = vec![Environment::Production];
        let created = registry.create(&request).expect("create");
        assert!(KeyRegistry::check_environment_access(
            &created.record,
            Environment::Production
        ));
        assert!(!KeyRegistry::check_environment_access(
            &created.record,
            Environment::Staging
        ));
    }
}
