// 凭证库：按 (用户, 服务, 环境) 管理加密凭证与启用状态。
use crate::catalog::ServiceCatalog;
use crate::crypto::CredentialCipher;
use crate::executor::HealthProbe;
use crate::schemas::Environment;
use crate::storage::{ServiceConfigRecord, StorageBackend};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub const HEALTH_UNKNOWN: &str = "unknown";
pub const HEALTH_HEALTHY: &str = "healthy";
pub const HEALTH_UNHEALTHY: &str = "unhealthy";

/// 凭证校验失败：聚合全部违规字段，供接口层展开返回。
#[derive(Debug, Clone)]
pub struct InvalidCredentials {
    pub errors: Vec<String>,
}

impl fmt::Display for InvalidCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid credentials: {}", self.errors.join("; "))
    }
}

impl std::error::Error for InvalidCredentials {}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceConfigSummary {
    pub service_key: String,
    pub environment: String,
    pub is_enabled: bool,
    pub health_status: String,
    pub total_calls: i64,
    pub successful_calls: i64,
    pub failed_calls: i64,
    pub last_used_at: Option<f64>,
    pub updated_at: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub health_status: String,
    pub probed: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

pub struct CredentialVault {
    storage: Arc<dyn StorageBackend>,
    catalog: Arc<ServiceCatalog>,
    cipher: Arc<dyn CredentialCipher>,
    probe: HealthProbe,
}

impl CredentialVault {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        catalog: Arc<ServiceCatalog>,
        cipher: Arc<dyn CredentialCipher>,
        probe: HealthProbe,
    ) -> Self {
        Self {
            storage,
            catalog,
            cipher,
            probe,
        }
    }

    /// 配置或轮换凭证：校验、加密、按三元组 upsert，健康状态回到 unknown。
    pub fn configure(
        &self,
        user_id: &str,
        service_key: &str,
        credentials: &HashMap<String, String>,
        environment: Environment,
        enabled: bool,
    ) -> Result<ServiceConfigRecord> {
        let definition = self
            .catalog
            .get_by_key(service_key)?
            .ok_or_else(|| anyhow!("service not found: {service_key}"))?;
        let check = self.catalog.validate_credentials(&definition, credentials);
        if !check.valid {
            return Err(anyhow::Error::new(InvalidCredentials {
                errors: check.errors,
            }));
        }
        let sealed = self.encrypt_credentials(credentials)?;
        let now = now_ts();
        let record = ServiceConfigRecord {
            user_id: user_id.to_string(),
            service_key: definition.service_key.clone(),
            environment: environment.as_str().to_string(),
            encrypted_credentials: sealed,
            is_enabled: enabled,
            health_status: HEALTH_UNKNOWN.to_string(),
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        };
        self.storage.upsert_service_config(&record)?;
        self.storage
            .get_service_config(user_id, &definition.service_key, environment.as_str())?
            .ok_or_else(|| anyhow!("service config missing after upsert"))
    }

    /// 轮换凭证但保留启用状态，要求配置已存在。
    pub fn update_credentials(
        &self,
        user_id: &str,
        service_key: &str,
        credentials: &HashMap<String, String>,
        environment: Environment,
    ) -> Result<ServiceConfigRecord> {
        let existing = self
            .storage
            .get_service_config(user_id, service_key, environment.as_str())?
            .ok_or_else(|| anyhow!("service not configured: {service_key}"))?;
        self.configure(
            user_id,
            service_key,
            credentials,
            environment,
            existing.is_enabled,
        )
    }

    pub fn toggle(
        &self,
        user_id: &str,
        service_key: &str,
        environment: Environment,
        enabled: bool,
    ) -> Result<bool> {
        self.storage.set_service_config_enabled(
            user_id,
            service_key,
            environment.as_str(),
            enabled,
            now_ts(),
        )
    }

    pub fn delete(
        &self,
        user_id: &str,
        service_key: &str,
        environment: Environment,
    ) -> Result<bool> {
        let deleted =
            self.storage
                .delete_service_config(user_id, service_key, environment.as_str())?;
        Ok(deleted > 0)
    }

    /// 管理面摘要，绝不返回密文。
    pub fn list(&self, user_id: &str) -> Result<Vec<ServiceConfigSummary>> {
        let configs = self.storage.list_service_configs(user_id)?;
        Ok(configs
            .into_iter()
            .map(|record| ServiceConfigSummary {
                service_key: record.service_key,
                environment: record.environment,
                is_enabled: record.is_enabled,
                health_status: record.health_status,
                total_calls: record.total_calls,
                successful_calls: record.successful_calls,
                failed_calls: record.failed_calls,
                last_used_at: record.last_used_at,
                updated_at: record.updated_at,
            })
            .collect())
    }

    pub fn get_config(
        &self,
        user_id: &str,
        service_key: &str,
        environment: Environment,
    ) -> Result<Option<ServiceConfigRecord>> {
        self.storage
            .get_service_config(user_id, service_key, environment.as_str())
    }

    /// 解密为字段映射；无副作用，可并发调用。
    pub fn decrypt_credentials(
        &self,
        record: &ServiceConfigRecord,
    ) -> Result<HashMap<String, String>> {
        let plaintext = self.cipher.decrypt(&record.encrypted_credentials)?;
        let credentials = serde_json::from_str::<HashMap<String, String>>(&plaintext)
            .map_err(|_| anyhow!("decrypted credentials have unexpected shape"))?;
        Ok(credentials)
    }

    /// 仅限内部调用方（路由/执行池）；禁用配置直接拒绝。
    pub fn get_decrypted_credentials(
        &self,
        user_id: &str,
        service_key: &str,
        environment: Environment,
    ) -> Result<HashMap<String, String>> {
        let record = self
            .storage
            .get_service_config(user_id, service_key, environment.as_str())?
            .ok_or_else(|| anyhow!("service not configured: {service_key}"))?;
        if !record.is_enabled {
            return Err(anyhow!("service disabled: {service_key}"));
        }
        self.decrypt_credentials(&record)
    }

    /// 健康探测：2xx 视为 healthy，401/403 返回鉴权失败提示，其余非 2xx 一律失败。
    pub async fn test_connection(
        &self,
        user_id: &str,
        service_key: &str,
        credentials: Option<HashMap<String, String>>,
        environment: Environment,
    ) -> Result<ConnectionReport> {
        let definition = self
            .catalog
            .get_by_key(service_key)?
            .ok_or_else(|| anyhow!("service not found: {service_key}"))?;
        let has_endpoint = definition
            .health_check_url
            .as_deref()
            .map(str::trim)
            .is_some_and(|value| !value.is_empty());
        if !has_endpoint {
            return Ok(ConnectionReport {
                health_status: HEALTH_UNKNOWN.to_string(),
                probed: false,
                message: "service declares no health check endpoint, configuration accepted"
                    .to_string(),
                status_code: None,
            });
        }
        let credentials = match credentials {
            Some(credentials) => credentials,
            None => self.get_decrypted_credentials(user_id, service_key, environment)?,
        };
        let report = match self.probe.probe(&definition, &credentials).await {
            Ok(outcome) => ConnectionReport {
                health_status: if outcome.healthy {
                    HEALTH_HEALTHY.to_string()
                } else {
                    HEALTH_UNHEALTHY.to_string()
                },
                probed: true,
                message: outcome.message,
                status_code: outcome.status_code,
            },
            Err(err) => {
                debug!("health probe transport failure for {service_key}: {err}");
                ConnectionReport {
                    health_status: HEALTH_UNHEALTHY.to_string(),
                    probed: true,
                    message: "health check request failed".to_string(),
                    status_code: None,
                }
            }
        };
        let stored = self
            .storage
            .get_service_config(user_id, service_key, environment.as_str())?;
        if stored.is_some() {
            self.storage.set_service_config_health(
                user_id,
                service_key,
                environment.as_str(),
                &report.health_status,
                now_ts(),
            )?;
        }
        Ok(report)
    }

    /// 路由在调度后回写调用计数。
    pub fn record_outcome(
        &self,
        user_id: &str,
        service_key: &str,
        environment: Environment,
        success: bool,
    ) -> Result<()> {
        self.storage.record_service_config_usage(
            user_id,
            service_key,
            environment.as_str(),
            success,
            now_ts(),
        )
    }

    fn encrypt_credentials(&self, credentials: &HashMap<String, String>) -> Result<String> {
        let plaintext = serde_json::to_string(credentials)?;
        self.cipher.encrypt(&plaintext)
    }
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::credential_field;
    use crate::crypto::AesGcmCipher;
    use crate::storage::{ServiceDefinitionRecord, SqliteStorage};

    fn vault() -> (CredentialVault, Arc<dyn StorageBackend>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage: Arc<dyn StorageBackend> = Arc::new(SqliteStorage::new(
            dir.path().join("vault.db").to_string_lossy().to_string(),
        ));
        storage.ensure_initialized().expect("init storage");
        let catalog = Arc::new(ServiceCatalog::new(storage.clone()));
        catalog
            .add(ServiceDefinitionRecord {
                service_key: "stripe".to_string(),
                name: "Stripe".to_string(),
                description: String::new(),
                category: "payments".to_string(),
                credential_fields: vec![credential_field("api_key", "API Key", true)],
                invocation: Default::default(),
                health_check_url: None,
                is_available: true,
                is_beta: false,
                created_at: 0.0,
                updated_at: 0.0,
            })
            .expect("seed catalog");
        let cipher = Arc::new(AesGcmCipher::new("vault-test-key").expect("cipher"));
        let probe = HealthProbe::new(1).expect("probe");
        (
            CredentialVault::new(storage.clone(), catalog, cipher, probe),
            storage,
            dir,
        )
    }

    fn stripe_credentials() -> HashMap<String, String> {
        HashMap::from([("api_key".to_string(), "sk_live_123".to_string())])
    }

    #[test]
    fn configure_persists_ciphertext_only() {
        let (vault, storage, _dir) = vault();
        let record = vault
            .configure(
                "alice",
                "stripe",
                &stripe_credentials(),
                Environment::Production,
                true,
            )
            .expect("configure");
        assert_eq!(record.health_status, HEALTH_UNKNOWN);
        let stored = storage
            .get_service_config("alice", "stripe", "production")
            .expect("get")
            .expect("some");
        assert!(!stored.encrypted_credentials.contains("sk_live_123"));
        let opened = vault.decrypt_credentials(&stored).expect("decrypt");
        assert_eq!(opened.get("api_key").map(String::as_str), Some("sk_live_123"));
    }

    #[test]
    fn configure_with_missing_required_field_persists_nothing() {
        let (vault, storage, _dir) = vault();
        let err = vault
            .configure(
                "alice",
                "stripe",
                &HashMap::new(),
                Environment::Production,
                true,
            )
            .expect_err("invalid");
        let invalid = err
            .downcast_ref::<InvalidCredentials>()
            .expect("typed error");
        assert!(invalid.errors.iter().any(|e| e.contains("API Key")));
        assert!(storage
            .get_service_config("alice", "stripe", "production")
            .expect("get")
            .is_none());
    }

    #[test]
    fn reconfigure_resets_health_and_keeps_counters() {
        let (vault, storage, _dir) = vault();
        vault
            .configure(
                "alice",
                "stripe",
                &stripe_credentials(),
                Environment::Production,
                true,
            )
            .expect("configure");
        vault
            .record_outcome("alice", "stripe", Environment::Production, true)
            .expect("record");
        storage
            .set_service_config_health("alice", "stripe", "production", HEALTH_HEALTHY, 1.0)
            .expect("health");
        let record = vault
            .configure(
                "alice",
                "stripe",
                &stripe_credentials(),
                Environment::Production,
                false,
            )
            .expect("reconfigure");
        assert_eq!(record.health_status, HEALTH_UNKNOWN);
        assert!(!record.is_enabled);
        assert_eq!(record.total_calls, 1);
        assert_eq!(record.successful_calls, 1);
    }

    #[test]
    fn disabled_config_refuses_decryption_for_internal_callers() {
        let (vault, _storage, _dir) = vault();
        vault
            .configure(
                "alice",
                "stripe",
                &stripe_credentials(),
                Environment::Production,
                false,
            )
            .expect("configure");
        let err = vault
            .get_decrypted_credentials("alice", "stripe", Environment::Production)
            .expect_err("disabled");
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn environments_are_isolated() {
        let (vault, _storage, _dir) = vault();
        vault
            .configure(
                "alice",
                "stripe",
                &stripe_credentials(),
                Environment::Development,
                true,
            )
            .expect("configure dev");
        assert!(vault
            .get_config("alice", "stripe", Environment::Production)
            .expect("get")
            .is_none());
        let summaries = vault.list("alice").expect("list");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].environment, "development");
    }

    #[tokio::test]
    async fn test_connection_without_endpoint_reports_success_without_probe() {
        let (vault, _storage, _dir) = vault();
        vault
            .configure(
                "alice",
                "stripe",
                &stripe_credentials(),
                Environment::Production,
                true,
            )
            .expect("configure");
        let report = vault
            .test_connection("alice", "stripe", None, Environment::Production)
            .await
            .expect("report");
        assert!(!report.probed);
        assert_eq!(report.health_status, HEALTH_UNKNOWN);
    }
}
