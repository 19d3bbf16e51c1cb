// 全局状态：存储、目录、凭证库、密钥注册表、执行池与路由器的装配。

use crate::catalog::ServiceCatalog;
use crate::config::Config;
use crate::config_store::ConfigStore;
use crate::crypto::AesGcmCipher;
use crate::executor::{build_executor, HealthProbe};
use crate::keys::KeyRegistry;
use crate::pool::ExecutionPool;
use crate::router::ServiceRouter;
use crate::storage::{build_storage, SqliteStorage, StorageBackend};
use crate::vault::CredentialVault;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub config_store: ConfigStore,
    pub storage: Arc<dyn StorageBackend>,
    pub catalog: Arc<ServiceCatalog>,
    pub vault: Arc<CredentialVault>,
    pub keys: Arc<KeyRegistry>,
    pub pool: Arc<ExecutionPool>,
    pub router: Arc<ServiceRouter>,
}

impl AppState {
    pub fn new(config_store: ConfigStore, config: Config) -> Result<Self> {
        let storage = init_storage(&config)?;
        let catalog = Arc::new(ServiceCatalog::new(storage.clone()));
        let cipher = Arc::new(
            AesGcmCipher::new(&config.vault.encryption_key)
                .context("vault.encryption_key must be configured")?,
        );
        let probe = HealthProbe::new(config.executor.probe_timeout_s)?;
        let vault = Arc::new(CredentialVault::new(
            storage.clone(),
            catalog.clone(),
            cipher,
            probe,
        ));
        let keys = Arc::new(KeyRegistry::new(
            storage.clone(),
            config.rate_limit.clone(),
        ));
        let executor = build_executor(&config.executor)?;
        let pool = Arc::new(ExecutionPool::new(executor, config.pool.clone()));
        let router = Arc::new(ServiceRouter::new(
            storage.clone(),
            catalog.clone(),
            vault.clone(),
            keys.clone(),
            pool.clone(),
        ));
        Ok(Self {
            config_store,
            storage,
            catalog,
            vault,
            keys,
            pool,
            router,
        })
    }

    /// 启动后台维护：空闲单元回收与过期限流桶清理。
    pub fn spawn_maintenance(&self, config: &Config) {
        self.pool.clone().spawn_maintenance();
        let storage = self.storage.clone();
        let retention_s = (config.rate_limit.retention_hours.max(1) as u64) * 3600;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(3600));
            tick.tick().await;
            loop {
                tick.tick().await;
                let cutoff =
                    chrono::Utc::now().timestamp_millis() as f64 / 1000.0 - retention_s as f64;
                match storage.delete_rate_limit_buckets_before(cutoff) {
                    Ok(deleted) if deleted > 0 => {
                        tracing::debug!("rate limit retention removed {deleted} buckets");
                    }
                    Ok(_) => {}
                    Err(err) => warn!("rate limit retention sweep failed: {err}"),
                }
            }
        });
    }
}

fn init_storage(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let backend = config.storage.backend.trim().to_lowercase();
    let backend = if backend.is_empty() {
        "sqlite".to_string()
    } else {
        backend
    };

    match backend.as_str() {
        "sqlite" | "default" => init_storage_strict(config),
        "postgres" | "postgresql" | "pg" => init_storage_strict(config).map_err(|err| {
            anyhow!(
                "postgres storage init failed: {err} (start PostgreSQL or set storage.backend to sqlite/auto)"
            )
        }),
        "auto" => init_storage_auto(config),
        other => Err(anyhow!("unknown storage backend: {other}")),
    }
}

fn init_storage_strict(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let storage = build_storage(&config.storage)?;
    storage.ensure_initialized()?;
    Ok(storage)
}

fn init_storage_auto(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    match init_storage_strict(config) {
        Ok(storage) => Ok(storage),
        Err(err) => {
            warn!("postgres storage unavailable, falling back to sqlite: {err}");
            let sqlite = Arc::new(SqliteStorage::new(config.storage.db_path.clone()));
            sqlite.ensure_initialized()?;
            Ok(sqlite)
        }
    }
}
