// 配置存储：加载基础配置，支持运行时更新并写回覆盖文件。
use crate::config::{load_config, Config};
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<Config>>,
    override_path: PathBuf,
    version: Arc<AtomicU64>,
}

impl ConfigStore {
    pub fn new(override_path: PathBuf) -> Self {
        let config = load_config();
        Self {
            inner: Arc::new(RwLock::new(config)),
            override_path,
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_config(config: Config, override_path: PathBuf) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
            override_path,
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn get(&self) -> Config {
        self.inner.read().await.clone()
    }

    pub async fn update<F>(&self, updater: F) -> Result<Config>
    where
        F: FnOnce(&mut Config),
    {
        let mut guard = self.inner.write().await;
        updater(&mut guard);
        let updated = guard.clone();
        drop(guard);
        self.version.fetch_add(1, Ordering::SeqCst);
        self.persist(&updated).await?;
        Ok(updated)
    }

    async fn persist(&self, config: &Config) -> Result<()> {
        let text = serde_yaml::to_string(config).unwrap_or_default();
        let target = self.override_path.clone();
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        if let Err(err) = tokio::fs::write(&target, text).await {
            warn!("write override config failed: {}: {err}", target.display());
        }
        Ok(())
    }

    pub fn override_path_default() -> PathBuf {
        let path = std::env::var("PORTWAY_CONFIG_OVERRIDE_PATH")
            .unwrap_or_else(|_| "data/config/portway.override.yaml".to_string());
        Path::new(&path).to_path_buf()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}
