// 配置读取与覆盖合并，保持与 YAML 配置格式兼容。
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    pub fn operator_key(&self) -> Option<String> {
        self.security
            .api_key
            .as_ref()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorsConfig {
    pub allow_origins: Option<Vec<String>>,
    pub allow_methods: Option<Vec<String>>,
    pub allow_headers: Option<Vec<String>>,
    pub allow_credentials: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: String,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default)]
    pub postgres: PostgresConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            db_path: default_db_path(),
            postgres: PostgresConfig::default(),
        }
    }
}

fn default_db_path() -> String {
    "./data/portway.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    #[serde(default)]
    pub dsn: String,
    #[serde(default = "default_pg_connect_timeout")]
    pub connect_timeout_s: u64,
    #[serde(default = "default_pg_pool_size")]
    pub pool_size: usize,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            connect_timeout_s: default_pg_connect_timeout(),
            pool_size: default_pg_pool_size(),
        }
    }
}

fn default_pg_connect_timeout() -> u64 {
    5
}

fn default_pg_pool_size() -> usize {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VaultConfig {
    /// 凭证加密主密钥，生产环境必须通过配置或环境变量覆盖。
    #[serde(default)]
    pub encryption_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_processes_per_user: usize,
    pub max_total_processes: usize,
    pub idle_timeout_s: u64,
    pub sweep_interval_s: u64,
    pub execute_timeout_s: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_processes_per_user: 10,
            max_total_processes: 100,
            idle_timeout_s: 300,
            sweep_interval_s: 60,
            execute_timeout_s: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub default_per_minute: i64,
    pub default_per_day: i64,
    /// 过期限流桶的保留时长，超过后由后台清理。
    pub retention_hours: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_per_minute: 60,
            default_per_day: 10_000,
            retention_hours: 48,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_executor_mode")]
    pub mode: String,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_s: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: default_executor_mode(),
            probe_timeout_s: default_probe_timeout(),
        }
    }
}

fn default_executor_mode() -> String {
    "simulated".to_string()
}

fn default_probe_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn config_path_default() -> String {
    std::env::var("PORTWAY_CONFIG_PATH").unwrap_or_else(|_| "config/portway.yaml".to_string())
}

/// 读取基础配置文件，文件缺失时回退到默认配置。
pub fn load_config() -> Config {
    let path = config_path_default();
    let mut config = read_config_file(&path).unwrap_or_default();
    apply_env_overrides(&mut config);
    config
}

fn read_config_file(path: &str) -> Option<Config> {
    let target = Path::new(path);
    if !target.exists() {
        return None;
    }
    let text = match fs::read_to_string(target) {
        Ok(text) => text,
        Err(err) => {
            warn!("read config failed: {path}: {err}");
            return None;
        }
    };
    match serde_yaml::from_str::<Config>(&text) {
        Ok(config) => Some(config),
        Err(err) => {
            warn!("parse config failed: {path}: {err}");
            None
        }
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(value) = std::env::var("PORTWAY_HOST") {
        if !value.trim().is_empty() {
            config.server.host = value.trim().to_string();
        }
    }
    if let Ok(value) = std::env::var("PORTWAY_PORT") {
        if let Ok(port) = value.trim().parse::<u16>() {
            config.server.port = port;
        }
    }
    if let Ok(value) = std::env::var("PORTWAY_DB_PATH") {
        if !value.trim().is_empty() {
            config.storage.db_path = value.trim().to_string();
        }
    }
    if let Ok(value) = std::env::var("PORTWAY_API_KEY") {
        if !value.trim().is_empty() {
            config.security.api_key = Some(value.trim().to_string());
        }
    }
    if let Ok(value) = std::env::var("PORTWAY_ENCRYPTION_KEY") {
        if !value.trim().is_empty() {
            config.vault.encryption_key = value.trim().to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_documented_limits() {
        let config = Config::default();
        assert_eq!(config.rate_limit.default_per_minute, 60);
        assert_eq!(config.rate_limit.default_per_day, 10_000);
        assert_eq!(config.pool.max_processes_per_user, 10);
        assert_eq!(config.pool.max_total_processes, 100);
        assert_eq!(config.pool.idle_timeout_s, 300);
    }

    #[test]
    fn operator_key_ignores_blank_values() {
        let mut config = Config::default();
        assert!(config.operator_key().is_none());
        config.security.api_key = Some("   ".to_string());
        assert!(config.operator_key().is_none());
        config.security.api_key = Some(" op-key ".to_string());
        assert_eq!(config.operator_key().as_deref(), Some("op-key"));
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let parsed: Config = serde_yaml::from_str("server:\n  host: 127.0.0.1\n  port: 9000\n")
            .expect("parse partial config");
        assert_eq!(parsed.server.host, "127.0.0.1");
        assert_eq!(parsed.server.port, 9000);
        assert_eq!(parsed.storage.backend, "sqlite");
        assert_eq!(parsed.pool.execute_timeout_s, 120);
    }
}
