// Postgres 存储实现：通过连接池桥接同步 StorageBackend 接口。
use crate::storage::{
    ApiKeyRecord, ApiKeyScopeRecord, CredentialFieldRule, InvocationTemplate,
    ServiceConfigRecord, ServiceDefinitionRecord, ServiceListFilter, StorageBackend,
    UsageLogFilter, UsageLogRecord,
};
use anyhow::{anyhow, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};

pub struct PostgresStorage {
    pool: Pool,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
    fallback_runtime: tokio::runtime::Runtime,
}

struct PgConn<'a> {
    storage: &'a PostgresStorage,
    client: deadpool_postgres::Client,
}

impl PgConn<'_> {
    fn batch_execute(&mut self, query: &str) -> Result<()> {
        self.storage.block_on(self.client.batch_execute(query))??;
        Ok(())
    }

    fn execute(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        Ok(self
            .storage
            .block_on(self.client.execute(query, params))??)
    }

    fn query(
        &mut self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>> {
        Ok(self.storage.block_on(self.client.query(query, params))??)
    }

    fn query_opt(
        &mut self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>> {
        Ok(self
            .storage
            .block_on(self.client.query_opt(query, params))??)
    }

    fn query_one(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Row> {
        Ok(self
            .storage
            .block_on(self.client.query_one(query, params))??)
    }

    fn transaction(&mut self) -> Result<PgTx<'_>> {
        let tx = self.storage.block_on(self.client.transaction())??;
        Ok(PgTx {
            storage: self.storage,
            tx,
        })
    }
}

struct PgTx<'a> {
    storage: &'a PostgresStorage,
    tx: deadpool_postgres::Transaction<'a>,
}

impl<'a> PgTx<'a> {
    fn execute(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        Ok(self.storage.block_on(self.tx.execute(query, params))??)
    }

    fn commit(self) -> Result<()> {
        self.storage.block_on(self.tx.commit())??;
        Ok(())
    }
}

impl PostgresStorage {
    pub fn new(dsn: String, connect_timeout_s: u64, pool_size: usize) -> Result<Self> {
        let cleaned = dsn.trim().to_string();
        if cleaned.is_empty() {
            return Err(anyhow!("postgres dsn is empty"));
        }
        let timeout = Duration::from_secs(connect_timeout_s.max(1));
        let mut config = cleaned.parse::<tokio_postgres::Config>()?;
        config.connect_timeout(timeout);
        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = Manager::from_config(config, NoTls, manager_config);
        let pool = Pool::builder(manager).max_size(pool_size.max(1)).build()?;
        let fallback_runtime = tokio::runtime::Runtime::new()
            .map_err(|err| anyhow!("create tokio runtime for postgres: {err}"))?;
        Ok(Self {
            pool,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
            fallback_runtime,
        })
    }

    fn block_on<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Ok(tokio::task::block_in_place(|| handle.block_on(fut))),
            Err(_) => Ok(self.fallback_runtime.block_on(fut)),
        }
    }

    fn conn(&self) -> Result<PgConn<'_>> {
        let client = self.block_on(self.pool.get())??;
        Ok(PgConn {
            storage: self,
            client,
        })
    }

    fn string_list_to_json(list: &[String]) -> String {
        serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
    }

    fn parse_string_list(raw: Option<String>) -> Vec<String> {
        let Some(raw) = raw else {
            return Vec::new();
        };
        serde_json::from_str::<Vec<String>>(raw.trim()).unwrap_or_default()
    }

    fn credential_fields_to_json(fields: &[CredentialFieldRule]) -> String {
        serde_json::to_string(fields).unwrap_or_else(|_| "[]".to_string())
    }

    fn parse_credential_fields(raw: Option<String>) -> Vec<CredentialFieldRule> {
        let Some(raw) = raw else {
            return Vec::new();
        };
        serde_json::from_str::<Vec<CredentialFieldRule>>(raw.trim()).unwrap_or_default()
    }

    fn env_mapping_to_json(mapping: &HashMap<String, String>) -> String {
        serde_json::to_string(mapping).unwrap_or_else(|_| "{}".to_string())
    }

    fn parse_env_mapping(raw: Option<String>) -> HashMap<String, String> {
        let Some(raw) = raw else {
            return HashMap::new();
        };
        serde_json::from_str::<HashMap<String, String>>(raw.trim()).unwrap_or_default()
    }

    fn map_service_definition(row: &Row) -> ServiceDefinitionRecord {
        ServiceDefinitionRecord {
            service_key: row.get(0),
            name: row.get(1),
            description: row.get(2),
            category: row.get(3),
            credential_fields: Self::parse_credential_fields(row.get(4)),
            invocation: InvocationTemplate {
                command: row.get(5),
                args: Self::parse_string_list(row.get(6)),
                env_mapping: Self::parse_env_mapping(row.get(7)),
            },
            health_check_url: row.get(8),
            is_available: row.get(9),
            is_beta: row.get(10),
            created_at: row.get(11),
            updated_at: row.get(12),
        }
    }

    fn map_service_config(row: &Row) -> ServiceConfigRecord {
        ServiceConfigRecord {
            user_id: row.get(0),
            service_key: row.get(1),
            environment: row.get(2),
            encrypted_credentials: row.get(3),
            is_enabled: row.get(4),
            health_status: row.get(5),
            total_calls: row.get(6),
            successful_calls: row.get(7),
            failed_calls: row.get(8),
            last_used_at: row.get(9),
            created_at: row.get(10),
            updated_at: row.get(11),
        }
    }

    fn map_api_key(row: &Row) -> ApiKeyRecord {
        ApiKeyRecord {
            id: row.get(0),
            user_id: row.get(1),
            name: row.get(2),
            key_prefix: row.get(3),
            key_hash: row.get(4),
            scope_type: row.get(5),
            allowed_environments: Self::parse_string_list(row.get(6)),
            rate_limit_per_minute: row.get(7),
            rate_limit_per_day: row.get(8),
            allowed_ips: Self::parse_string_list(row.get(9)),
            expires_at: row.get(10),
            is_active: row.get(11),
            revoked_at: row.get(12),
            revoked_reason: row.get(13),
            created_at: row.get(14),
            last_used_at: row.get(15),
        }
    }

    fn map_usage_log(row: &Row) -> UsageLogRecord {
        UsageLogRecord {
            request_id: row.get(0),
            user_id: row.get(1),
            api_key_id: row.get(2),
            service_key: row.get(3),
            action: row.get(4),
            status: row.get(5),
            error_code: row.get(6),
            total_ms: row.get(7),
            pool_acquisition_ms: row.get(8),
            external_call_ms: row.get(9),
            client_ip: row.get(10),
            user_agent: row.get(11),
            response_preview: row.get(12),
            created_at: row.get(13),
        }
    }
}

const SERVICE_DEFINITION_COLUMNS: &str = "service_key, name, description, category, \
     credential_fields, command, args, env_mapping, health_check_url, is_available, is_beta, \
     created_at, updated_at";

const SERVICE_CONFIG_COLUMNS: &str = "user_id, service_key, environment, encrypted_credentials, \
     is_enabled, health_status, total_calls, successful_calls, failed_calls, last_used_at, \
     created_at, updated_at";

const API_KEY_COLUMNS: &str = "id, user_id, name, key_prefix, key_hash, scope_type, \
     allowed_environments, rate_limit_per_minute, rate_limit_per_day, allowed_ips, expires_at, \
     is_active, revoked_at, revoked_reason, created_at, last_used_at";

const USAGE_LOG_COLUMNS: &str = "request_id, user_id, api_key_id, service_key, action, status, \
     error_code, total_ms, pool_acquisition_ms, external_call_ms, client_ip, user_agent, \
     response_preview, created_at";

impl StorageBackend for PostgresStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let mut conn = match self.conn() {
                Ok(conn) => conn,
                Err(err) => {
                    if attempts >= 5 {
                        return Err(err);
                    }
                    std::thread::sleep(Duration::from_secs(1));
                    continue;
                }
            };
            let result = conn.batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS service_definitions (
                  service_key TEXT PRIMARY KEY,
                  name TEXT NOT NULL,
                  description TEXT NOT NULL DEFAULT '',
                  category TEXT NOT NULL DEFAULT '',
                  credential_fields TEXT NOT NULL DEFAULT '[]',
                  command TEXT NOT NULL DEFAULT '',
                  args TEXT NOT NULL DEFAULT '[]',
                  env_mapping TEXT NOT NULL DEFAULT '{}',
                  health_check_url TEXT,
                  is_available BOOLEAN NOT NULL DEFAULT TRUE,
                  is_beta BOOLEAN NOT NULL DEFAULT FALSE,
                  created_at DOUBLE PRECISION NOT NULL,
                  updated_at DOUBLE PRECISION NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_service_definitions_category
                  ON service_definitions (category);
                CREATE TABLE IF NOT EXISTS service_configs (
                  user_id TEXT NOT NULL,
                  service_key TEXT NOT NULL,
                  environment TEXT NOT NULL,
                  encrypted_credentials TEXT NOT NULL,
                  is_enabled BOOLEAN NOT NULL DEFAULT TRUE,
                  health_status TEXT NOT NULL DEFAULT 'unknown',
                  total_calls BIGINT NOT NULL DEFAULT 0,
                  successful_calls BIGINT NOT NULL DEFAULT 0,
                  failed_calls BIGINT NOT NULL DEFAULT 0,
                  last_used_at DOUBLE PRECISION,
                  created_at DOUBLE PRECISION NOT NULL,
                  updated_at DOUBLE PRECISION NOT NULL,
                  PRIMARY KEY (user_id, service_key, environment)
                );
                CREATE TABLE IF NOT EXISTS api_keys (
                  id TEXT PRIMARY KEY,
                  user_id TEXT NOT NULL,
                  name TEXT NOT NULL DEFAULT '',
                  key_prefix TEXT NOT NULL,
                  key_hash TEXT NOT NULL UNIQUE,
                  scope_type TEXT NOT NULL DEFAULT 'all',
                  allowed_environments TEXT NOT NULL DEFAULT '[]',
                  rate_limit_per_minute BIGINT NOT NULL DEFAULT 60,
                  rate_limit_per_day BIGINT NOT NULL DEFAULT 10000,
                  allowed_ips TEXT NOT NULL DEFAULT '[]',
                  expires_at DOUBLE PRECISION,
                  is_active BOOLEAN NOT NULL DEFAULT TRUE,
                  revoked_at DOUBLE PRECISION,
                  revoked_reason TEXT,
                  created_at DOUBLE PRECISION NOT NULL,
                  last_used_at DOUBLE PRECISION
                );
                CREATE INDEX IF NOT EXISTS idx_api_keys_user
                  ON api_keys (user_id);
                CREATE TABLE IF NOT EXISTS api_key_scopes (
                  api_key_id TEXT NOT NULL,
                  service_key TEXT NOT NULL,
                  allowed_actions TEXT NOT NULL DEFAULT '[]',
                  PRIMARY KEY (api_key_id, service_key)
                );
                CREATE TABLE IF NOT EXISTS rate_limit_counters (
                  api_key_id TEXT NOT NULL,
                  window_type TEXT NOT NULL,
                  window_start DOUBLE PRECISION NOT NULL,
                  count BIGINT NOT NULL DEFAULT 0,
                  PRIMARY KEY (api_key_id, window_type, window_start)
                );
                CREATE INDEX IF NOT EXISTS idx_rate_limit_counters_start
                  ON rate_limit_counters (window_start);
                CREATE TABLE IF NOT EXISTS usage_logs (
                  id BIGSERIAL PRIMARY KEY,
                  request_id TEXT NOT NULL,
                  user_id TEXT NOT NULL,
                  api_key_id TEXT,
                  service_key TEXT NOT NULL,
                  action TEXT NOT NULL,
                  status TEXT NOT NULL,
                  error_code TEXT,
                  total_ms DOUBLE PRECISION NOT NULL DEFAULT 0,
                  pool_acquisition_ms DOUBLE PRECISION NOT NULL DEFAULT 0,
                  external_call_ms DOUBLE PRECISION NOT NULL DEFAULT 0,
                  client_ip TEXT,
                  user_agent TEXT,
                  response_preview TEXT,
                  created_at DOUBLE PRECISION NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_usage_logs_user_time
                  ON usage_logs (user_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_usage_logs_key
                  ON usage_logs (api_key_id);
                "#,
            );
            match result {
                Ok(()) => break,
                Err(err) => {
                    if attempts >= 5 {
                        return Err(err);
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn upsert_service_definition(&self, record: &ServiceDefinitionRecord) -> Result<()> {
        let mut conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO service_definitions (service_key, name, description, category,
              credential_fields, command, args, env_mapping, health_check_url, is_available,
              is_beta, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (service_key) DO UPDATE SET
              name = EXCLUDED.name,
              description = EXCLUDED.description,
              category = EXCLUDED.category,
              credential_fields = EXCLUDED.credential_fields,
              command = EXCLUDED.command,
              args = EXCLUDED.args,
              env_mapping = EXCLUDED.env_mapping,
              health_check_url = EXCLUDED.health_check_url,
              is_available = EXCLUDED.is_available,
              is_beta = EXCLUDED.is_beta,
              updated_at = EXCLUDED.updated_at
            "#,
            &[
                &record.service_key,
                &record.name,
                &record.description,
                &record.category,
                &Self::credential_fields_to_json(&record.credential_fields),
                &record.invocation.command,
                &Self::string_list_to_json(&record.invocation.args),
                &Self::env_mapping_to_json(&record.invocation.env_mapping),
                &record.health_check_url,
                &record.is_available,
                &record.is_beta,
                &record.created_at,
                &record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get_service_definition(&self, service_key: &str) -> Result<Option<ServiceDefinitionRecord>> {
        let mut conn = self.conn()?;
        let sql = format!(
            "SELECT {SERVICE_DEFINITION_COLUMNS} FROM service_definitions WHERE service_key = $1"
        );
        let row = conn.query_opt(&sql, &[&service_key])?;
        Ok(row.as_ref().map(Self::map_service_definition))
    }

    fn list_service_definitions(
        &self,
        filter: &ServiceListFilter,
    ) -> Result<Vec<ServiceDefinitionRecord>> {
        let mut conn = self.conn()?;
        let sql =
            format!("SELECT {SERVICE_DEFINITION_COLUMNS} FROM service_definitions ORDER BY name");
        let rows = conn.query(&sql, &[])?;
        let mut items = Vec::new();
        for row in rows.iter() {
            let record = Self::map_service_definition(row);
            if !filter.include_beta && record.is_beta {
                continue;
            }
            if let Some(category) = filter.category.as_deref() {
                if !record.category.eq_ignore_ascii_case(category.trim()) {
                    continue;
                }
            }
            if let Some(search) = filter.search.as_deref() {
                let needle = search.trim().to_lowercase();
                if !needle.is_empty() {
                    let haystack = format!(
                        "{} {} {}",
                        record.name.to_lowercase(),
                        record.description.to_lowercase(),
                        record.service_key.to_lowercase()
                    );
                    if !haystack.contains(&needle) {
                        continue;
                    }
                }
            }
            items.push(record);
        }
        Ok(items)
    }

    fn set_service_availability(&self, service_key: &str, available: bool) -> Result<bool> {
        let mut conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE service_definitions SET is_available = $2, updated_at = $3 \
             WHERE service_key = $1",
            &[&service_key, &available, &now_ts()],
        )?;
        Ok(changed > 0)
    }

    fn upsert_service_config(&self, record: &ServiceConfigRecord) -> Result<()> {
        let mut conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO service_configs (user_id, service_key, environment, encrypted_credentials,
              is_enabled, health_status, total_calls, successful_calls, failed_calls, last_used_at,
              created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (user_id, service_key, environment) DO UPDATE SET
              encrypted_credentials = EXCLUDED.encrypted_credentials,
              is_enabled = EXCLUDED.is_enabled,
              health_status = EXCLUDED.health_status,
              updated_at = EXCLUDED.updated_at
            "#,
            &[
                &record.user_id,
                &record.service_key,
                &record.environment,
                &record.encrypted_credentials,
                &record.is_enabled,
                &record.health_status,
                &record.total_calls,
                &record.successful_calls,
                &record.failed_calls,
                &record.last_used_at,
                &record.created_at,
                &record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get_service_config(
        &self,
        user_id: &str,
        service_key: &str,
        environment: &str,
    ) -> Result<Option<ServiceConfigRecord>> {
        let mut conn = self.conn()?;
        let sql = format!(
            "SELECT {SERVICE_CONFIG_COLUMNS} FROM service_configs \
             WHERE user_id = $1 AND service_key = $2 AND environment = $3"
        );
        let row = conn.query_opt(&sql, &[&user_id, &service_key, &environment])?;
        Ok(row.as_ref().map(Self::map_service_config))
    }

    fn list_service_configs(&self, user_id: &str) -> Result<Vec<ServiceConfigRecord>> {
        let mut conn = self.conn()?;
        let sql = format!(
            "SELECT {SERVICE_CONFIG_COLUMNS} FROM service_configs \
             WHERE user_id = $1 ORDER BY service_key, environment"
        );
        let rows = conn.query(&sql, &[&user_id])?;
        Ok(rows.iter().map(Self::map_service_config).collect())
    }

    fn set_service_config_enabled(
        &self,
        user_id: &str,
        service_key: &str,
        environment: &str,
        enabled: bool,
        updated_at: f64,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE service_configs SET is_enabled = $4, updated_at = $5 \
             WHERE user_id = $1 AND service_key = $2 AND environment = $3",
            &[&user_id, &service_key, &environment, &enabled, &updated_at],
        )?;
        Ok(changed > 0)
    }

    fn set_service_config_health(
        &self,
        user_id: &str,
        service_key: &str,
        environment: &str,
        health_status: &str,
        updated_at: f64,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        conn.execute(
            "UPDATE service_configs SET health_status = $4, updated_at = $5 \
             WHERE user_id = $1 AND service_key = $2 AND environment = $3",
            &[
                &user_id,
                &service_key,
                &environment,
                &health_status,
                &updated_at,
            ],
        )?;
        Ok(())
    }

    fn record_service_config_usage(
        &self,
        user_id: &str,
        service_key: &str,
        environment: &str,
        success: bool,
        used_at: f64,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let column = if success {
            "successful_calls"
        } else {
            "failed_calls"
        };
        let sql = format!(
            "UPDATE service_configs SET total_calls = total_calls + 1, \
             {column} = {column} + 1, last_used_at = $4, updated_at = $4 \
             WHERE user_id = $1 AND service_key = $2 AND environment = $3"
        );
        conn.execute(&sql, &[&user_id, &service_key, &environment, &used_at])?;
        Ok(())
    }

    fn delete_service_config(
        &self,
        user_id: &str,
        service_key: &str,
        environment: &str,
    ) -> Result<i64> {
        let mut conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM service_configs \
             WHERE user_id = $1 AND service_key = $2 AND environment = $3",
            &[&user_id, &service_key, &environment],
        )?;
        Ok(deleted as i64)
    }

    fn create_api_key(&self, record: &ApiKeyRecord) -> Result<()> {
        let mut conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO api_keys (id, user_id, name, key_prefix, key_hash, scope_type,
              allowed_environments, rate_limit_per_minute, rate_limit_per_day, allowed_ips,
              expires_at, is_active, revoked_at, revoked_reason, created_at, last_used_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
            &[
                &record.id,
                &record.user_id,
                &record.name,
                &record.key_prefix,
                &record.key_hash,
                &record.scope_type,
                &Self::string_list_to_json(&record.allowed_environments),
                &record.rate_limit_per_minute,
                &record.rate_limit_per_day,
                &Self::string_list_to_json(&record.allowed_ips),
                &record.expires_at,
                &record.is_active,
                &record.revoked_at,
                &record.revoked_reason,
                &record.created_at,
                &record.last_used_at,
            ],
        )?;
        Ok(())
    }

    fn update_api_key(&self, record: &ApiKeyRecord) -> Result<()> {
        let mut conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE api_keys SET user_id = $2, name = $3, key_prefix = $4, key_hash = $5,
              scope_type = $6, allowed_environments = $7, rate_limit_per_minute = $8,
              rate_limit_per_day = $9, allowed_ips = $10, expires_at = $11, is_active = $12,
              revoked_at = $13, revoked_reason = $14, last_used_at = $15
            WHERE id = $1
            "#,
            &[
                &record.id,
                &record.user_id,
                &record.name,
                &record.key_prefix,
                &record.key_hash,
                &record.scope_type,
                &Self::string_list_to_json(&record.allowed_environments),
                &record.rate_limit_per_minute,
                &record.rate_limit_per_day,
                &Self::string_list_to_json(&record.allowed_ips),
                &record.expires_at,
                &record.is_active,
                &record.revoked_at,
                &record.revoked_reason,
                &record.last_used_at,
            ],
        )?;
        Ok(())
    }

    fn get_api_key(&self, id: &str) -> Result<Option<ApiKeyRecord>> {
        let mut conn = self.conn()?;
        let sql = format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE id = $1");
        let row = conn.query_opt(&sql, &[&id])?;
        Ok(row.as_ref().map(Self::map_api_key))
    }

    fn get_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>> {
        let mut conn = self.conn()?;
        let sql = format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE key_hash = $1");
        let row = conn.query_opt(&sql, &[&key_hash])?;
        Ok(row.as_ref().map(Self::map_api_key))
    }

    fn list_api_keys(&self, user_id: &str) -> Result<Vec<ApiKeyRecord>> {
        let mut conn = self.conn()?;
        let sql = format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE user_id = $1 ORDER BY created_at DESC"
        );
        let rows = conn.query(&sql, &[&user_id])?;
        Ok(rows.iter().map(Self::map_api_key).collect())
    }

    fn touch_api_key(&self, id: &str, last_used_at: f64) -> Result<()> {
        let mut conn = self.conn()?;
        conn.execute(
            "UPDATE api_keys SET last_used_at = $2 WHERE id = $1",
            &[&id, &last_used_at],
        )?;
        Ok(())
    }

    fn delete_api_key(&self, id: &str) -> Result<i64> {
        let mut conn = self.conn()?;
        let mut tx = conn.transaction()?;
        tx.execute("DELETE FROM api_key_scopes WHERE api_key_id = $1", &[&id])?;
        tx.execute(
            "DELETE FROM rate_limit_counters WHERE api_key_id = $1",
            &[&id],
        )?;
        let deleted = tx.execute("DELETE FROM api_keys WHERE id = $1", &[&id])?;
        tx.commit()?;
        Ok(deleted as i64)
    }

    fn insert_api_key_scopes(&self, scopes: &[ApiKeyScopeRecord]) -> Result<()> {
        if scopes.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let mut tx = conn.transaction()?;
        for scope in scopes {
            tx.execute(
                "INSERT INTO api_key_scopes (api_key_id, service_key, allowed_actions) \
                 VALUES ($1, $2, $3)",
                &[
                    &scope.api_key_id,
                    &scope.service_key,
                    &Self::string_list_to_json(&scope.allowed_actions),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn list_api_key_scopes(&self, api_key_id: &str) -> Result<Vec<ApiKeyScopeRecord>> {
        let mut conn = self.conn()?;
        let rows = conn.query(
            "SELECT api_key_id, service_key, allowed_actions FROM api_key_scopes \
             WHERE api_key_id = $1 ORDER BY service_key",
            &[&api_key_id],
        )?;
        Ok(rows
            .iter()
            .map(|row| ApiKeyScopeRecord {
                api_key_id: row.get(0),
                service_key: row.get(1),
                allowed_actions: Self::parse_string_list(row.get(2)),
            })
            .collect())
    }

    fn get_rate_limit_count(
        &self,
        api_key_id: &str,
        window_type: &str,
        window_start: f64,
    ) -> Result<i64> {
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            "SELECT count FROM rate_limit_counters \
             WHERE api_key_id = $1 AND window_type = $2 AND window_start = $3",
            &[&api_key_id, &window_type, &window_start],
        )?;
        Ok(row.map(|row| row.get::<_, i64>(0)).unwrap_or(0))
    }

    fn increment_rate_limit(
        &self,
        api_key_id: &str,
        window_type: &str,
        window_start: f64,
    ) -> Result<i64> {
        let mut conn = self.conn()?;
        let row = conn.query_one(
            r#"
            INSERT INTO rate_limit_counters (api_key_id, window_type, window_start, count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (api_key_id, window_type, window_start)
              DO UPDATE SET count = rate_limit_counters.count + 1
            RETURNING count
            "#,
            &[&api_key_id, &window_type, &window_start],
        )?;
        Ok(row.get::<_, i64>(0))
    }

    fn delete_rate_limit_buckets_before(&self, before: f64) -> Result<i64> {
        let mut conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM rate_limit_counters WHERE window_start < $1",
            &[&before],
        )?;
        Ok(deleted as i64)
    }

    fn append_usage_log(&self, record: &UsageLogRecord) -> Result<()> {
        let mut conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO usage_logs (request_id, user_id, api_key_id, service_key, action, status,
              error_code, total_ms, pool_acquisition_ms, external_call_ms, client_ip, user_agent,
              response_preview, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
            &[
                &record.request_id,
                &record.user_id,
                &record.api_key_id,
                &record.service_key,
                &record.action,
                &record.status,
                &record.error_code,
                &record.total_ms,
                &record.pool_acquisition_ms,
                &record.external_call_ms,
                &record.client_ip,
                &record.user_agent,
                &record.response_preview,
                &record.created_at,
            ],
        )?;
        Ok(())
    }

    fn load_usage_logs(&self, filter: &UsageLogFilter) -> Result<Vec<UsageLogRecord>> {
        let mut conn = self.conn()?;
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();
        if let Some(user_id) = filter.user_id.as_deref() {
            values.push(Box::new(user_id.to_string()));
            clauses.push(format!("user_id = ${}", values.len()));
        }
        if let Some(service_key) = filter.service_key.as_deref() {
            values.push(Box::new(service_key.to_string()));
            clauses.push(format!("service_key = ${}", values.len()));
        }
        if let Some(status) = filter.status.as_deref() {
            values.push(Box::new(status.to_string()));
            clauses.push(format!("status = ${}", values.len()));
        }
        if let Some(since) = filter.since {
            values.push(Box::new(since));
            clauses.push(format!("created_at >= ${}", values.len()));
        }
        if let Some(until) = filter.until {
            values.push(Box::new(until));
            clauses.push(format!("created_at <= ${}", values.len()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let limit = filter.limit.unwrap_or(100).clamp(1, 1000);
        let sql = format!(
            "SELECT {USAGE_LOG_COLUMNS} FROM usage_logs{where_clause} \
             ORDER BY created_at DESC LIMIT {limit}"
        );
        let params: Vec<&(dyn ToSql + Sync)> = values
            .iter()
            .map(|value| value.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = conn.query(&sql, &params)?;
        Ok(rows.iter().map(Self::map_usage_log).collect())
    }
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
