// SQLite 存储实现：单文件落盘，适合单实例部署与测试。
use crate::storage::{
    ApiKeyRecord, ApiKeyScopeRecord, CredentialFieldRule, InvocationTemplate,
    ServiceConfigRecord, ServiceDefinitionRecord, ServiceListFilter, StorageBackend,
    UsageLogFilter, UsageLogRecord,
};
use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct SqliteStorage {
    db_path: PathBuf,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
}

impl SqliteStorage {
    pub fn new(db_path: String) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/portway.db")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
        }
    }

    fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5)).ok();
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        Ok(conn)
    }

    fn string_list_to_json(list: &[String]) -> String {
        serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
    }

    fn parse_string_list(raw: Option<String>) -> Vec<String> {
        let Some(raw) = raw else {
            return Vec::new();
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        serde_json::from_str::<Vec<String>>(trimmed).unwrap_or_default()
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

    fn map_service_definition(row: &Row<'_>) -> rusqlite::Result<ServiceDefinitionRecord> {
        Ok(ServiceDefinitionRecord {
            service_key: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            category: row.get(3)?,
            credential_fields: Self::parse_credential_fields(row.get(4)?),
            invocation: InvocationTemplate {
                command: row.get(5)?,
                args: Self::parse_string_list(row.get(6)?),
                env_mapping: Self::parse_env_mapping(row.get(7)?),
            },
            health_check_url: row.get(8)?,
            is_available: row.get::<_, i64>(9)? != 0,
            is_beta: row.get::<_, i64>(10)? != 0,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn map_service_config(row: &Row<'_>) -> rusqlite::Result<ServiceConfigRecord> {
        Ok(ServiceConfigRecord {
            user_id: row.get(0)?,
            service_key: row.get(1)?,
            environment: row.get(2)?,
            encrypted_credentials: row.get(3)?,
            is_enabled: row.get::<_, i64>(4)? != 0,
            health_status: row.get(5)?,
            total_calls: row.get(6)?,
            successful_calls: row.get(7)?,
            failed_calls: row.get(8)?,
            last_used_at: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn map_api_key(row: &Row<'_>) -> rusqlite::Result<ApiKeyRecord> {
        Ok(ApiKeyRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            key_prefix: row.get(3)?,
            key_hash: row.get(4)?,
            scope_type: row.get(5)?,
            allowed_environments: Self::parse_string_list(row.get(6)?),
            rate_limit_per_minute: row.get(7)?,
            rate_limit_per_day: row.get(8)?,
            allowed_ips: Self::parse_string_list(row.get(9)?),
            expires_at: row.get(10)?,
            is_active: row.get::<_, i64>(11)? != 0,
            revoked_at: row.get(12)?,
            revoked_reason: row.get(13)?,
            created_at: row.get(14)?,
            last_used_at: row.get(15)?,
        })
    }

    fn map_usage_log(row: &Row<'_>) -> rusqlite::Result<UsageLogRecord> {
        Ok(UsageLogRecord {
            request_id: row.get(0)?,
            user_id: row.get(1)?,
            api_key_id: row.get(2)?,
            service_key: row.get(3)?,
            action: row.get(4)?,
            status: row.get(5)?,
            error_code: row.get(6)?,
            total_ms: row.get(7)?,
            pool_acquisition_ms: row.get(8)?,
            external_call_ms: row.get(9)?,
            client_ip: row.get(10)?,
            user_agent: row.get(11)?,
            response_preview: row.get(12)?,
            created_at: row.get(13)?,
        })
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

impl StorageBackend for SqliteStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
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
              is_available INTEGER NOT NULL DEFAULT 1,
              is_beta INTEGER NOT NULL DEFAULT 0,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_service_definitions_category
              ON service_definitions (category);
            CREATE TABLE IF NOT EXISTS service_configs (
              user_id TEXT NOT NULL,
              service_key TEXT NOT NULL,
              environment TEXT NOT NULL,
              encrypted_credentials TEXT NOT NULL,
              is_enabled INTEGER NOT NULL DEFAULT 1,
              health_status TEXT NOT NULL DEFAULT 'unknown',
              total_calls INTEGER NOT NULL DEFAULT 0,
              successful_calls INTEGER NOT NULL DEFAULT 0,
              failed_calls INTEGER NOT NULL DEFAULT 0,
              last_used_at REAL,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL,
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
              rate_limit_per_minute INTEGER NOT NULL DEFAULT 60,
              rate_limit_per_day INTEGER NOT NULL DEFAULT 10000,
              allowed_ips TEXT NOT NULL DEFAULT '[]',
              expires_at REAL,
              is_active INTEGER NOT NULL DEFAULT 1,
              revoked_at REAL,
              revoked_reason TEXT,
              created_at REAL NOT NULL,
              last_used_at REAL
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
              window_start REAL NOT NULL,
              count INTEGER NOT NULL DEFAULT 0,
              PRIMARY KEY (api_key_id, window_type, window_start)
            );
            CREATE INDEX IF NOT EXISTS idx_rate_limit_counters_start
              ON rate_limit_counters (window_start);
            CREATE TABLE IF NOT EXISTS usage_logs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              request_id TEXT NOT NULL,
              user_id TEXT NOT NULL,
              api_key_id TEXT,
              service_key TEXT NOT NULL,
              action TEXT NOT NULL,
              status TEXT NOT NULL,
              error_code TEXT,
              total_ms REAL NOT NULL DEFAULT 0,
              pool_acquisition_ms REAL NOT NULL DEFAULT 0,
              external_call_ms REAL NOT NULL DEFAULT 0,
              client_ip TEXT,
              user_agent TEXT,
              response_preview TEXT,
              created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_logs_user_time
              ON usage_logs (user_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_usage_logs_key
              ON usage_logs (api_key_id);
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn upsert_service_definition(&self, record: &ServiceDefinitionRecord) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            r#"
            INSERT INTO service_definitions (service_key, name, description, category,
              credential_fields, command, args, env_mapping, health_check_url, is_available,
              is_beta, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(service_key) DO UPDATE SET
              name = excluded.name,
              description = excluded.description,
              category = excluded.category,
              credential_fields = excluded.credential_fields,
              command = excluded.command,
              args = excluded.args,
              env_mapping = excluded.env_mapping,
              health_check_url = excluded.health_check_url,
              is_available = excluded.is_available,
              is_beta = excluded.is_beta,
              updated_at = excluded.updated_at
            "#,
            params![
                record.service_key,
                record.name,
                record.description,
                record.category,
                Self::credential_fields_to_json(&record.credential_fields),
                record.invocation.command,
                Self::string_list_to_json(&record.invocation.args),
                Self::env_mapping_to_json(&record.invocation.env_mapping),
                record.health_check_url,
                record.is_available as i64,
                record.is_beta as i64,
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get_service_definition(&self, service_key: &str) -> Result<Option<ServiceDefinitionRecord>> {
        let conn = self.open()?;
        let sql = format!(
            "SELECT {SERVICE_DEFINITION_COLUMNS} FROM service_definitions WHERE service_key = ?1"
        );
        let record = conn
            .query_row(&sql, params![service_key], Self::map_service_definition)
            .optional()?;
        Ok(record)
    }

    fn list_service_definitions(
        &self,
        filter: &ServiceListFilter,
    ) -> Result<Vec<ServiceDefinitionRecord>> {
        let conn = self.open()?;
        let sql =
            format!("SELECT {SERVICE_DEFINITION_COLUMNS} FROM service_definitions ORDER BY name");
        let mut statement = conn.prepare(&sql)?;
        let rows = statement.query_map([], Self::map_service_definition)?;
        let mut items = Vec::new();
        for row in rows {
            let record = row?;
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
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE service_definitions SET is_available = ?2, updated_at = ?3 WHERE service_key = ?1",
            params![service_key, available as i64, now_ts()],
        )?;
        Ok(changed > 0)
    }

    fn upsert_service_config(&self, record: &ServiceConfigRecord) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            r#"
            INSERT INTO service_configs (user_id, service_key, environment, encrypted_credentials,
              is_enabled, health_status, total_calls, successful_calls, failed_calls, last_used_at,
              created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(user_id, service_key, environment) DO UPDATE SET
              encrypted_credentials = excluded.encrypted_credentials,
              is_enabled = excluded.is_enabled,
              health_status = excluded.health_status,
              updated_at = excluded.updated_at
            "#,
            params![
                record.user_id,
                record.service_key,
                record.environment,
                record.encrypted_credentials,
                record.is_enabled as i64,
                record.health_status,
                record.total_calls,
                record.successful_calls,
                record.failed_calls,
                record.last_used_at,
                record.created_at,
                record.updated_at,
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
        let conn = self.open()?;
        let sql = format!(
            "SELECT {SERVICE_CONFIG_COLUMNS} FROM service_configs \
             WHERE user_id = ?1 AND service_key = ?2 AND environment = ?3"
        );
        let record = conn
            .query_row(
                &sql,
                params![user_id, service_key, environment],
                Self::map_service_config,
            )
            .optional()?;
        Ok(record)
    }

    fn list_service_configs(&self, user_id: &str) -> Result<Vec<ServiceConfigRecord>> {
        let conn = self.open()?;
        let sql = format!(
            "SELECT {SERVICE_CONFIG_COLUMNS} FROM service_configs \
             WHERE user_id = ?1 ORDER BY service_key, environment"
        );
        let mut statement = conn.prepare(&sql)?;
        let rows = statement.query_map(params![user_id], Self::map_service_config)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    fn set_service_config_enabled(
        &self,
        user_id: &str,
        service_key: &str,
        environment: &str,
        enabled: bool,
        updated_at: f64,
    ) -> Result<bool> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE service_configs SET is_enabled = ?4, updated_at = ?5 \
             WHERE user_id = ?1 AND service_key = ?2 AND environment = ?3",
            params![user_id, service_key, environment, enabled as i64, updated_at],
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
        let conn = self.open()?;
        conn.execute(
            "UPDATE service_configs SET health_status = ?4, updated_at = ?5 \
             WHERE user_id = ?1 AND service_key = ?2 AND environment = ?3",
            params![user_id, service_key, environment, health_status, updated_at],
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
        let conn = self.open()?;
        let column = if success {
            "successful_calls"
        } else {
            "failed_calls"
        };
        let sql = format!(
            "UPDATE service_configs SET total_calls = total_calls + 1, \
             {column} = {column} + 1, last_used_at = ?4, updated_at = ?4 \
             WHERE user_id = ?1 AND service_key = ?2 AND environment = ?3"
        );
        conn.execute(&sql, params![user_id, service_key, environment, used_at])?;
        Ok(())
    }

    fn delete_service_config(
        &self,
        user_id: &str,
        service_key: &str,
        environment: &str,
    ) -> Result<i64> {
        let conn = self.open()?;
        let deleted = conn.execute(
            "DELETE FROM service_configs \
             WHERE user_id = ?1 AND service_key = ?2 AND environment = ?3",
            params![user_id, service_key, environment],
        )?;
        Ok(deleted as i64)
    }

    fn create_api_key(&self, record: &ApiKeyRecord) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            r#"
            INSERT INTO api_keys (id, user_id, name, key_prefix, key_hash, scope_type,
              allowed_environments, rate_limit_per_minute, rate_limit_per_day, allowed_ips,
              expires_at, is_active, revoked_at, revoked_reason, created_at, last_used_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
            params![
                record.id,
                record.user_id,
                record.name,
                record.key_prefix,
                record.key_hash,
                record.scope_type,
                Self::string_list_to_json(&record.allowed_environments),
                record.rate_limit_per_minute,
                record.rate_limit_per_day,
                Self::string_list_to_json(&record.allowed_ips),
                record.expires_at,
                record.is_active as i64,
                record.revoked_at,
                record.revoked_reason,
                record.created_at,
                record.last_used_at,
            ],
        )?;
        Ok(())
    }

    fn update_api_key(&self, record: &ApiKeyRecord) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            r#"
            UPDATE api_keys SET user_id = ?2, name = ?3, key_prefix = ?4, key_hash = ?5,
              scope_type = ?6, allowed_environments = ?7, rate_limit_per_minute = ?8,
              rate_limit_per_day = ?9, allowed_ips = ?10, expires_at = ?11, is_active = ?12,
              revoked_at = ?13, revoked_reason = ?14, last_used_at = ?15
            WHERE id = ?1
            "#,
            params![
                record.id,
                record.user_id,
                record.name,
                record.key_prefix,
                record.key_hash,
                record.scope_type,
                Self::string_list_to_json(&record.allowed_environments),
                record.rate_limit_per_minute,
                record.rate_limit_per_day,
                Self::string_list_to_json(&record.allowed_ips),
                record.expires_at,
                record.is_active as i64,
                record.revoked_at,
                record.revoked_reason,
                record.last_used_at,
            ],
        )?;
        Ok(())
    }

    fn get_api_key(&self, id: &str) -> Result<Option<ApiKeyRecord>> {
        let conn = self.open()?;
        let sql = format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE id = ?1");
        let record = conn
            .query_row(&sql, params![id], Self::map_api_key)
            .optional()?;
        Ok(record)
    }

    fn get_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>> {
        let conn = self.open()?;
        let sql = format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE key_hash = ?1");
        let record = conn
            .query_row(&sql, params![key_hash], Self::map_api_key)
            .optional()?;
        Ok(record)
    }

    fn list_api_keys(&self, user_id: &str) -> Result<Vec<ApiKeyRecord>> {
        let conn = self.open()?;
        let sql = format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE user_id = ?1 ORDER BY created_at DESC"
        );
        let mut statement = conn.prepare(&sql)?;
        let rows = statement.query_map(params![user_id], Self::map_api_key)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    fn touch_api_key(&self, id: &str, last_used_at: f64) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE api_keys SET last_used_at = ?2 WHERE id = ?1",
            params![id, last_used_at],
        )?;
        Ok(())
    }

    fn delete_api_key(&self, id: &str) -> Result<i64> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM api_key_scopes WHERE api_key_id = ?1",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM rate_limit_counters WHERE api_key_id = ?1",
            params![id],
        )?;
        let deleted = tx.execute("DELETE FROM api_keys WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(deleted as i64)
    }

    fn insert_api_key_scopes(&self, scopes: &[ApiKeyScopeRecord]) -> Result<()> {
        if scopes.is_empty() {
            return Ok(());
        }
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        for scope in scopes {
            tx.execute(
                "INSERT INTO api_key_scopes (api_key_id, service_key, allowed_actions) \
                 VALUES (?1, ?2, ?3)",
                params![
                    scope.api_key_id,
                    scope.service_key,
                    Self::string_list_to_json(&scope.allowed_actions),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn list_api_key_scopes(&self, api_key_id: &str) -> Result<Vec<ApiKeyScopeRecord>> {
        let conn = self.open()?;
        let mut statement = conn.prepare(
            "SELECT api_key_id, service_key, allowed_actions FROM api_key_scopes \
             WHERE api_key_id = ?1 ORDER BY service_key",
        )?;
        let rows = statement.query_map(params![api_key_id], |row| {
            Ok(ApiKeyScopeRecord {
                api_key_id: row.get(0)?,
                service_key: row.get(1)?,
                allowed_actions: Self::parse_string_list(row.get(2)?),
            })
        })?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    fn get_rate_limit_count(
        &self,
        api_key_id: &str,
        window_type: &str,
        window_start: f64,
    ) -> Result<i64> {
        let conn = self.open()?;
        let count = conn
            .query_row(
                "SELECT count FROM rate_limit_counters \
                 WHERE api_key_id = ?1 AND window_type = ?2 AND window_start = ?3",
                params![api_key_id, window_type, window_start],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    fn increment_rate_limit(
        &self,
        api_key_id: &str,
        window_type: &str,
        window_start: f64,
    ) -> Result<i64> {
        let conn = self.open()?;
        let count = conn.query_row(
            r#"
            INSERT INTO rate_limit_counters (api_key_id, window_type, window_start, count)
            VALUES (?1, ?2, ?3, 1)
            ON CONFLICT(api_key_id, window_type, window_start)
              DO UPDATE SET count = count + 1
            RETURNING count
            "#,
            params![api_key_id, window_type, window_start],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count)
    }

    fn delete_rate_limit_buckets_before(&self, before: f64) -> Result<i64> {
        let conn = self.open()?;
        let deleted = conn.execute(
            "DELETE FROM rate_limit_counters WHERE window_start < ?1",
            params![before],
        )?;
        Ok(deleted as i64)
    }

    fn append_usage_log(&self, record: &UsageLogRecord) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            r#"
            INSERT INTO usage_logs (request_id, user_id, api_key_id, service_key, action, status,
              error_code, total_ms, pool_acquisition_ms, external_call_ms, client_ip, user_agent,
              response_preview, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                record.request_id,
                record.user_id,
                record.api_key_id,
                record.service_key,
                record.action,
                record.status,
                record.error_code,
                record.total_ms,
                record.pool_acquisition_ms,
                record.external_call_ms,
                record.client_ip,
                record.user_agent,
                record.response_preview,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    fn load_usage_logs(&self, filter: &UsageLogFilter) -> Result<Vec<UsageLogRecord>> {
        let conn = self.open()?;
        let mut clauses = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(user_id) = filter.user_id.as_deref() {
            values.push(user_id.to_string().into());
            clauses.push(format!("user_id = ?{}", values.len()));
        }
        if let Some(service_key) = filter.service_key.as_deref() {
            values.push(service_key.to_string().into());
            clauses.push(format!("service_key = ?{}", values.len()));
        }
        if let Some(status) = filter.status.as_deref() {
            values.push(status.to_string().into());
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(since) = filter.since {
            values.push(since.into());
            clauses.push(format!("created_at >= ?{}", values.len()));
        }
        if let Some(until) = filter.until {
            values.push(until.into());
            clauses.push(format!("created_at <= ?{}", values.len()));
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
        let mut statement = conn.prepare(&sql)?;
        let rows =
            statement.query_map(rusqlite::params_from_iter(values), Self::map_usage_log)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
