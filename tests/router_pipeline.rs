// 路由准入管线的端到端回归：内存内装配全部组件，不经过 HTTP 层。
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use portway_server::catalog::{credential_field, ServiceCatalog};
use portway_server::config::{PoolConfig, RateLimitConfig};
use portway_server::crypto::AesGcmCipher;
use portway_server::executor::{ActionExecutor, ActionOutcome, HealthProbe};
use portway_server::keys::{CreateKeyRequest, KeyRegistry, ScopeSpec, SCOPE_ALL, SCOPE_SPECIFIC};
use portway_server::pool::{ExecutionPool, UnitStatus};
use portway_server::router::{ServiceRouter, MAX_RESPONSE_BYTES, PREVIEW_MAX_CHARS};
use portway_server::schemas::{Environment, RouteContext, RouteRequest, RouterResponse};
use portway_server::storage::{
    ServiceDefinitionRecord, SqliteStorage, StorageBackend, UsageLogFilter,
};
use portway_server::vault::CredentialVault;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

struct ScriptedExecutor;

#[async_trait]
impl ActionExecutor for ScriptedExecutor {
    async fn invoke(
        &self,
        definition: &ServiceDefinitionRecord,
        _credentials: &HashMap<String, String>,
        action: &str,
        params: &Value,
    ) -> Result<ActionOutcome> {
        match action {
            "explode" => Err(anyhow!("upstream connection refused")),
            "dump" => Ok(ActionOutcome {
                data: json!({ "blob": "x".repeat(MAX_RESPONSE_BYTES + 500) }),
                status: "ok".to_string(),
            }),
            _ => Ok(ActionOutcome {
                data: json!({
                    "service": definition.service_key,
                    "action": action,
                    "params": params,
                }),
                status: "ok".to_string(),
            }),
        }
    }
}

struct Harness {
    storage: Arc<dyn StorageBackend>,
    catalog: Arc<ServiceCatalog>,
    vault: Arc<CredentialVault>,
    keys: Arc<KeyRegistry>,
    pool: Arc<ExecutionPool>,
    router: ServiceRouter,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_pool_config(PoolConfig::default())
    }

    fn with_pool_config(pool_config: PoolConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage: Arc<dyn StorageBackend> = Arc::new(SqliteStorage::new(
            dir.path().join("portway.db").to_string_lossy().to_string(),
        ));
        storage.ensure_initialized().expect("init storage");
        let catalog = Arc::new(ServiceCatalog::new(storage.clone()));
        let cipher = Arc::new(AesGcmCipher::new("pipeline-test-key").expect("cipher"));
        let probe = HealthProbe::new(1).expect("probe");
        let vault = Arc::new(CredentialVault::new(
            storage.clone(),
            catalog.clone(),
            cipher,
            probe,
        ));
        let keys = Arc::new(KeyRegistry::new(
            storage.clone(),
            RateLimitConfig::default(),
        ));
        let pool = Arc::new(ExecutionPool::new(Arc::new(ScriptedExecutor), pool_config));
        let router = ServiceRouter::new(
            storage.clone(),
            catalog.clone(),
            vault.clone(),
            keys.clone(),
            pool.clone(),
        );
        let harness = Self {
            storage,
            catalog,
            vault,
            keys,
            pool,
            router,
            _dir: dir,
        };
        harness.seed_service("stripe");
        harness
    }

    fn seed_service(&self, service_key: &str) {
        self.catalog
            .add(ServiceDefinitionRecord {
                service_key: service_key.to_string(),
                name: service_key.to_string(),
                description: format!("{service_key} integration"),
                category: "payments".to_string(),
                credential_fields: vec![credential_field("api_key", "API Key", true)],
                invocation: Default::default(),
                health_check_url: None,
                is_available: true,
                is_beta: false,
                created_at: 0.0,
                updated_at: 0.0,
            })
            .expect("seed service");
    }

    fn configure(&self, user_id: &str, service_key: &str) {
        self.vault
            .configure(
                user_id,
                service_key,
                &HashMap::from([("api_key".to_string(), "sk_live_123".to_string())]),
                Environment::Production,
                true,
            )
            .expect("configure vault");
    }

    fn create_key(&self, request: &CreateKeyRequest) -> (String, String) {
        let created = self.keys.create(request).expect("create key");
        (created.record.id, created.secret)
    }

    fn all_key_request(&self, user_id: &str) -> CreateKeyRequest {
        CreateKeyRequest {
            user_id: user_id.to_string(),
            name: "test".to_string(),
            scope_type: SCOPE_ALL.to_string(),
            scopes: Vec::new(),
            allowed_environments: Vec::new(),
            rate_limit_per_minute: None,
            rate_limit_per_day: None,
            allowed_ips: Vec::new(),
            expires_at: None,
        }
    }

    async fn invoke(&self, secret: &str, service: &str, action: &str) -> RouterResponse {
        self.router
            .route(
                &RouteRequest {
                    service: service.to_string(),
                    action: action.to_string(),
                    params: json!({"amount": 100}),
                },
                &RouteContext {
                    api_key: secret.to_string(),
                    client_ip: Some("203.0.113.7".to_string()),
                    user_agent: Some("pipeline-tests".to_string()),
                    environment: None,
                },
            )
            .await
    }

    fn logs(&self, user_id: &str) -> Vec<portway_server::storage::UsageLogRecord> {
        self.storage
            .load_usage_logs(&UsageLogFilter {
                user_id: Some(user_id.to_string()),
                ..Default::default()
            })
            .expect("load logs")
    }

    fn error_code(response: &RouterResponse) -> String {
        response
            .error
            .as_ref()
            .map(|error| error.code.clone())
            .unwrap_or_default()
    }
}

#[tokio::test]
async fn successful_call_returns_data_and_quota() {
    let harness = Harness::new();
    harness.configure("alice", "stripe");
    let (_, secret) = harness.create_key(&harness.all_key_request("alice"));

    let response = harness.invoke(&secret, "stripe", "create-charge").await;
    assert!(response.success, "error: {:?}", response.error);
    let data = response.data.expect("data");
    assert_eq!(data["service"], json!("stripe"));
    let remaining = response
        .metadata
        .rate_limit_remaining
        .expect("rate limit metadata");
    assert_eq!(remaining.minute_remaining, 59);
    assert_eq!(remaining.day_remaining, 9_999);

    let logs = harness.logs("alice");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, "success");
    assert!(logs[0].response_preview.is_some());
    assert_eq!(logs[0].client_ip.as_deref(), Some("203.0.113.7"));

    let unit = harness.pool.get_unit("alice", "stripe").expect("unit");
    assert_eq!(unit.status(), UnitStatus::Idle);
    assert_eq!(unit.total_requests(), 1);

    let config = harness
        .vault
        .get_config("alice", "stripe", Environment::Production)
        .expect("get config")
        .expect("config");
    assert_eq!(config.total_calls, 1);
    assert_eq!(config.successful_calls, 1);
}

#[tokio::test]
async fn specific_key_denied_action_logs_unauthorized() {
    let harness = Harness::new();
    harness.configure("alice", "stripe");
    let mut request = harness.all_key_request("alice");
    request.scope_type = SCOPE_SPECIFIC.to_string();
    request.scopes = vec![ScopeSpec {
        service_key: "stripe".to_string(),
        allowed_actions: vec!["create-charge".to_string()],
    }];
    let (_, secret) = harness.create_key(&request);

    let allowed = harness.invoke(&secret, "stripe", "create-charge").await;
    assert!(allowed.success);

    let denied = harness.invoke(&secret, "stripe", "create-customer").await;
    assert!(!denied.success);
    assert_eq!(Harness::error_code(&denied), "ACTION_NOT_ALLOWED");

    let other_service = harness.invoke(&secret, "github", "list-repos").await;
    assert_eq!(Harness::error_code(&other_service), "SERVICE_NOT_IN_SCOPE");

    let logs = harness.logs("alice");
    let unauthorized = logs
        .iter()
        .filter(|log| log.status == "unauthorized")
        .count();
    assert_eq!(unauthorized, 2);
    assert!(logs
        .iter()
        .any(|log| log.error_code.as_deref() == Some("ACTION_NOT_ALLOWED")));
}

#[tokio::test]
async fn minute_rate_limit_admits_exactly_n_calls() {
    let harness = Harness::new();
    harness.configure("alice", "stripe");
    let mut request = harness.all_key_request("alice");
    request.rate_limit_per_minute = Some(2);
    let (_, secret) = harness.create_key(&request);

    for _ in 0..2 {
        let response = harness.invoke(&secret, "stripe", "list").await;
        assert!(response.success, "error: {:?}", response.error);
    }
    let limited = harness.invoke(&secret, "stripe", "list").await;
    assert!(!limited.success);
    assert_eq!(Harness::error_code(&limited), "RATE_LIMIT_EXCEEDED_MINUTE");
    let details = limited.error.expect("error").details.expect("details");
    assert_eq!(details["minute_remaining"], json!(0));

    let logs = harness.logs("alice");
    assert_eq!(
        logs.iter().filter(|log| log.status == "rate_limited").count(),
        1
    );
}

#[tokio::test]
async fn day_rate_limit_reports_zero_remaining() {
    let harness = Harness::new();
    harness.configure("alice", "stripe");
    let mut request = harness.all_key_request("alice");
    request.rate_limit_per_minute = Some(100);
    request.rate_limit_per_day = Some(1);
    let (_, secret) = harness.create_key(&request);

    let first = harness.invoke(&secret, "stripe", "list").await;
    assert!(first.success);

    let limited = harness.invoke(&secret, "stripe", "list").await;
    assert!(!limited.success);
    assert_eq!(Harness::error_code(&limited), "RATE_LIMIT_EXCEEDED_DAY");
    let details = limited.error.expect("error").details.expect("details");
    assert_eq!(details["day_remaining"], json!(0));
    assert!(details["day_resets_at"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn revoked_key_fails_with_generic_message() {
    let harness = Harness::new();
    harness.configure("alice", "stripe");
    let (key_id, secret) = harness.create_key(&harness.all_key_request("alice"));

    assert!(harness.invoke(&secret, "stripe", "list").await.success);

    harness
        .keys
        .revoke("alice", &key_id, "compromised")
        .expect("revoke");
    let denied = harness.invoke(&secret, "stripe", "list").await;
    assert!(!denied.success);
    assert_eq!(Harness::error_code(&denied), "INVALID_API_KEY");
    assert_eq!(
        denied.error.expect("error").message,
        "Invalid API key",
        "revocation details must never leak to the caller"
    );

    let stored = harness.keys.get("alice", &key_id).expect("get key");
    assert_eq!(stored.revoked_reason.as_deref(), Some("compromised"));
}

#[tokio::test]
async fn oversized_response_is_truncated_everywhere() {
    let harness = Harness::new();
    harness.configure("alice", "stripe");
    let (_, secret) = harness.create_key(&harness.all_key_request("alice"));

    let response = harness.invoke(&secret, "stripe", "dump").await;
    assert!(response.success);
    let data = response.data.expect("data");
    assert_eq!(data["truncated"], json!(true));
    assert!(data["size"].as_u64().unwrap() as usize > MAX_RESPONSE_BYTES);
    assert!(data["preview"].as_str().unwrap().chars().count() <= PREVIEW_MAX_CHARS);

    let logs = harness.logs("alice");
    let preview = logs[0].response_preview.as_deref().expect("preview");
    assert!(preview.chars().count() <= PREVIEW_MAX_CHARS);
}

#[tokio::test]
async fn unavailable_and_unconfigured_services_are_rejected() {
    let harness = Harness::new();
    let (_, secret) = harness.create_key(&harness.all_key_request("alice"));

    let unknown = harness.invoke(&secret, "airtable", "list").await;
    assert_eq!(Harness::error_code(&unknown), "SERVICE_NOT_FOUND");

    let unconfigured = harness.invoke(&secret, "stripe", "list").await;
    assert_eq!(Harness::error_code(&unconfigured), "SERVICE_NOT_CONFIGURED");

    harness.configure("alice", "stripe");
    harness
        .vault
        .toggle("alice", "stripe", Environment::Production, false)
        .expect("toggle");
    let disabled = harness.invoke(&secret, "stripe", "list").await;
    assert_eq!(Harness::error_code(&disabled), "SERVICE_NOT_ENABLED");

    harness
        .vault
        .toggle("alice", "stripe", Environment::Production, true)
        .expect("toggle");
    harness.catalog.disable("stripe").expect("disable");
    let unavailable = harness.invoke(&secret, "stripe", "list").await;
    assert_eq!(Harness::error_code(&unavailable), "SERVICE_UNAVAILABLE");

    // 每次被拒绝的调用都恰好落一条日志。
    assert_eq!(harness.logs("alice").len(), 4);
}

#[tokio::test]
async fn ip_allow_list_is_verbatim() {
    let harness = Harness::new();
    harness.configure("alice", "stripe");
    let mut request = harness.all_key_request("alice");
    request.allowed_ips = vec!["198.51.100.1".to_string()];
    let (_, secret) = harness.create_key(&request);

    let denied = harness.invoke(&secret, "stripe", "list").await;
    assert_eq!(Harness::error_code(&denied), "IP_NOT_ALLOWED");

    let allowed = harness
        .router
        .route(
            &RouteRequest {
                service: "stripe".to_string(),
                action: "list".to_string(),
                params: Value::Null,
            },
            &RouteContext {
                api_key: secret.clone(),
                client_ip: Some("198.51.100.1".to_string()),
                user_agent: None,
                environment: None,
            },
        )
        .await;
    assert!(allowed.success, "error: {:?}", allowed.error);
}

#[tokio::test]
async fn environment_allow_list_is_enforced() {
    let harness = Harness::new();
    harness.configure("alice", "stripe");
    let mut request = harness.all_key_request("alice");
    request.allowed_environments = vec![Environment::Development];
    let (_, secret) = harness.create_key(&request);

    let denied = harness.invoke(&secret, "stripe", "list").await;
    assert_eq!(Harness::error_code(&denied), "ENVIRONMENT_NOT_ALLOWED");
}

#[tokio::test]
async fn execution_failure_is_logged_and_unit_replaced() {
    let harness = Harness::new();
    harness.configure("alice", "stripe");
    let (_, secret) = harness.create_key(&harness.all_key_request("alice"));

    assert!(harness.invoke(&secret, "stripe", "list").await.success);
    let first = harness.pool.get_unit("alice", "stripe").expect("unit");

    let failed = harness.invoke(&secret, "stripe", "explode").await;
    assert!(!failed.success);
    assert_eq!(Harness::error_code(&failed), "MCP_CONNECTION_ERROR");
    assert_eq!(
        failed.error.expect("error").message,
        "service execution failed",
        "upstream detail must not leak"
    );
    assert!(harness.pool.get_unit("alice", "stripe").is_none());

    assert!(harness.invoke(&secret, "stripe", "list").await.success);
    let replacement = harness.pool.get_unit("alice", "stripe").expect("unit");
    assert!(!Arc::ptr_eq(&first, &replacement));

    let config = harness
        .vault
        .get_config("alice", "stripe", Environment::Production)
        .expect("get config")
        .expect("config");
    assert_eq!(config.total_calls, 3);
    assert_eq!(config.successful_calls, 2);
    assert_eq!(config.failed_calls, 1);

    let logs = harness.logs("alice");
    assert_eq!(logs.len(), 3);
    assert!(logs
        .iter()
        .any(|log| log.error_code.as_deref() == Some("MCP_CONNECTION_ERROR")));
}

#[tokio::test]
async fn idle_unit_past_timeout_is_replaced_on_next_call() {
    let harness = Harness::with_pool_config(PoolConfig {
        idle_timeout_s: 1,
        ..PoolConfig::default()
    });
    harness.configure("alice", "stripe");
    let (_, secret) = harness.create_key(&harness.all_key_request("alice"));

    assert!(harness.invoke(&secret, "stripe", "list").await.success);
    let first = harness.pool.get_unit("alice", "stripe").expect("unit");

    let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
    assert_eq!(harness.pool.sweep_idle(now + 10.0), 1);
    assert_eq!(first.status(), UnitStatus::Terminated);

    assert!(harness.invoke(&secret, "stripe", "list").await.success);
    let replacement = harness.pool.get_unit("alice", "stripe").expect("unit");
    assert!(!Arc::ptr_eq(&first, &replacement));
    assert_eq!(replacement.total_requests(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_share_a_single_unit() {
    let harness = Arc::new(Harness::new());
    harness.configure("alice", "stripe");
    let (_, secret) = harness.create_key(&harness.all_key_request("alice"));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let harness = harness.clone();
        let secret = secret.clone();
        tasks.push(tokio::spawn(async move {
            harness.invoke(&secret, "stripe", "list").await
        }));
    }
    for task in tasks {
        let response = task.await.expect("join");
        assert!(response.success, "error: {:?}", response.error);
    }

    assert_eq!(harness.pool.unit_count(), 1);
    let unit = harness.pool.get_unit("alice", "stripe").expect("unit");
    assert_eq!(unit.total_requests(), 8);
    assert_eq!(unit.pending_requests(), 0);
    assert_eq!(harness.logs("alice").len(), 8);
}

#[tokio::test]
async fn invalid_key_never_reaches_the_catalog() {
    let harness = Harness::new();
    let response = harness.invoke("ptw_bogus", "stripe", "list").await;
    assert!(!response.success);
    assert_eq!(Harness::error_code(&response), "INVALID_API_KEY");

    // 密钥校验失败的日志没有归属用户，按空 user_id 落盘。
    let logs = harness
        .storage
        .load_usage_logs(&UsageLogFilter::default())
        .expect("load logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, "unauthorized");
    assert_eq!(logs[0].user_id, "");
}
