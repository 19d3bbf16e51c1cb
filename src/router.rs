// 路由器：唯一入口，串联鉴权、限流、作用域、目录、凭证与执行池。
use crate::catalog::ServiceCatalog;
use crate::keys::{KeyRegistry, RateLimitStatus};
use crate::pool::ExecutionPool;
use crate::schemas::{
    Environment, RateLimitRemaining, RouteContext, RouteErrorBody, RouteMetadata, RouteRequest,
    RouterResponse,
};
use crate::storage::{StorageBackend, UsageLogRecord};
use crate::vault::CredentialVault;
use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};
use uuid::Uuid;

pub const MAX_RESPONSE_BYTES: usize = 10 * 1024;
pub const PREVIEW_MAX_CHARS: usize = 1000;

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";
pub const STATUS_RATE_LIMITED: &str = "rate_limited";
pub const STATUS_UNAUTHORIZED: &str = "unauthorized";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidApiKey,
    IpNotAllowed,
    RateLimitExceededMinute,
    RateLimitExceededDay,
    ServiceNotInScope,
    ActionNotAllowed,
    EnvironmentNotAllowed,
    ServiceNotFound,
    ServiceUnavailable,
    ServiceNotConfigured,
    ServiceNotEnabled,
    CredentialDecryptionFailed,
    McpConnectionError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidApiKey => "INVALID_API_KEY",
            Self::IpNotAllowed => "IP_NOT_ALLOWED",
            Self::RateLimitExceededMinute => "RATE_LIMIT_EXCEEDED_MINUTE",
            Self::RateLimitExceededDay => "RATE_LIMIT_EXCEEDED_DAY",
            Self::ServiceNotInScope => "SERVICE_NOT_IN_SCOPE",
            Self::ActionNotAllowed => "ACTION_NOT_ALLOWED",
            Self::EnvironmentNotAllowed => "ENVIRONMENT_NOT_ALLOWED",
            Self::ServiceNotFound => "SERVICE_NOT_FOUND",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::ServiceNotConfigured => "SERVICE_NOT_CONFIGURED",
            Self::ServiceNotEnabled => "SERVICE_NOT_ENABLED",
            Self::CredentialDecryptionFailed => "CREDENTIAL_DECRYPTION_FAILED",
            Self::McpConnectionError => "MCP_CONNECTION_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    fn log_status(&self) -> &'static str {
        match self {
            Self::InvalidApiKey
            | Self::IpNotAllowed
            | Self::ServiceNotInScope
            | Self::ActionNotAllowed
            | Self::EnvironmentNotAllowed => STATUS_UNAUTHORIZED,
            Self::RateLimitExceededMinute | Self::RateLimitExceededDay => STATUS_RATE_LIMITED,
            _ => STATUS_ERROR,
        }
    }
}

struct Rejection {
    code: ErrorCode,
    message: String,
    details: Option<Value>,
}

impl Rejection {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

enum PipelineError {
    Reject(Rejection),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

struct PipelineSuccess {
    data: Value,
    remaining: RateLimitRemaining,
    pool_acquisition_ms: f64,
    external_call_ms: f64,
}

pub struct ServiceRouter {
    storage: Arc<dyn StorageBackend>,
    catalog: Arc<ServiceCatalog>,
    vault: Arc<CredentialVault>,
    keys: Arc<KeyRegistry>,
    pool: Arc<ExecutionPool>,
}

impl ServiceRouter {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        catalog: Arc<ServiceCatalog>,
        vault: Arc<CredentialVault>,
        keys: Arc<KeyRegistry>,
        pool: Arc<ExecutionPool>,
    ) -> Self {
        Self {
            storage,
            catalog,
            vault,
            keys,
            pool,
        }
    }

    /// 处理一次入站调用：每个被拒绝或失败的调用都恰好落一条使用日志。
    pub async fn route(&self, request: &RouteRequest, context: &RouteContext) -> RouterResponse {
        let request_id = format!("req_{}", Uuid::new_v4().simple());
        let started = Instant::now();
        let mut log = UsageLogRecord {
            request_id: request_id.clone(),
            user_id: String::new(),
            api_key_id: None,
            service_key: request.service.clone(),
            action: request.action.clone(),
            status: STATUS_ERROR.to_string(),
            error_code: None,
            total_ms: 0.0,
            pool_acquisition_ms: 0.0,
            external_call_ms: 0.0,
            client_ip: context.client_ip.clone(),
            user_agent: context.user_agent.clone(),
            response_preview: None,
            created_at: now_ts(),
        };

        let outcome = self.run_pipeline(request, context, &mut log).await;
        let total_ms = started.elapsed().as_secs_f64() * 1000.0;
        log.total_ms = total_ms;

        let response = match outcome {
            Ok(success) => {
                log.status = STATUS_SUCCESS.to_string();
                log.pool_acquisition_ms = success.pool_acquisition_ms;
                log.external_call_ms = success.external_call_ms;
                log.response_preview = Some(preview_of(&success.data));
                RouterResponse {
                    success: true,
                    data: Some(success.data),
                    error: None,
                    metadata: RouteMetadata {
                        request_id,
                        service: request.service.clone(),
                        action: request.action.clone(),
                        response_time_ms: total_ms,
                        rate_limit_remaining: Some(success.remaining),
                    },
                }
            }
            Err(PipelineError::Reject(rejection)) => {
                log.status = rejection.code.log_status().to_string();
                log.error_code = Some(rejection.code.as_str().to_string());
                RouterResponse {
                    success: false,
                    data: None,
                    error: Some(RouteErrorBody {
                        code: rejection.code.as_str().to_string(),
                        message: rejection.message,
                        details: rejection.details,
                    }),
                    metadata: RouteMetadata {
                        request_id,
                        service: request.service.clone(),
                        action: request.action.clone(),
                        response_time_ms: total_ms,
                        rate_limit_remaining: None,
                    },
                }
            }
            Err(PipelineError::Internal(err)) => {
                // 内部细节只进服务端日志，响应保持泛化。
                error!("router internal failure for {}: {err:#}", request.service);
                log.status = STATUS_ERROR.to_string();
                log.error_code = Some(ErrorCode::InternalError.as_str().to_string());
                RouterResponse {
                    success: false,
                    data: None,
                    error: Some(RouteErrorBody {
                        code: ErrorCode::InternalError.as_str().to_string(),
                        message: "internal error".to_string(),
                        details: None,
                    }),
                    metadata: RouteMetadata {
                        request_id,
                        service: request.service.clone(),
                        action: request.action.clone(),
                        response_time_ms: total_ms,
                        rate_limit_remaining: None,
                    },
                }
            }
        };

        if let Err(err) = self.storage.append_usage_log(&log) {
            warn!("append usage log failed for {}: {err}", log.request_id);
        }
        response
    }

    async fn run_pipeline(
        &self,
        request: &RouteRequest,
        context: &RouteContext,
        log: &mut UsageLogRecord,
    ) -> Result<PipelineSuccess, PipelineError> {
        let environment = context.environment.unwrap_or_default();

        // 1. 密钥校验：不泄露具体失败原因。
        let Some(key_record) = self.keys.validate(&context.api_key)? else {
            return Err(PipelineError::Reject(Rejection::new(
                ErrorCode::InvalidApiKey,
                "Invalid API key",
            )));
        };
        log.user_id = key_record.user_id.clone();
        log.api_key_id = Some(key_record.id.clone());

        // 2. 来源 IP 白名单。
        if let Some(client_ip) = context.client_ip.as_deref() {
            if !KeyRegistry::check_ip_access(&key_record, client_ip) {
                return Err(PipelineError::Reject(Rejection::new(
                    ErrorCode::IpNotAllowed,
                    "request origin is not allowed for this API key",
                )));
            }
        }

        // 3. 限流：拒绝时附带当前配额与重置时间，便于调用方退避。
        let now = now_ts();
        let rate = self.keys.check_rate_limit(&key_record, now)?;
        if !rate.allowed {
            let code = if rate.minute_remaining == 0 {
                ErrorCode::RateLimitExceededMinute
            } else {
                ErrorCode::RateLimitExceededDay
            };
            let message = match code {
                ErrorCode::RateLimitExceededMinute => "per-minute rate limit exceeded",
                _ => "daily rate limit exceeded",
            };
            return Err(PipelineError::Reject(
                Rejection::new(code, message).with_details(rate_details(&rate)),
            ));
        }

        // 4./5. 服务与动作作用域。
        if !self
            .keys
            .check_service_access(&key_record, &request.service)?
        {
            return Err(PipelineError::Reject(Rejection::new(
                ErrorCode::ServiceNotInScope,
                format!("API key does not grant access to service '{}'", request.service),
            )));
        }
        if !self
            .keys
            .check_action_access(&key_record, &request.service, &request.action)?
        {
            return Err(PipelineError::Reject(Rejection::new(
                ErrorCode::ActionNotAllowed,
                format!(
                    "API key does not allow action '{}' on service '{}'",
                    request.action, request.service
                ),
            )));
        }
        if !KeyRegistry::check_environment_access(&key_record, environment) {
            return Err(PipelineError::Reject(Rejection::new(
                ErrorCode::EnvironmentNotAllowed,
                format!(
                    "API key is not valid for the {} environment",
                    environment.as_str()
                ),
            )));
        }

        // 6. 目录解析与可用性。
        let Some(definition) = self.catalog.get_by_key(&request.service)? else {
            return Err(PipelineError::Reject(Rejection::new(
                ErrorCode::ServiceNotFound,
                format!("service not found: {}", request.service),
            )));
        };
        if !definition.is_available {
            return Err(PipelineError::Reject(Rejection::new(
                ErrorCode::ServiceUnavailable,
                format!("service is currently unavailable: {}", request.service),
            )));
        }

        // 7. 调用方的凭证配置。
        let Some(config) =
            self.vault
                .get_config(&key_record.user_id, &request.service, environment)?
        else {
            return Err(PipelineError::Reject(Rejection::new(
                ErrorCode::ServiceNotConfigured,
                format!(
                    "service '{}' is not configured for the {} environment",
                    request.service,
                    environment.as_str()
                ),
            )));
        };
        if !config.is_enabled {
            return Err(PipelineError::Reject(Rejection::new(
                ErrorCode::ServiceNotEnabled,
                format!("service '{}' is disabled for this account", request.service),
            )));
        }

        // 8. 凭证解密：细节只落服务端日志。
        let credentials = match self.vault.decrypt_credentials(&config) {
            Ok(credentials) => credentials,
            Err(err) => {
                error!(
                    "credential decryption failed for {}/{}: {err}",
                    key_record.user_id, request.service
                );
                return Err(PipelineError::Reject(Rejection::new(
                    ErrorCode::CredentialDecryptionFailed,
                    "stored credentials could not be prepared for dispatch",
                )));
            }
        };

        // 9. 执行池调度。
        let execution = match self
            .pool
            .execute(
                &key_record.user_id,
                &request.service,
                &definition,
                credentials,
                &request.action,
                &request.params,
            )
            .await
        {
            Ok(execution) => execution,
            Err(err) => {
                error!(
                    "execution failed for {}/{}@{}: {err:#}",
                    key_record.user_id, request.service, request.action
                );
                self.record_outcome(&key_record.user_id, &request.service, environment, false);
                return Err(PipelineError::Reject(Rejection::new(
                    ErrorCode::McpConnectionError,
                    "service execution failed",
                )));
            }
        };

        // 10. 完全通过后才计入限流与调用计数。
        self.keys.increment_rate_limit(&key_record, now)?;
        self.record_outcome(&key_record.user_id, &request.service, environment, true);

        let remaining = RateLimitRemaining {
            minute_remaining: (rate.minute_remaining - 1).max(0),
            day_remaining: (rate.day_remaining - 1).max(0),
            minute_resets_at: rate.minute_resets_at,
            day_resets_at: rate.day_resets_at,
        };
        Ok(PipelineSuccess {
            data: cap_response(execution.data),
            remaining,
            pool_acquisition_ms: execution.pool_acquisition_ms,
            external_call_ms: execution.response_time_ms,
        })
    }

    fn record_outcome(
        &self,
        user_id: &str,
        service_key: &str,
        environment: Environment,
        success: bool,
    ) {
        if let Err(err) = self
            .vault
            .record_outcome(user_id, service_key, environment, success)
        {
            warn!("record call outcome failed for {user_id}/{service_key}: {err}");
        }
    }
}

fn rate_details(rate: &RateLimitStatus) -> Value {
    json!({
        "minute_limit": rate.minute_limit,
        "minute_remaining": rate.minute_remaining,
        "minute_resets_at": rate.minute_resets_at,
        "day_limit": rate.day_limit,
        "day_remaining": rate.day_remaining,
        "day_resets_at": rate.day_resets_at,
    })
}

/// 超过 10KB 的响应体替换为截断标记，限制日志与响应体量。
pub fn cap_response(data: Value) -> Value {
    let rendered = data.to_string();
    if rendered.len() <= MAX_RESPONSE_BYTES {
        return data;
    }
    json!({
        "truncated": true,
        "size": rendered.len(),
        "preview": rendered.chars().take(PREVIEW_MAX_CHARS).collect::<String>(),
    })
}

fn preview_of(data: &Value) -> String {
    data.to_string().chars().take(PREVIEW_MAX_CHARS).collect()
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
