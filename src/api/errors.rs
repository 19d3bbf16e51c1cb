use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

pub(crate) const TRACE_HEADER: &str = "x-trace-id";
pub(crate) const ERROR_CODE_HEADER: &str = "x-error-code";

#[derive(Debug, Clone)]
pub(crate) struct ErrorMeta {
    pub code: String,
    pub message: String,
    pub status: u16,
    pub hint: String,
    pub trace_id: String,
    pub timestamp: f64,
}

impl ErrorMeta {
    pub(crate) fn to_value(&self) -> Value {
        json!({
            "code": self.code,
            "message": self.message,
            "status": self.status,
            "hint": self.hint,
            "trace_id": self.trace_id,
            "timestamp": self.timestamp,
        })
    }
}

pub(crate) fn build_error_meta(
    status: StatusCode,
    code: Option<&str>,
    message: impl Into<String>,
    hint: Option<&str>,
) -> ErrorMeta {
    let message = message.into();
    let code = code
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default_error_code(status))
        .to_string();
    let hint = hint
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default_hint(status))
        .to_string();
    ErrorMeta {
        code,
        message,
        status: status.as_u16(),
        hint,
        trace_id: format!("err_{}", Uuid::new_v4().simple()),
        timestamp: now_unix_seconds(),
    }
}

pub(crate) fn status_for_error_code(code: &str) -> StatusCode {
    let normalized = code.trim().to_ascii_uppercase();
    match normalized.as_str() {
        "INVALID_API_KEY" | "AUTH_REQUIRED" | "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
        "IP_NOT_ALLOWED" | "SERVICE_NOT_IN_SCOPE" | "ACTION_NOT_ALLOWED"
        | "ENVIRONMENT_NOT_ALLOWED" | "FORBIDDEN" => StatusCode::FORBIDDEN,
        "SERVICE_NOT_FOUND" | "NOT_FOUND" | "KEY_NOT_FOUND" => StatusCode::NOT_FOUND,
        "SERVICE_NOT_CONFIGURED" | "SERVICE_NOT_ENABLED" | "CONFLICT" => StatusCode::CONFLICT,
        "INVALID_CREDENTIALS" => StatusCode::UNPROCESSABLE_ENTITY,
        "RATE_LIMIT_EXCEEDED_MINUTE" | "RATE_LIMIT_EXCEEDED_DAY" | "RATE_LIMITED" => {
            StatusCode::TOO_MANY_REQUESTS
        }
        "MCP_CONNECTION_ERROR" => StatusCode::BAD_GATEWAY,
        "SERVICE_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
        "CREDENTIAL_DECRYPTION_FAILED" | "INTERNAL_ERROR" => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    error_response_with_detail(status, None, message, None, None)
}

pub fn error_response_with_detail(
    status: StatusCode,
    code: Option<&str>,
    message: impl Into<String>,
    hint: Option<&str>,
    detail: Option<Value>,
) -> Response {
    let meta = build_error_meta(status, code, message, hint);
    let detail = build_detail_payload(&meta.message, detail);
    let payload = json!({
        "ok": false,
        "error": meta.to_value(),
        "detail": detail,
    });

    let mut response = (status, Json(payload)).into_response();
    if let Ok(value) = HeaderValue::from_str(&meta.trace_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(TRACE_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.code) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(ERROR_CODE_HEADER), value);
    }
    response
}

fn build_detail_payload(message: &str, detail: Option<Value>) -> Value {
    match detail {
        Some(Value::Object(mut map)) => {
            map.entry("message".to_string())
                .or_insert_with(|| Value::String(message.to_string()));
            Value::Object(map)
        }
        Some(value) => json!({
            "message": message,
            "detail": value,
        }),
        None => json!({
            "message": message,
        }),
    }
}

fn default_error_code(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "BAD_REQUEST",
        StatusCode::UNAUTHORIZED => "UNAUTHORIZED",
        StatusCode::FORBIDDEN => "FORBIDDEN",
        StatusCode::NOT_FOUND => "NOT_FOUND",
        StatusCode::CONFLICT => "CONFLICT",
        StatusCode::UNPROCESSABLE_ENTITY => "INVALID_CREDENTIALS",
        StatusCode::TOO_MANY_REQUESTS => "RATE_LIMITED",
        StatusCode::BAD_GATEWAY => "MCP_CONNECTION_ERROR",
        StatusCode::SERVICE_UNAVAILABLE => "SERVICE_UNAVAILABLE",
        _ if status.is_server_error() => "INTERNAL_ERROR",
        _ => "REQUEST_ERROR",
    }
}

fn default_hint(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "Verify request parameters and payload format.",
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            "Check the API key and its scope configuration."
        }
        StatusCode::NOT_FOUND => "Verify requested resource path or identifier.",
        StatusCode::CONFLICT => "Configure and enable the service before calling it.",
        StatusCode::UNPROCESSABLE_ENTITY => "Fix the listed credential fields and retry.",
        StatusCode::TOO_MANY_REQUESTS => "Back off until the reported reset time.",
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => {
            "The upstream service is unavailable, retry later."
        }
        _ if status.is_server_error() => "Retry later or contact support with trace_id.",
        _ => "Inspect request and try again.",
    }
}

fn now_unix_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
