// API 请求与响应数据结构，保持与对外接口字段一致。
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Staging,
    #[default]
    Production,
}

impl Environment {
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Self::Development),
            "staging" => Some(Self::Staging),
            "production" | "prod" => Some(Self::Production),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteRequest {
    pub service: String,
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Default)]
pub struct RouteContext {
    pub api_key: String,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub environment: Option<Environment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RouteErrorBody>,
    pub metadata: RouteMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteMetadata {
    pub request_id: String,
    pub service: String,
    pub action: String,
    pub response_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_remaining: Option<RateLimitRemaining>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitRemaining {
    pub minute_remaining: i64,
    pub day_remaining: i64,
    pub minute_resets_at: f64,
    pub day_resets_at: f64,
}
