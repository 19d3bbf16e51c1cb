// 动作执行器：池内调度的外部调用接缝，参考实现为模拟执行。
use crate::config::ExecutorConfig;
use crate::storage::ServiceDefinitionRecord;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub data: Value,
    pub status: String,
}

/// 真实的第三方适配器在外部按此契约实现，逐服务接入。
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn invoke(
        &self,
        definition: &ServiceDefinitionRecord,
        credentials: &HashMap<String, String>,
        action: &str,
        params: &Value,
    ) -> Result<ActionOutcome>;
}

/// 模拟执行器：回显调用描述，绝不回显凭证值。
pub struct SimulatedExecutor;

#[async_trait]
impl ActionExecutor for SimulatedExecutor {
    async fn invoke(
        &self,
        definition: &ServiceDefinitionRecord,
        credentials: &HashMap<String, String>,
        action: &str,
        params: &Value,
    ) -> Result<ActionOutcome> {
        let env_names = definition
            .invocation
            .env_mapping
            .iter()
            .filter(|(credential_key, _)| credentials.contains_key(credential_key.as_str()))
            .map(|(_, env_name)| env_name.clone())
            .collect::<Vec<_>>();
        let data = json!({
            "simulated": true,
            "service": definition.service_key,
            "action": action,
            "params": params,
            "command": definition.invocation.command,
            "env": env_names,
        });
        Ok(ActionOutcome {
            data,
            status: "ok".to_string(),
        })
    }
}

pub fn build_executor(config: &ExecutorConfig) -> Result<Arc<dyn ActionExecutor>> {
    match config.mode.trim().to_lowercase().as_str() {
        "" | "simulated" | "mock" => Ok(Arc::new(SimulatedExecutor)),
        other => Err(anyhow!("unknown executor mode: {other}")),
    }
}

#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub healthy: bool,
    pub status_code: Option<u16>,
    pub message: String,
}

/// 健康探测客户端：用凭证派生的鉴权头访问服务声明的健康端点。
pub struct HealthProbe {
    client: reqwest::Client,
}

const BEARER_CREDENTIAL_KEYS: [&str; 5] = ["api_key", "token", "access_token", "key", "secret"];

impl HealthProbe {
    pub fn new(timeout_s: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_s.max(1)))
            .build()?;
        Ok(Self { client })
    }

    pub async fn probe(
        &self,
        definition: &ServiceDefinitionRecord,
        credentials: &HashMap<String, String>,
    ) -> Result<ProbeOutcome> {
        let url = definition
            .health_check_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("service declares no health check endpoint"))?;
        let headers = Self::build_headers(credentials)?;
        let response = self.client.get(url).headers(headers).send().await?;
        let status = response.status();
        let code = status.as_u16();
        if status.is_success() {
            return Ok(ProbeOutcome {
                healthy: true,
                status_code: Some(code),
                message: "connection verified".to_string(),
            });
        }
        let message = match code {
            401 | 403 => "authentication failed, check the configured credentials".to_string(),
            _ => format!("health check returned status {code}"),
        };
        Ok(ProbeOutcome {
            healthy: false,
            status_code: Some(code),
            message,
        })
    }

    fn build_headers(credentials: &HashMap<String, String>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let token = BEARER_CREDENTIAL_KEYS
            .iter()
            .find_map(|key| credentials.get(*key))
            .map(|value| value.trim())
            .filter(|value| !value.is_empty());
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InvocationTemplate;

    fn definition() -> ServiceDefinitionRecord {
        ServiceDefinitionRecord {
            service_key: "stripe".to_string(),
            name: "Stripe".to_string(),
            description: String::new(),
            category: "payments".to_string(),
            credential_fields: Vec::new(),
            invocation: InvocationTemplate {
                command: "stripe-adapter".to_string(),
                args: vec!["--stdio".to_string()],
                env_mapping: HashMap::from([
                    ("api_key".to_string(), "STRIPE_API_KEY".to_string()),
                    ("missing".to_string(), "STRIPE_UNUSED".to_string()),
                ]),
            },
            health_check_url: None,
            is_available: true,
            is_beta: false,
            created_at: 0.0,
            updated_at: 0.0,
        }
    }

    #[tokio::test]
    async fn simulated_invoke_never_echoes_credential_values() {
        let executor = SimulatedExecutor;
        let credentials =
            HashMap::from([("api_key".to_string(), "sk_live_super_secret".to_string())]);
        let outcome = executor
            .invoke(
                &definition(),
                &credentials,
                "create-charge",
                &json!({"amount": 100}),
            )
            .await
            .expect("invoke");
        assert_eq!(outcome.status, "ok");
        let rendered = outcome.data.to_string();
        assert!(!rendered.contains("sk_live_super_secret"));
        assert!(rendered.contains("STRIPE_API_KEY"));
        assert!(!rendered.contains("STRIPE_UNUSED"));
    }

    #[test]
    fn build_executor_rejects_unknown_mode() {
        let config = ExecutorConfig {
            mode: "kubernetes".to_string(),
            probe_timeout_s: 10,
        };
        assert!(build_executor(&config).is_err());
    }

    #[tokio::test]
    async fn probe_requires_declared_endpoint() {
        let probe = HealthProbe::new(1).expect("probe");
        let err = probe
            .probe(&definition(), &HashMap::new())
            .await
            .expect_err("no endpoint");
        assert!(err.to_string().contains("health check endpoint"));
    }
}
