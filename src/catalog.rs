// 服务目录：平台运营维护的集成定义与凭证校验规则。
use crate::storage::{
    CredentialFieldRule, ServiceDefinitionRecord, ServiceListFilter, StorageBackend,
};
use anyhow::{anyhow, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct CredentialCheck {
    pub valid: bool,
    pub errors: Vec<String>,
}

pub struct ServiceCatalog {
    storage: Arc<dyn StorageBackend>,
}

impl ServiceCatalog {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub fn list(&self, filter: &ServiceListFilter) -> Result<Vec<ServiceDefinitionRecord>> {
        self.storage.list_service_definitions(filter)
    }

    pub fn get_by_key(&self, service_key: &str) -> Result<Option<ServiceDefinitionRecord>> {
        let key = service_key.trim();
        if key.is_empty() {
            return Ok(None);
        }
        self.storage.get_service_definition(key)
    }

    /// 运营端新增服务定义，service_key 一经创建不可变更。
    pub fn add(&self, mut record: ServiceDefinitionRecord) -> Result<ServiceDefinitionRecord> {
        record.service_key = record.service_key.trim().to_string();
        if record.service_key.is_empty() {
            return Err(anyhow!("service_key is required"));
        }
        if record.name.trim().is_empty() {
            return Err(anyhow!("service name is required"));
        }
        if self
            .storage
            .get_service_definition(&record.service_key)?
            .is_some()
        {
            return Err(anyhow!("service already exists: {}", record.service_key));
        }
        let now = now_ts();
        record.created_at = now;
        record.updated_at = now;
        self.storage.upsert_service_definition(&record)?;
        Ok(record)
    }

    pub fn update(&self, mut record: ServiceDefinitionRecord) -> Result<ServiceDefinitionRecord> {
        record.service_key = record.service_key.trim().to_string();
        let existing = self
            .storage
            .get_service_definition(&record.service_key)?
            .ok_or_else(|| anyhow!("service not found: {}", record.service_key))?;
        record.created_at = existing.created_at;
        record.updated_at = now_ts();
        self.storage.upsert_service_definition(&record)?;
        Ok(record)
    }

    pub fn disable(&self, service_key: &str) -> Result<bool> {
        self.storage.set_service_availability(service_key, false)
    }

    /// 按定义的声明式规则校验提交凭证，聚合全部违规而非短路。
    pub fn validate_credentials(
        &self,
        definition: &ServiceDefinitionRecord,
        submitted: &HashMap<String, String>,
    ) -> CredentialCheck {
        let mut errors = Vec::new();
        for field in &definition.credential_fields {
            let value = submitted
                .get(&field.key)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty());
            let Some(value) = value else {
                if field.required {
                    errors.push(format!("{} is required", field.label));
                }
                continue;
            };
            if let Some(min) = field.min_length {
                if value.chars().count() < min {
                    errors.push(format!("{} must be at least {min} characters", field.label));
                }
            }
            if let Some(max) = field.max_length {
                if value.chars().count() > max {
                    errors.push(format!("{} must be at most {max} characters", field.label));
                }
            }
            if let Some(pattern) = field.pattern.as_deref() {
                match Regex::new(pattern) {
                    Ok(rule) => {
                        if !rule.is_match(value) {
                            errors.push(format!("{} format is invalid", field.label));
                        }
                    }
                    Err(err) => {
                        warn!(
                            "invalid credential pattern for {}.{}: {err}",
                            definition.service_key, field.key
                        );
                    }
                }
            }
        }
        CredentialCheck {
            valid: errors.is_empty(),
            errors,
        }
    }
}

pub fn credential_field(key: &str, label: &str, required: bool) -> CredentialFieldRule {
    CredentialFieldRule {
        key: key.to_string(),
        label: label.to_string(),
        required,
        min_length: None,
        max_length: None,
        pattern: None,
    }
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
