// 执行池：按 (用户, 服务) 维护可复用执行单元，带容量上限与空闲回收。
use crate::config::PoolConfig;
use crate::executor::ActionExecutor;
use crate::storage::ServiceDefinitionRecord;
use anyhow::{anyhow, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Starting,
    Running,
    Idle,
    Error,
    Terminated,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Error => "error",
            Self::Terminated => "terminated",
        }
    }
}

struct UnitState {
    status: UnitStatus,
    last_activity_at: f64,
}

/// 单个池化执行单元：生命周期内持有解密凭证与调用模板。
pub struct PooledUnit {
    pub user_id: String,
    pub service_key: String,
    pub started_at: f64,
    definition: ServiceDefinitionRecord,
    credentials: HashMap<String, String>,
    state: Mutex<UnitState>,
    pending_requests: AtomicU32,
    total_requests: AtomicU64,
    idle_timeout_s: u64,
}

impl PooledUnit {
    fn new(
        user_id: &str,
        service_key: &str,
        definition: ServiceDefinitionRecord,
        credentials: HashMap<String, String>,
        idle_timeout_s: u64,
    ) -> Self {
        let now = now_ts();
        Self {
            user_id: user_id.to_string(),
            service_key: service_key.to_string(),
            started_at: now,
            definition,
            credentials,
            state: Mutex::new(UnitState {
                status: UnitStatus::Starting,
                last_activity_at: now,
            }),
            pending_requests: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            idle_timeout_s,
        }
    }

    pub fn status(&self) -> UnitStatus {
        self.state.lock().status
    }

    pub fn pending_requests(&self) -> u32 {
        self.pending_requests.load(Ordering::SeqCst)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::SeqCst)
    }

    pub fn last_activity_at(&self) -> f64 {
        self.state.lock().last_activity_at
    }

    fn is_reusable(&self) -> bool {
        matches!(
            self.status(),
            UnitStatus::Starting | UnitStatus::Running | UnitStatus::Idle
        )
    }

    fn begin_request(&self) {
        self.pending_requests.fetch_add(1, Ordering::SeqCst);
        self.total_requests.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.status = UnitStatus::Running;
        state.last_activity_at = now_ts();
    }

    fn finish_request(&self) {
        let remaining = self.pending_requests.fetch_sub(1, Ordering::SeqCst) - 1;
        let mut state = self.state.lock();
        state.last_activity_at = now_ts();
        if remaining == 0 && state.status == UnitStatus::Running {
            state.status = UnitStatus::Idle;
        }
    }

    fn mark(&self, status: UnitStatus) {
        let mut state = self.state.lock();
        state.status = status;
        state.last_activity_at = now_ts();
    }

    fn idle_expired(&self, now: f64) -> bool {
        let state = self.state.lock();
        state.status == UnitStatus::Idle
            && self.pending_requests.load(Ordering::SeqCst) == 0
            && now - state.last_activity_at > self.idle_timeout_s as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitSnapshot {
    pub user_id: String,
    pub service_key: String,
    pub status: UnitStatus,
    pub started_at: f64,
    pub last_activity_at: f64,
    pub pending_requests: u32,
    pub total_requests: u64,
    pub idle_timeout_s: u64,
}

#[derive(Debug, Clone)]
pub struct PoolExecution {
    pub data: Value,
    pub status: String,
    pub response_time_ms: f64,
    pub pool_acquisition_ms: f64,
}

pub struct ExecutionPool {
    units: DashMap<(String, String), Arc<PooledUnit>>,
    executor: Arc<dyn ActionExecutor>,
    config: PoolConfig,
    sweep_started: AtomicBool,
}

impl ExecutionPool {
    pub fn new(executor: Arc<dyn ActionExecutor>, config: PoolConfig) -> Self {
        Self {
            units: DashMap::new(),
            executor,
            config,
            sweep_started: AtomicBool::new(false),
        }
    }

    /// 调度一次外部调用：获取或创建执行单元，调用超时后单元按失败回收。
    pub async fn execute(
        &self,
        user_id: &str,
        service_key: &str,
        definition: &ServiceDefinitionRecord,
        credentials: HashMap<String, String>,
        action: &str,
        params: &Value,
    ) -> Result<PoolExecution> {
        let acquire_start = Instant::now();
        let unit = self.acquire(user_id, service_key, definition, credentials);
        let pool_acquisition_ms = acquire_start.elapsed().as_secs_f64() * 1000.0;

        unit.begin_request();
        let call_start = Instant::now();
        let call = self
            .executor
            .invoke(&unit.definition, &unit.credentials, action, params);
        let result = tokio::time::timeout(
            Duration::from_secs(self.config.execute_timeout_s.max(1)),
            call,
        )
        .await;
        let response_time_ms = call_start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(Ok(outcome)) => {
                unit.finish_request();
                Ok(PoolExecution {
                    data: outcome.data,
                    status: outcome.status,
                    response_time_ms,
                    pool_acquisition_ms,
                })
            }
            Ok(Err(err)) => {
                self.discard(&unit, "execution_error");
                Err(err)
            }
            Err(_) => {
                self.discard(&unit, "execution_timeout");
                Err(anyhow!(
                    "execution timed out after {}s",
                    self.config.execute_timeout_s
                ))
            }
        }
    }

    fn acquire(
        &self,
        user_id: &str,
        service_key: &str,
        definition: &ServiceDefinitionRecord,
        credentials: HashMap<String, String>,
    ) -> Arc<PooledUnit> {
        let key = (user_id.to_string(), service_key.to_string());
        if let Some(existing) = self.units.get(&key) {
            if existing.is_reusable() {
                return existing.clone();
            }
        }

        // 容量检查必须在持有 entry 锁之前，避免遍历同一分片时自锁。
        self.enforce_capacity(user_id);

        match self.units.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_reusable() {
                    occupied.get().clone()
                } else {
                    let fresh = Arc::new(PooledUnit::new(
                        user_id,
                        service_key,
                        definition.clone(),
                        credentials,
                        self.config.idle_timeout_s,
                    ));
                    occupied.insert(fresh.clone());
                    fresh
                }
            }
            Entry::Vacant(vacant) => {
                let fresh = Arc::new(PooledUnit::new(
                    user_id,
                    service_key,
                    definition.clone(),
                    credentials,
                    self.config.idle_timeout_s,
                ));
                vacant.insert(fresh.clone());
                fresh
            }
        }
    }

    /// 软上限：优先驱逐最旧空闲单元；无可驱逐时允许瞬时超额。
    fn enforce_capacity(&self, user_id: &str) {
        let user_count = self
            .units
            .iter()
            .filter(|entry| entry.key().0 == user_id)
            .count();
        if user_count >= self.config.max_processes_per_user.max(1) {
            self.evict_oldest_idle(Some(user_id), "evicted_user_capacity");
        }
        if self.units.len() >= self.config.max_total_processes.max(1) {
            self.evict_oldest_idle(None, "evicted_global_capacity");
        }
    }

    fn evict_oldest_idle(&self, user_id: Option<&str>, reason: &str) {
        let mut oldest: Option<((String, String), f64)> = None;
        for entry in self.units.iter() {
            if let Some(user_id) = user_id {
                if entry.key().0 != user_id {
                    continue;
                }
            }
            let unit = entry.value();
            if unit.status() != UnitStatus::Idle || unit.pending_requests() > 0 {
                continue;
            }
            let activity = unit.last_activity_at();
            if oldest
                .as_ref()
                .map(|(_, current)| activity < *current)
                .unwrap_or(true)
            {
                oldest = Some((entry.key().clone(), activity));
            }
        }
        let Some((key, _)) = oldest else {
            return;
        };
        let removed = self.units.remove_if(&key, |_, unit| {
            unit.status() == UnitStatus::Idle && unit.pending_requests() == 0
        });
        if let Some((_, unit)) = removed {
            unit.mark(UnitStatus::Terminated);
            info!(
                user_id = %unit.user_id,
                service_key = %unit.service_key,
                termination_reason = reason,
                "pooled unit terminated"
            );
        }
    }

    fn discard(&self, unit: &Arc<PooledUnit>, reason: &str) {
        unit.pending_requests.fetch_sub(1, Ordering::SeqCst);
        unit.mark(UnitStatus::Error);
        let key = (unit.user_id.clone(), unit.service_key.clone());
        self.units
            .remove_if(&key, |_, current| Arc::ptr_eq(current, unit));
        info!(
            user_id = %unit.user_id,
            service_key = %unit.service_key,
            termination_reason = reason,
            "pooled unit terminated"
        );
    }

    /// 空闲回收一轮；绝不回收仍有在途请求的单元。
    pub fn sweep_idle(&self, now: f64) -> usize {
        let expired = self
            .units
            .iter()
            .filter(|entry| entry.value().idle_expired(now))
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();
        let mut removed = 0usize;
        for key in expired {
            if let Some((_, unit)) = self.units.remove_if(&key, |_, unit| unit.idle_expired(now)) {
                unit.mark(UnitStatus::Terminated);
                removed += 1;
                info!(
                    user_id = %unit.user_id,
                    service_key = %unit.service_key,
                    termination_reason = "idle_timeout",
                    "pooled unit terminated"
                );
            }
        }
        removed
    }

    pub fn spawn_maintenance(self: Arc<Self>) {
        if self
            .sweep_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let interval_s = self.config.sweep_interval_s.max(1);
        let pool = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(interval_s));
            tick.tick().await;
            loop {
                tick.tick().await;
                let removed = pool.sweep_idle(now_ts());
                if removed > 0 {
                    debug!("idle sweep removed {removed} pooled units");
                }
            }
        });
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn get_unit(&self, user_id: &str, service_key: &str) -> Option<Arc<PooledUnit>> {
        self.units
            .get(&(user_id.to_string(), service_key.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn snapshot(&self) -> Vec<UnitSnapshot> {
        self.units
            .iter()
            .map(|entry| {
                let unit = entry.value();
                UnitSnapshot {
                    user_id: unit.user_id.clone(),
                    service_key: unit.service_key.clone(),
                    status: unit.status(),
                    started_at: unit.started_at,
                    last_activity_at: unit.last_activity_at(),
                    pending_requests: unit.pending_requests(),
                    total_requests: unit.total_requests(),
                    idle_timeout_s: unit.idle_timeout_s,
                }
            })
            .collect()
    }
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ActionOutcome;
    use async_trait::async_trait;
    use serde_json::json;

    struct ScriptedExecutor {
        fail_action: Option<String>,
    }

    #[async_trait]
    impl ActionExecutor for ScriptedExecutor {
        async fn invoke(
            &self,
            definition: &ServiceDefinitionRecord,
            _credentials: &HashMap<String, String>,
            action: &str,
            _params: &Value,
        ) -> Result<ActionOutcome> {
            if self.fail_action.as_deref() == Some(action) {
                return Err(anyhow!("simulated transport failure"));
            }
            Ok(ActionOutcome {
                data: json!({"service": definition.service_key, "action": action}),
                status: "ok".to_string(),
            })
        }
    }

    fn definition(service_key: &str) -> ServiceDefinitionRecord {
        ServiceDefinitionRecord {
            service_key: service_key.to_string(),
            name: service_key.to_string(),
            description: String::new(),
            category: String::new(),
            credential_fields: Vec::new(),
            invocation: Default::default(),
            health_check_url: None,
            is_available: true,
            is_beta: false,
            created_at: 0.0,
            updated_at: 0.0,
        }
    }

    fn pool(fail_action: Option<&str>, config: PoolConfig) -> Arc<ExecutionPool> {
        Arc::new(ExecutionPool::new(
            Arc::new(ScriptedExecutor {
                fail_action: fail_action.map(str::to_string),
            }),
            config,
        ))
    }

    #[tokio::test]
    async fn unit_is_reused_for_same_pair() {
        let pool = pool(None, PoolConfig::default());
        for _ in 0..3 {
            pool.execute(
                "alice",
                "stripe",
                &definition("stripe"),
                HashMap::new(),
                "list",
                &Value::Null,
            )
            .await
            .expect("execute");
        }
        assert_eq!(pool.unit_count(), 1);
        let unit = pool.get_unit("alice", "stripe").expect("unit");
        assert_eq!(unit.total_requests(), 3);
        assert_eq!(unit.status(), UnitStatus::Idle);
        assert_eq!(unit.pending_requests(), 0);
    }

    #[tokio::test]
    async fn failed_execution_discards_the_unit() {
        let pool = pool(Some("explode"), PoolConfig::default());
        pool.execute(
            "alice",
            "stripe",
            &definition("stripe"),
            HashMap::new(),
            "list",
            &Value::Null,
        )
        .await
        .expect("execute");
        let first = pool.get_unit("alice", "stripe").expect("unit");

        let err = pool
            .execute(
                "alice",
                "stripe",
                &definition("stripe"),
                HashMap::new(),
                "explode",
                &Value::Null,
            )
            .await
            .expect_err("failure");
        assert!(err.to_string().contains("transport failure"));
        assert!(pool.get_unit("alice", "stripe").is_none());
        assert_eq!(first.status(), UnitStatus::Error);

        // 失败后的下一次调用分配新单元。
        pool.execute(
            "alice",
            "stripe",
            &definition("stripe"),
            HashMap::new(),
            "list",
            &Value::Null,
        )
        .await
        .expect("execute");
        let fresh = pool.get_unit("alice", "stripe").expect("unit");
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert_eq!(fresh.total_requests(), 1);
    }

    #[tokio::test]
    async fn idle_sweep_terminates_expired_units_only() {
        let config = PoolConfig {
            idle_timeout_s: 1,
            ..PoolConfig::default()
        };
        let pool = pool(None, config);
        pool.execute(
            "alice",
            "stripe",
            &definition("stripe"),
            HashMap::new(),
            "list",
            &Value::Null,
        )
        .await
        .expect("execute");
        let unit = pool.get_unit("alice", "stripe").expect("unit");

        assert_eq!(pool.sweep_idle(now_ts()), 0);
        assert_eq!(pool.sweep_idle(now_ts() + 5.0), 1);
        assert_eq!(unit.status(), UnitStatus::Terminated);
        assert!(pool.get_unit("alice", "stripe").is_none());
    }

    #[tokio::test]
    async fn sweep_never_terminates_busy_units() {
        let config = PoolConfig {
            idle_timeout_s: 1,
            ..PoolConfig::default()
        };
        let pool = pool(None, config);
        pool.execute(
            "alice",
            "stripe",
            &definition("stripe"),
            HashMap::new(),
            "list",
            &Value::Null,
        )
        .await
        .expect("execute");
        let unit = pool.get_unit("alice", "stripe").expect("unit");
        unit.begin_request();
        assert_eq!(pool.sweep_idle(now_ts() + 100.0), 0);
        assert_eq!(pool.unit_count(), 1);
        unit.finish_request();
        assert_eq!(pool.sweep_idle(now_ts() + 100.0), 1);
    }

    #[tokio::test]
    async fn per_user_capacity_evicts_oldest_idle_unit() {
        let config = PoolConfig {
            max_processes_per_user: 2,
            ..PoolConfig::default()
        };
        let pool = pool(None, config);
        for service in ["stripe", "github", "slack"] {
            pool.execute(
                "alice",
                service,
                &definition(service),
                HashMap::new(),
                "list",
                &Value::Null,
            )
            .await
            .expect("execute");
            // 拉开毫秒级活跃时间戳，保证最旧单元判定稳定。
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.unit_count(), 2);
        // stripe 是最旧的空闲单元，应当已被驱逐。
        assert!(pool.get_unit("alice", "stripe").is_none());
        assert!(pool.get_unit("alice", "slack").is_some());
    }
}
