// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::circuit_breaker::{
    BreakerScope, BreakerView, CircuitBreakerState, CircuitStatus,
};
use crate::domain::models::sync_job::JobType;
use crate::domain::repositories::state_store::{load_json, update_json, StateStore, StateStoreError};
use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge};
use std::sync::Arc;
use uuid::Uuid;

/// 熔断器配置
#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// 失败阈值
    pub failure_threshold: u32,
    /// 失败时间窗口
    pub failure_window: Duration,
    /// 初始冷却时间
    pub cool_down: Duration,
    /// 探测失败后冷却时间的放大倍数
    pub cool_down_multiplier: f64,
    /// 冷却时间上限
    pub max_cool_down: Duration,
    /// 探测任务超过该时长未确认视为丢失
    pub probe_timeout: Duration,
    /// 熔断键作用域
    pub scope: BreakerScope,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::seconds(300),
            cool_down: Duration::seconds(60),
            cool_down_multiplier: 2.0,
            max_cool_down: Duration::seconds(3600),
            probe_timeout: Duration::seconds(1800),
            scope: BreakerScope::Instance,
        }
    }
}

/// 生成熔断键
///
/// 同一仓库的不同任务类型互不影响
///
/// # 参数
///
/// * `scope` - 作用域
/// * `instance_id` - 上游实例
/// * `repo_id` - 仓库ID
/// * `job_type` - 任务类型
pub fn build_circuit_breaker_key(
    scope: BreakerScope,
    instance_id: &str,
    repo_id: Uuid,
    job_type: JobType,
) -> String {
    match scope {
        BreakerScope::Instance => format!("cb:instance:{}:{}", instance_id, job_type),
        BreakerScope::Repo => format!("cb:repo:{}:{}", repo_id, job_type),
    }
}

/// 熔断器控制器
///
/// 状态保存在共享键值存储中，所有写入都是比较并交换循环
#[derive(Clone)]
pub struct CircuitBreakerController {
    store: Arc<dyn StateStore>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerController {
    pub fn new(store: Arc<dyn StateStore>, config: CircuitBreakerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// 生成当前作用域下的熔断键
    pub fn key_for(&self, instance_id: &str, repo_id: Uuid, job_type: JobType) -> String {
        build_circuit_breaker_key(self.config.scope, instance_id, repo_id, job_type)
    }

    fn initial(&self, key: &str) -> CircuitBreakerState {
        CircuitBreakerState::closed(key, self.config.cool_down)
    }

    /// 读取熔断器视图
    ///
    /// # 返回值
    ///
    /// 冷却结束的 Open 状态报告为 HalfOpen，过期的探测不再计为在途
    pub async fn snapshot(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<BreakerView, StateStoreError> {
        let state: Option<CircuitBreakerState> = load_json(self.store.as_ref(), key).await?;
        Ok(match state {
            Some(state) => {
                let status = state.observed_status(now);
                BreakerView {
                    status,
                    probe_in_flight: status == CircuitStatus::HalfOpen
                        && state.probe_active(now, self.config.probe_timeout),
                }
            }
            None => BreakerView::default(),
        })
    }

    /// 为半开熔断器预留探测名额
    ///
    /// # 返回值
    ///
    /// 成功预留返回 true；熔断器不处于半开或已有探测在途时返回 false
    pub async fn try_acquire_probe(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StateStoreError> {
        let probe_timeout = self.config.probe_timeout;
        let acquired = update_json(
            self.store.as_ref(),
            key,
            || self.initial(key),
            |mut state: CircuitBreakerState| {
                if state.observed_status(now) != CircuitStatus::HalfOpen
                    || state.probe_active(now, probe_timeout)
                {
                    return (None, false);
                }
                state.status = CircuitStatus::HalfOpen;
                state.probe_in_flight = true;
                state.probe_started_at = Some(now);
                (Some(state), true)
            },
        )
        .await?;

        if acquired {
            tracing::info!("Probe reserved for circuit {}", key);
            self.update_status_metric(key, CircuitStatus::HalfOpen);
        }
        Ok(acquired)
    }

    /// 记录成功
    ///
    /// 半开状态下的成功关闭熔断器并清空计数；打开状态下的迟到成功被忽略
    pub async fn record_success(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<CircuitStatus, StateStoreError> {
        let base_cool_down = self.config.cool_down;
        let status = update_json(
            self.store.as_ref(),
            key,
            || self.initial(key),
            |mut state: CircuitBreakerState| match state.observed_status(now) {
                CircuitStatus::HalfOpen => {
                    let closed = CircuitBreakerState::closed(state.key.clone(), base_cool_down);
                    (Some(closed), CircuitStatus::Closed)
                }
                CircuitStatus::Open => (None, CircuitStatus::Open),
                CircuitStatus::Closed => {
                    if state.consecutive_failures == 0 && state.failures.is_empty() {
                        return (None, CircuitStatus::Closed);
                    }
                    state.consecutive_failures = 0;
                    state.failures.clear();
                    (Some(state), CircuitStatus::Closed)
                }
            },
        )
        .await?;

        counter!("circuit_breaker_successes_total", "key" => key.to_string()).increment(1);
        if status == CircuitStatus::Closed {
            self.update_status_metric(key, status);
        }
        Ok(status)
    }

    /// 记录失败
    ///
    /// 窗口内失败次数达到阈值时打开；半开探测失败时重新打开并延长冷却
    pub async fn record_failure(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<CircuitStatus, StateStoreError> {
        let config = self.config.clone();
        let (previous, status) = update_json(
            self.store.as_ref(),
            key,
            || self.initial(key),
            |mut state: CircuitBreakerState| {
                let previous = state.observed_status(now);
                let window_start = now - config.failure_window;
                state.failures.retain(|ts| *ts > window_start);
                state.failures.push(now);
                state.consecutive_failures += 1;

                match previous {
                    CircuitStatus::Closed => {
                        if state.failures.len() >= config.failure_threshold as usize {
                            state.status = CircuitStatus::Open;
                            state.opened_at = Some(now);
                            state.cool_down_secs = config.cool_down.num_seconds();
                        }
                    }
                    CircuitStatus::HalfOpen => {
                        let extended = (state.cool_down_secs as f64 * config.cool_down_multiplier)
                            .round() as i64;
                        state.status = CircuitStatus::Open;
                        state.opened_at = Some(now);
                        state.cool_down_secs = extended.min(config.max_cool_down.num_seconds());
                        state.probe_in_flight = false;
                        state.probe_started_at = None;
                    }
                    CircuitStatus::Open => {}
                }
                let status = state.status;
                (Some(state), (previous, status))
            },
        )
        .await?;

        counter!("circuit_breaker_failures_total", "key" => key.to_string()).increment(1);
        if status == CircuitStatus::Open && previous != CircuitStatus::Open {
            tracing::warn!("Circuit {} opened after failure (was {})", key, previous.as_str());
            self.update_status_metric(key, CircuitStatus::Open);
        }
        Ok(status)
    }

    /// 更新状态指标
    fn update_status_metric(&self, key: &str, status: CircuitStatus) {
        let val = match status {
            CircuitStatus::Closed => 0.0,
            CircuitStatus::Open => 1.0,
            CircuitStatus::HalfOpen => 0.5,
        };
        gauge!("circuit_breaker_status", "key" => key.to_string()).set(val);
    }
}
