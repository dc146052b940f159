// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::circuit_breaker::BreakerScope;
use crate::domain::models::sync_job::JobType;
use crate::domain::services::circuit_breaker::CircuitBreakerConfig;
use crate::domain::services::policy_engine::PolicyConfig;
use crate::domain::services::rate_limit_bucket::BucketConfig;
use crate::queue::scheduler::SchedulerConfig;
use crate::utils::retry_policy::RetryPolicy;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use validator::{Validate, ValidationError};

/// 应用程序配置设置
///
/// 加载顺序：内置默认值、`config/default`、`config/{APP_ENVIRONMENT}`、
/// 以 `SCMSYNC__` 为前缀的环境变量
#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_claim_timeout"))]
pub struct Settings {
    /// 数据库配置
    #[validate(nested)]
    pub database: DatabaseSettings,
    /// Redis配置
    pub redis: RedisSettings,
    /// 键值状态存储配置
    pub state_store: StateStoreSettings,
    /// 调度节拍配置
    #[validate(nested)]
    pub scheduler: SchedulerSettings,
    /// 各任务类型配置
    #[validate(nested)]
    pub job_types: JobTypesSettings,
    /// 并发预算配置
    #[validate(nested)]
    pub budget: BudgetSettings,
    /// 熔断器配置
    #[validate(nested)]
    pub breaker: BreakerSettings,
    /// 令牌桶配置
    #[validate(nested)]
    pub bucket: BucketSettings,
    /// 失败重试配置
    #[validate(nested)]
    pub retry: RetrySettings,
    /// Worker 配置
    #[validate(nested)]
    pub worker: WorkerSettings,
    /// 回收器配置
    #[validate(nested)]
    pub reaper: ReaperSettings,
    /// 任务执行器配置
    pub executor: ExecutorSettings,
    /// 指标导出配置
    pub metrics: MetricsSettings,
}

/// 数据库配置设置
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DatabaseSettings {
    /// 数据库连接URL
    #[validate(length(min = 1))]
    pub url: String,
    /// 最大连接数
    pub max_connections: Option<u32>,
    /// 最小连接数
    pub min_connections: Option<u32>,
    /// 连接超时时间（秒）
    pub connect_timeout: Option<u64>,
    /// 空闲连接超时时间（秒）
    pub idle_timeout: Option<u64>,
}

/// Redis配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    /// Redis连接URL
    pub url: String,
}

/// 状态存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateStoreBackend {
    /// 多进程共享，生产环境使用
    Redis,
    /// 进程内存，仅适用于单进程部署与测试
    Memory,
}

/// 状态存储配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct StateStoreSettings {
    pub backend: StateStoreBackend,
}

/// 调度节拍配置设置
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SchedulerSettings {
    /// 连续模式下两次节拍的间隔（秒）
    #[validate(range(min = 1))]
    pub tick_interval_secs: u64,
    /// 默认修复窗口（小时），最近一次成功早于该窗口的仓库会被调度
    #[validate(range(min = 1))]
    pub repair_window_hours: i64,
    /// 调度建议锁的租约时长（秒）
    #[validate(range(min = 1))]
    pub lock_ttl_secs: u64,
    /// 回填任务成功后是否推进水位线
    pub default_update_watermark: bool,
}

/// 单个任务类型的配置
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct JobTypeSettings {
    pub base_priority: i32,
    #[validate(range(min = 1))]
    pub max_attempts: i32,
    /// 令牌桶暂停时是否直接跳过
    pub skip_on_pause: bool,
}

/// 各任务类型配置设置
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct JobTypesSettings {
    #[validate(nested)]
    pub incremental: JobTypeSettings,
    #[validate(nested)]
    pub backfill: JobTypeSettings,
}

impl JobTypesSettings {
    pub fn get(&self, job_type: JobType) -> &JobTypeSettings {
        match job_type {
            JobType::Incremental => &self.incremental,
            JobType::Backfill => &self.backfill,
        }
    }
}

/// 并发预算配置设置
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BudgetSettings {
    /// 全局并发上限
    #[validate(range(min = 1))]
    pub max_concurrent_jobs: usize,
    /// 每个租户或实例的默认并发上限
    #[validate(range(min = 1))]
    pub max_concurrent_per_owner: usize,
    /// 按归属覆盖的并发上限
    #[serde(default)]
    pub owner_limits: HashMap<String, usize>,
}

/// 熔断器配置设置
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BreakerSettings {
    pub scope: BreakerScope,
    #[validate(range(min = 1))]
    pub failure_threshold: u32,
    #[validate(range(min = 1))]
    pub failure_window_secs: i64,
    #[validate(range(min = 1))]
    pub cool_down_secs: i64,
    #[validate(range(min = 1.0))]
    pub cool_down_multiplier: f64,
    #[validate(range(min = 1))]
    pub max_cool_down_secs: i64,
    #[validate(range(min = 1))]
    pub probe_timeout_secs: i64,
}

/// 令牌桶配置设置
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BucketSettings {
    #[validate(range(min = 1.0))]
    pub capacity: f64,
    #[validate(range(min = 0.0))]
    pub refill_rate: f64,
    #[validate(range(min = 0.0))]
    pub low_tokens_threshold: f64,
    #[validate(range(min = 0))]
    pub low_tokens_penalty: i32,
}

/// 失败重试配置设置
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RetrySettings {
    #[validate(range(min = 1))]
    pub initial_backoff_secs: u64,
    #[validate(range(min = 1))]
    pub max_backoff_secs: u64,
    #[validate(range(min = 1.0))]
    pub backoff_multiplier: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter_factor: f64,
}

/// Worker 配置设置
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct WorkerSettings {
    /// 每个进程启动的 worker 数
    #[validate(range(min = 1))]
    pub concurrency: usize,
    /// 队列为空时的轮询间隔（毫秒）
    #[validate(range(min = 10))]
    pub poll_interval_ms: u64,
    /// 单个任务的执行超时（秒）
    #[validate(range(min = 1))]
    pub execution_timeout_secs: u64,
    /// 执行期间刷新认领时间的间隔（秒）
    #[validate(range(min = 1))]
    pub heartbeat_interval_secs: u64,
}

/// 认领超时必须至少覆盖两次心跳，否则正在执行的任务会被回收
fn validate_claim_timeout(settings: &Settings) -> Result<(), ValidationError> {
    let heartbeat = settings.worker.heartbeat_interval_secs as i64;
    if settings.reaper.claim_timeout_secs <= heartbeat.saturating_mul(2) {
        let mut err = ValidationError::new("claim_timeout_too_short");
        err.message = Some(
            format!(
                "reaper.claim_timeout_secs ({}) must exceed twice worker.heartbeat_interval_secs ({})",
                settings.reaper.claim_timeout_secs, heartbeat
            )
            .into(),
        );
        return Err(err);
    }
    Ok(())
}

/// 回收器配置设置
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ReaperSettings {
    #[validate(range(min = 1))]
    pub interval_secs: u64,
    /// 认领超过该时长仍未确认的任务视为被遗弃（秒）
    #[validate(range(min = 1))]
    pub claim_timeout_secs: i64,
    /// 回收次数超过该值的任务转为 Dead
    #[validate(range(min = 1))]
    pub reclaim_limit: i32,
}

/// 任务执行器配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSettings {
    /// 外部同步程序，未设置时 worker 模式无法启动
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// 指标导出配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub listen_addr: String,
}

impl Settings {
    /// 创建新的配置实例
    ///
    /// # Returns
    ///
    /// * `Ok(Settings)` - 成功加载并通过校验的配置
    /// * `Err(ConfigError)` - 配置加载或校验失败
    pub fn new() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| "default".to_string());
        let builder = Self::defaults(Config::builder())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(Environment::with_prefix("SCMSYNC").separator("__"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings
            .validate()
            .map_err(|e| ConfigError::Message(e.to_string()))?;
        Ok(settings)
    }

    fn defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            .set_default("database.url", "sqlite://scmsync.db?mode=rwc")?
            .set_default("database.max_connections", 20)?
            .set_default("database.min_connections", 1)?
            .set_default("database.connect_timeout", 10)?
            .set_default("database.idle_timeout", 300)?
            .set_default("redis.url", "redis://127.0.0.1:6379")?
            .set_default("state_store.backend", "redis")?
            .set_default("scheduler.tick_interval_secs", 60)?
            .set_default("scheduler.repair_window_hours", 24)?
            .set_default("scheduler.lock_ttl_secs", 120)?
            .set_default("scheduler.default_update_watermark", false)?
            .set_default("job_types.incremental.base_priority", 10)?
            .set_default("job_types.incremental.max_attempts", 5)?
            .set_default("job_types.incremental.skip_on_pause", false)?
            .set_default("job_types.backfill.base_priority", 1)?
            .set_default("job_types.backfill.max_attempts", 3)?
            .set_default("job_types.backfill.skip_on_pause", true)?
            .set_default("budget.max_concurrent_jobs", 64)?
            .set_default("budget.max_concurrent_per_owner", 8)?
            .set_default("breaker.scope", "instance")?
            .set_default("breaker.failure_threshold", 5)?
            .set_default("breaker.failure_window_secs", 300)?
            .set_default("breaker.cool_down_secs", 60)?
            .set_default("breaker.cool_down_multiplier", 2.0)?
            .set_default("breaker.max_cool_down_secs", 3600)?
            .set_default("breaker.probe_timeout_secs", 1800)?
            .set_default("bucket.capacity", 100.0)?
            .set_default("bucket.refill_rate", 1.0)?
            .set_default("bucket.low_tokens_threshold", 5.0)?
            .set_default("bucket.low_tokens_penalty", 5)?
            .set_default("retry.initial_backoff_secs", 30)?
            .set_default("retry.max_backoff_secs", 3600)?
            .set_default("retry.backoff_multiplier", 2.0)?
            .set_default("retry.jitter_factor", 0.1)?
            .set_default("worker.concurrency", 4)?
            .set_default("worker.poll_interval_ms", 1000)?
            .set_default("worker.execution_timeout_secs", 900)?
            .set_default("worker.heartbeat_interval_secs", 20)?
            .set_default("reaper.interval_secs", 30)?
            .set_default("reaper.claim_timeout_secs", 60)?
            .set_default("reaper.reclaim_limit", 3)?
            .set_default("metrics.enabled", true)?
            .set_default("metrics.listen_addr", "0.0.0.0:9000")
    }

    /// 构建策略引擎配置
    pub fn policy_config(&self) -> PolicyConfig {
        let skip_on_pause: HashSet<JobType> = JobType::ALL
            .into_iter()
            .filter(|t| self.job_types.get(*t).skip_on_pause)
            .collect();
        PolicyConfig {
            max_concurrent_jobs: self.budget.max_concurrent_jobs,
            max_concurrent_per_owner: self.budget.max_concurrent_per_owner,
            low_tokens_threshold: self.bucket.low_tokens_threshold,
            low_tokens_penalty: self.bucket.low_tokens_penalty,
            skip_on_pause,
        }
    }

    /// 构建熔断器配置
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            failure_window: chrono::Duration::seconds(self.breaker.failure_window_secs),
            cool_down: chrono::Duration::seconds(self.breaker.cool_down_secs),
            cool_down_multiplier: self.breaker.cool_down_multiplier,
            max_cool_down: chrono::Duration::seconds(self.breaker.max_cool_down_secs),
            probe_timeout: chrono::Duration::seconds(self.breaker.probe_timeout_secs),
            scope: self.breaker.scope,
        }
    }

    /// 构建令牌桶配置
    pub fn bucket_config(&self) -> BucketConfig {
        BucketConfig {
            capacity: self.bucket.capacity,
            refill_rate: self.bucket.refill_rate,
        }
    }

    /// 构建调度器配置
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            repair_window_hours: self.scheduler.repair_window_hours,
            lock_ttl: Duration::from_secs(self.scheduler.lock_ttl_secs),
            default_update_watermark: self.scheduler.default_update_watermark,
            base_priority: JobType::ALL
                .into_iter()
                .map(|t| (t, self.job_types.get(t).base_priority))
                .collect(),
            owner_limits: self.budget.owner_limits.clone(),
            policy: self.policy_config(),
        }
    }

    /// 各任务类型的最大尝试次数
    pub fn max_attempts(&self) -> HashMap<JobType, i32> {
        JobType::ALL
            .into_iter()
            .map(|t| (t, self.job_types.get(t).max_attempts))
            .collect()
    }

    /// 构建失败重试策略
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_secs(self.retry.initial_backoff_secs),
            max_backoff: Duration::from_secs(self.retry.max_backoff_secs),
            backoff_multiplier: self.retry.backoff_multiplier,
            jitter_factor: self.retry.jitter_factor,
            enable_jitter: self.retry.jitter_factor > 0.0,
        }
    }
}

#[cfg(test)]
#[path = "settings_test.rs"]
mod tests;
