// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::bucket::InstanceBucketStatus;
use crate::domain::models::budget::{BudgetSnapshot, GLOBAL_BUDGET_KEY};
use crate::domain::models::circuit_breaker::BreakerView;
use crate::domain::models::repo::{Repo, RepoSyncState};
use crate::domain::models::sync_job::{JobPayload, JobType, SyncJob, SyncJobCandidate};
use crate::domain::repositories::repo_repository::RepoRepository;
use crate::domain::repositories::state_store::{StateStore, StateStoreError};
use crate::domain::repositories::sync_job_repository::RepositoryError;
use crate::domain::services::circuit_breaker::CircuitBreakerController;
use crate::domain::services::policy_engine::{
    select_jobs_to_enqueue, PolicyConfig, SkipReason, SkippedCandidate,
};
use crate::domain::services::rate_limit_bucket::RateLimitBucket;
use crate::queue::sync_queue::{QueueError, SyncQueue};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 调度建议锁的键
pub const TICK_LOCK_KEY: &str = "scheduler:tick_lock";

/// 调度错误类型
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// 仓库错误
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// 队列错误
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// 状态存储错误
    #[error("State store error: {0}")]
    StateStore(#[from] StateStoreError),
}

/// 调度器配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 默认修复窗口（小时）
    pub repair_window_hours: i64,
    /// 建议锁租约时长
    pub lock_ttl: std::time::Duration,
    /// 回填任务成功后是否推进水位线
    pub default_update_watermark: bool,
    /// 各任务类型的基础优先级
    pub base_priority: HashMap<JobType, i32>,
    /// 按归属覆盖的并发上限
    pub owner_limits: HashMap<String, usize>,
    pub policy: PolicyConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            repair_window_hours: 24,
            lock_ttl: std::time::Duration::from_secs(120),
            default_update_watermark: false,
            base_priority: HashMap::from([(JobType::Incremental, 10), (JobType::Backfill, 1)]),
            owner_limits: HashMap::new(),
            policy: PolicyConfig::default(),
        }
    }
}

/// 本次节拍构建的任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuiltJob {
    /// 演练模式下为空
    pub job_id: Option<Uuid>,
    pub repo_id: Uuid,
    pub job_type: JobType,
    pub effective_priority: i32,
    pub is_probe: bool,
}

/// 调度节拍结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerTickResult {
    pub jobs_built: Vec<BuiltJob>,
    pub jobs_skipped: Vec<SkippedCandidate>,
    pub duration_ms: u64,
    pub lock_acquired: bool,
}

/// 同步调度器
///
/// 每次节拍读取仓库水位线、活跃任务、熔断器与令牌桶状态，
/// 交给策略引擎决策，再把接纳的候选写入队列
pub struct SyncScheduler {
    repos: Arc<dyn RepoRepository>,
    queue: Arc<dyn SyncQueue>,
    breaker: CircuitBreakerController,
    bucket: RateLimitBucket,
    store: Arc<dyn StateStore>,
    config: SchedulerConfig,
    /// 建议锁的持有者标识，每个调度器实例唯一
    holder_id: String,
}

impl SyncScheduler {
    /// 创建新的调度器实例
    ///
    /// # 参数
    ///
    /// * `repos` - 仓库元数据存储
    /// * `queue` - 同步队列
    /// * `breaker` - 熔断器控制器
    /// * `bucket` - 令牌桶
    /// * `store` - 建议锁所在的状态存储
    /// * `config` - 调度配置
    pub fn new(
        repos: Arc<dyn RepoRepository>,
        queue: Arc<dyn SyncQueue>,
        breaker: CircuitBreakerController,
        bucket: RateLimitBucket,
        store: Arc<dyn StateStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repos,
            queue,
            breaker,
            bucket,
            store,
            config,
            holder_id: Uuid::new_v4().to_string(),
        }
    }

    /// 执行一次调度节拍
    ///
    /// 其他进程持有建议锁时直接返回空结果，`lock_acquired` 为 false
    ///
    /// # 参数
    ///
    /// * `now` - 节拍时间
    /// * `dry_run` - 只计算决策，不写入队列、不消耗令牌、不预留探测
    pub async fn run_tick(
        &self,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<SchedulerTickResult, SchedulerError> {
        let started = Instant::now();

        if !self
            .store
            .try_acquire_lease(TICK_LOCK_KEY, &self.holder_id, self.config.lock_ttl)
            .await?
        {
            debug!("Another scheduler holds the tick lock, skipping");
            return Ok(SchedulerTickResult::default());
        }

        let outcome = self.tick_locked(now, dry_run).await;

        if let Err(e) = self
            .store
            .release_lease(TICK_LOCK_KEY, &self.holder_id)
            .await
        {
            warn!("Failed to release tick lock: {}", e);
        }

        let mut result = outcome?;
        result.duration_ms = started.elapsed().as_millis() as u64;
        result.lock_acquired = true;
        histogram!("scheduler_tick_duration_ms").record(result.duration_ms as f64);

        info!(
            "Scheduler tick built {} jobs, skipped {} candidates in {}ms{}",
            result.jobs_built.len(),
            result.jobs_skipped.len(),
            result.duration_ms,
            if dry_run { " (dry run)" } else { "" }
        );
        Ok(result)
    }

    async fn tick_locked(
        &self,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<SchedulerTickResult, SchedulerError> {
        let repos = self.repos.list_enabled().await?;
        let states: HashMap<(Uuid, JobType), RepoSyncState> = self
            .repos
            .list_sync_states()
            .await?
            .into_iter()
            .map(|s| ((s.repo_id, s.job_type), s))
            .collect();
        let active = self.queue.active_jobs().await?;

        let candidates = self.build_candidates(&repos, &states, now);

        let mut breaker_states: HashMap<String, BreakerView> = HashMap::new();
        let mut bucket_status: HashMap<String, InstanceBucketStatus> = HashMap::new();
        for candidate in &candidates {
            if !breaker_states.contains_key(&candidate.breaker_key) {
                let view = self.breaker.snapshot(&candidate.breaker_key, now).await?;
                breaker_states.insert(candidate.breaker_key.clone(), view);
            }
            if !bucket_status.contains_key(&candidate.instance_id) {
                let status = self.bucket.snapshot(&candidate.instance_id, now).await?;
                bucket_status.insert(candidate.instance_id.clone(), status);
            }
        }

        let budgets = self.build_budgets(&candidates, &active);
        let decision = select_jobs_to_enqueue(
            candidates,
            &active,
            &budgets,
            &bucket_status,
            &breaker_states,
            &self.config.policy,
            now,
        );

        let mut result = SchedulerTickResult {
            jobs_skipped: decision.skipped,
            ..Default::default()
        };

        for admitted in decision.admitted {
            let candidate = &admitted.candidate;
            if dry_run {
                result.jobs_built.push(BuiltJob {
                    job_id: None,
                    repo_id: candidate.repo_id,
                    job_type: candidate.job_type,
                    effective_priority: admitted.effective_priority,
                    is_probe: admitted.is_probe,
                });
                continue;
            }

            if admitted.is_probe
                && !self
                    .breaker
                    .try_acquire_probe(&candidate.breaker_key, now)
                    .await?
            {
                result
                    .jobs_skipped
                    .push(SkippedCandidate::new(candidate, SkipReason::ProbeInFlight));
                continue;
            }

            match self
                .queue
                .enqueue(candidate, admitted.effective_priority, now)
                .await
            {
                Ok(job) => {
                    if let Err(e) = self.bucket.consume(&candidate.instance_id, now).await {
                        warn!(
                            "Failed to consume bucket token for {}: {}",
                            candidate.instance_id, e
                        );
                    }
                    result.jobs_built.push(BuiltJob {
                        job_id: Some(job.id),
                        repo_id: job.repo_id,
                        job_type: job.job_type,
                        effective_priority: job.effective_priority,
                        is_probe: admitted.is_probe,
                    });
                }
                Err(QueueError::DuplicateJob { .. }) => {
                    debug!(
                        "Lost enqueue race for repo {} ({})",
                        candidate.repo_id, candidate.job_type
                    );
                    result
                        .jobs_skipped
                        .push(SkippedCandidate::new(candidate, SkipReason::DuplicateActiveJob));
                }
                Err(e) => return Err(e.into()),
            }
        }

        for skipped in &result.jobs_skipped {
            counter!("sync_jobs_skipped_total", "reason" => skipped.reason.as_str()).increment(1);
        }
        Ok(result)
    }

    /// 为修复窗口已过期的 (repo, job_type) 生成候选
    fn build_candidates(
        &self,
        repos: &[Repo],
        states: &HashMap<(Uuid, JobType), RepoSyncState>,
        now: DateTime<Utc>,
    ) -> Vec<SyncJobCandidate> {
        let mut candidates = Vec::new();

        for repo in repos {
            let window = repo.repair_window(self.config.repair_window_hours);
            for &job_type in &repo.job_types {
                let state = states.get(&(repo.id, job_type));
                let last_synced = state.and_then(|s| s.last_synced_at);
                if last_synced.is_some_and(|t| t + window > now) {
                    continue;
                }

                let payload = match job_type {
                    JobType::Incremental => JobPayload::Incremental {
                        since: state.and_then(|s| s.watermark.clone()),
                    },
                    JobType::Backfill => {
                        let since = last_synced
                            .or(repo.backfill_start)
                            .unwrap_or(now - window);
                        if since >= now {
                            continue;
                        }
                        JobPayload::Backfill {
                            since,
                            until: now,
                            update_watermark: self.config.default_update_watermark,
                        }
                    }
                };

                candidates.push(SyncJobCandidate {
                    repo_id: repo.id,
                    instance_id: repo.instance_id.clone(),
                    budget_key: repo.budget_key().to_string(),
                    breaker_key: self.breaker.key_for(&repo.instance_id, repo.id, job_type),
                    job_type,
                    base_priority: self
                        .config
                        .base_priority
                        .get(&job_type)
                        .copied()
                        .unwrap_or(0),
                    staleness_age: now - last_synced.unwrap_or(repo.created_at),
                    payload,
                });
            }
        }

        candidates
    }

    /// 根据活跃任务计算各归属的预算快照
    fn build_budgets(
        &self,
        candidates: &[SyncJobCandidate],
        active: &[SyncJob],
    ) -> HashMap<String, BudgetSnapshot> {
        let mut in_flight: HashMap<&str, usize> = HashMap::new();
        for job in active.iter().filter(|j| j.status.is_active()) {
            *in_flight.entry(job.budget_key.as_str()).or_default() += 1;
        }

        let owners: HashSet<&str> = candidates.iter().map(|c| c.budget_key.as_str()).collect();
        let mut budgets: HashMap<String, BudgetSnapshot> = owners
            .into_iter()
            .map(|owner| {
                let limit = self
                    .config
                    .owner_limits
                    .get(owner)
                    .copied()
                    .unwrap_or(self.config.policy.max_concurrent_per_owner);
                let snapshot = BudgetSnapshot::new(
                    owner,
                    limit,
                    in_flight.get(owner).copied().unwrap_or(0),
                );
                (owner.to_string(), snapshot)
            })
            .collect();

        budgets.insert(
            GLOBAL_BUDGET_KEY.to_string(),
            BudgetSnapshot::new(
                GLOBAL_BUDGET_KEY,
                self.config.policy.max_concurrent_jobs,
                in_flight.values().sum(),
            ),
        );
        budgets
    }

    /// 连续运行调度节拍，直到取消
    ///
    /// 单次节拍失败只记录日志，下一次节拍照常执行
    pub async fn run_loop(&self, interval: std::time::Duration, cancel: CancellationToken) {
        info!("Scheduler loop started with interval {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_tick(Utc::now(), false).await {
                        error!("Scheduler tick failed: {}", e);
                    }
                }
            }
        }

        info!("Scheduler loop stopped");
    }
}

