// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::sync_job::{JobStatus, JobType, SyncJob, SyncJobCandidate};
use crate::domain::repositories::state_store::StateStoreError;
use crate::domain::repositories::sync_job_repository::{
    ClaimOutcome, RepositoryError, SyncJobRepository,
};
use crate::domain::services::circuit_breaker::CircuitBreakerController;
use crate::utils::retry_policy::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 未配置任务类型时使用的最大尝试次数
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// 队列错误类型
#[derive(Error, Debug)]
pub enum QueueError {
    /// 同一 (repo, job_type) 已有活跃任务
    #[error("Duplicate active job for repo {repo_id} ({job_type})")]
    DuplicateJob { repo_id: Uuid, job_type: JobType },

    /// 认领时被其他 worker 抢先
    #[error("Job {0} was claimed by another worker")]
    ClaimConflict(Uuid),

    /// 确认时任务已不再由当前 worker 持有（通常已被回收）
    #[error("Job {0} is no longer held by this worker")]
    NotHeld(Uuid),

    /// 负载无法解码或与任务类型不符
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// 仓库错误
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// 状态存储错误
    #[error("State store error: {0}")]
    StateStore(#[from] StateStoreError),
}

/// 同步任务队列特质
#[async_trait]
pub trait SyncQueue: Send + Sync {
    /// 入队一个被接纳的候选
    async fn enqueue(
        &self,
        candidate: &SyncJobCandidate,
        effective_priority: i32,
        now: DateTime<Utc>,
    ) -> Result<SyncJob, QueueError>;

    /// 认领一个到期任务，队列为空时返回 `None`
    async fn claim(&self, worker_id: Uuid, now: DateTime<Utc>)
        -> Result<Option<SyncJob>, QueueError>;

    /// claimed → running
    async fn mark_running(
        &self,
        job: &SyncJob,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// 执行期间续约认领，任务已被回收时返回 [`QueueError::NotHeld`]
    async fn heartbeat(
        &self,
        job: &SyncJob,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// 确认成功，必要时推进水位线
    async fn ack_success(
        &self,
        job: &SyncJob,
        watermark: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// 确认失败，返回任务的新状态（Queued 或 Dead）
    async fn ack_failure(
        &self,
        job: &SyncJob,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, QueueError>;

    /// 确认因关闭而取消的任务
    ///
    /// 与可重试的失败一样重新排队，但不计入熔断器
    async fn ack_cancelled(
        &self,
        job: &SyncJob,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, QueueError>;

    /// 回收认领超时的任务
    async fn requeue_stale(
        &self,
        claim_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, QueueError>;

    /// 将回收次数超限的任务转为 Dead
    async fn escalate_reclaimed(
        &self,
        reclaim_limit: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, QueueError>;

    /// 所有活跃任务
    async fn active_jobs(&self) -> Result<Vec<SyncJob>, QueueError>;
}

/// 持久化同步队列
///
/// 任务状态由仓库保存，确认时同步上报熔断器
pub struct PersistentSyncQueue<R: SyncJobRepository> {
    /// 任务仓库
    repository: Arc<R>,
    breaker: CircuitBreakerController,
    retry_policy: RetryPolicy,
    max_attempts: HashMap<JobType, i32>,
}

impl<R: SyncJobRepository> PersistentSyncQueue<R> {
    /// 创建新的持久化队列实例
    ///
    /// # 参数
    ///
    /// * `repository` - 任务仓库
    /// * `breaker` - 熔断器控制器
    /// * `retry_policy` - 失败重试的退避策略
    /// * `max_attempts` - 各任务类型的最大尝试次数
    pub fn new(
        repository: Arc<R>,
        breaker: CircuitBreakerController,
        retry_policy: RetryPolicy,
        max_attempts: HashMap<JobType, i32>,
    ) -> Self {
        Self {
            repository,
            breaker,
            retry_policy,
            max_attempts,
        }
    }

    async fn report_failure(&self, job: &SyncJob, now: DateTime<Utc>) {
        if let Err(e) = self.breaker.record_failure(&job.breaker_key, now).await {
            error!(
                "Failed to record breaker failure for {} (job {}): {}",
                job.breaker_key, job.id, e
            );
        }
    }

    async fn settle_failure(
        &self,
        job: &SyncJob,
        error: &str,
        retryable: bool,
        count_against_breaker: bool,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, QueueError> {
        let attempt = job.attempt_count + 1;
        let (next_status, scheduled_for) = if retryable && job.can_retry() {
            (
                JobStatus::Queued,
                self.retry_policy.next_retry_time(attempt as u32, now),
            )
        } else {
            (JobStatus::Dead, now)
        };

        if !self
            .repository
            .record_failure(job, error, next_status, scheduled_for, now)
            .await?
        {
            return Err(QueueError::NotHeld(job.id));
        }

        match next_status {
            JobStatus::Dead => {
                counter!("sync_jobs_acked_total", "outcome" => "dead").increment(1);
                warn!(
                    "Job {} for repo {} is dead after {} attempts: {}",
                    job.id, job.repo_id, attempt, error
                );
            }
            _ => {
                counter!("sync_jobs_acked_total", "outcome" => "retry").increment(1);
                info!(
                    "Job {} for repo {} requeued for {} (attempt {}/{})",
                    job.id, job.repo_id, scheduled_for, attempt, job.max_attempts
                );
            }
        }

        if count_against_breaker {
            self.report_failure(job, now).await;
        }
        Ok(next_status)
    }
}

#[async_trait]
impl<R: SyncJobRepository> SyncQueue for PersistentSyncQueue<R> {
    async fn enqueue(
        &self,
        candidate: &SyncJobCandidate,
        effective_priority: i32,
        now: DateTime<Utc>,
    ) -> Result<SyncJob, QueueError> {
        let max_attempts = self
            .max_attempts
            .get(&candidate.job_type)
            .copied()
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let job = SyncJob::from_candidate(candidate, effective_priority, max_attempts, now);

        match self.repository.insert(&job).await {
            Ok(created) => {
                counter!("sync_jobs_enqueued_total", "job_type" => created.job_type.as_str())
                    .increment(1);
                debug!(
                    "Enqueued job {} for repo {} ({})",
                    created.id, created.repo_id, created.job_type
                );
                Ok(created)
            }
            Err(RepositoryError::Duplicate(_)) => Err(QueueError::DuplicateJob {
                repo_id: candidate.repo_id,
                job_type: candidate.job_type,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn claim(
        &self,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<SyncJob>, QueueError> {
        match self.repository.claim_next(worker_id, now).await? {
            ClaimOutcome::Claimed(job) => Ok(Some(job)),
            ClaimOutcome::Empty => Ok(None),
            ClaimOutcome::Conflict(id) => Err(QueueError::ClaimConflict(id)),
        }
    }

    async fn mark_running(
        &self,
        job: &SyncJob,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        if self.repository.mark_running(job.id, worker_id, now).await? {
            Ok(())
        } else {
            Err(QueueError::NotHeld(job.id))
        }
    }

    async fn heartbeat(
        &self,
        job: &SyncJob,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        if self.repository.heartbeat(job, worker_id, now).await? {
            Ok(())
        } else {
            Err(QueueError::NotHeld(job.id))
        }
    }

    async fn ack_success(
        &self,
        job: &SyncJob,
        watermark: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let payload = job
            .decode_payload()
            .map_err(|e| QueueError::InvalidPayload(e.to_string()))?;
        let watermark = watermark.filter(|_| payload.allows_watermark_update());

        if !self
            .repository
            .complete(job, watermark.as_deref(), now)
            .await?
        {
            return Err(QueueError::NotHeld(job.id));
        }
        counter!("sync_jobs_acked_total", "outcome" => "success").increment(1);

        if let Err(e) = self.breaker.record_success(&job.breaker_key, now).await {
            error!(
                "Failed to record breaker success for {} (job {}): {}",
                job.breaker_key, job.id, e
            );
        }
        Ok(())
    }

    async fn ack_failure(
        &self,
        job: &SyncJob,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, QueueError> {
        self.settle_failure(job, error, retryable, true, now).await
    }

    async fn ack_cancelled(
        &self,
        job: &SyncJob,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, QueueError> {
        self.settle_failure(job, error, true, false, now).await
    }

    async fn requeue_stale(
        &self,
        claim_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, QueueError> {
        let requeued = self
            .repository
            .requeue_stale(now - claim_timeout, now)
            .await?;
        if !requeued.is_empty() {
            counter!("sync_jobs_reaped_total").increment(requeued.len() as u64);
        }
        Ok(requeued)
    }

    async fn escalate_reclaimed(
        &self,
        reclaim_limit: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, QueueError> {
        let escalated = self
            .repository
            .escalate_reclaimed(reclaim_limit, now)
            .await?;
        for job in &escalated {
            counter!("sync_jobs_acked_total", "outcome" => "dead").increment(1);
            self.report_failure(job, now).await;
        }
        Ok(escalated)
    }

    async fn active_jobs(&self) -> Result<Vec<SyncJob>, QueueError> {
        Ok(self.repository.find_active().await?)
    }
}
