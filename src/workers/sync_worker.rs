// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::sync_job::{JobPayload, JobStatus, SyncJob};
use crate::domain::services::rate_limit_bucket::RateLimitBucket;
use crate::domain::services::task_executor::{
    ExecutionOutcome, TaskExecutionError, TaskExecutor,
};
use crate::queue::sync_queue::{QueueError, SyncQueue};
use crate::utils::errors::WorkerError;
use crate::workers::worker::Worker;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// 连续出错时退避的最大倍数（2 的幂）
const MAX_ERROR_BACKOFF_EXPONENT: u32 = 5;

/// 同步 worker 配置
#[derive(Debug, Clone)]
pub struct SyncWorkerConfig {
    /// 队列为空时的轮询间隔
    pub poll_interval: Duration,
    /// 单个任务的执行超时
    pub execution_timeout: Duration,
    /// 执行期间续约认领的间隔，须明显短于回收器的认领超时
    pub heartbeat_interval: Duration,
}

impl Default for SyncWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            execution_timeout: Duration::from_secs(900),
            heartbeat_interval: Duration::from_secs(20),
        }
    }
}

/// 单个任务的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResolution {
    Succeeded,
    /// 失败后重新排队等待重试
    Requeued,
    Dead,
    /// 确认前任务已被回收，结果被丢弃
    Abandoned,
}

impl From<JobStatus> for JobResolution {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Dead => JobResolution::Dead,
            _ => JobResolution::Requeued,
        }
    }
}

/// 同步 worker
///
/// 认领任务、调用执行器并确认结果。单个任务失败只会记录在队列中，
/// 不会终止循环。
pub struct SyncWorker {
    worker_id: Uuid,
    name: String,
    queue: Arc<dyn SyncQueue>,
    executor: Arc<dyn TaskExecutor>,
    bucket: RateLimitBucket,
    config: SyncWorkerConfig,
}

impl SyncWorker {
    /// 创建新的同步 worker
    ///
    /// # 参数
    ///
    /// * `queue` - 同步队列
    /// * `executor` - 任务执行器
    /// * `bucket` - 令牌桶，执行器报告限流时暂停对应实例
    /// * `config` - 轮询与超时配置
    pub fn new(
        queue: Arc<dyn SyncQueue>,
        executor: Arc<dyn TaskExecutor>,
        bucket: RateLimitBucket,
        config: SyncWorkerConfig,
    ) -> Self {
        let worker_id = Uuid::new_v4();
        Self {
            worker_id,
            name: format!("sync-worker-{}", worker_id),
            queue,
            executor,
            bucket,
            config,
        }
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    /// 认领并处理一个任务
    ///
    /// # 返回值
    ///
    /// * `Ok(None)` - 没有可认领的任务，或认领时被其他 worker 抢先
    /// * `Ok(Some(resolution))` - 处理了一个任务
    /// * `Err(WorkerError)` - 队列或状态存储不可用
    pub async fn process_next(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<JobResolution>, WorkerError> {
        let job = match self.queue.claim(self.worker_id, Utc::now()).await {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(None),
            Err(QueueError::ClaimConflict(id)) => {
                debug!("Lost claim race for job {}", id);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        self.process_job(job, cancel).await.map(Some)
    }

    #[instrument(skip(self, job, cancel), fields(worker_id = %self.worker_id, job_id = %job.id, repo_id = %job.repo_id, job_type = %job.job_type))]
    async fn process_job(
        &self,
        job: SyncJob,
        cancel: &CancellationToken,
    ) -> Result<JobResolution, WorkerError> {
        let payload = match job
            .decode_payload()
            .and_then(|p| p.validate_for(job.job_type).map(|_| p))
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Rejecting job with invalid payload: {}", e);
                let error = format!("invalid payload: {}", e);
                return self.settle_failure(&job, &error, false).await;
            }
        };

        match self.queue.mark_running(&job, self.worker_id, Utc::now()).await {
            Ok(()) => {}
            Err(QueueError::NotHeld(_)) => {
                warn!("Job was reclaimed before it started running");
                return Ok(JobResolution::Abandoned);
            }
            Err(e) => return Err(e.into()),
        }

        info!("Executing sync job (attempt {})", job.attempt_count + 1);
        match self.execute(&job, &payload, cancel).await {
            Ok(outcome) => {
                info!(
                    "Sync job succeeded, {} items synced",
                    outcome.items_synced
                );
                match self
                    .queue
                    .ack_success(&job, outcome.watermark, Utc::now())
                    .await
                {
                    Ok(()) => Ok(JobResolution::Succeeded),
                    Err(QueueError::NotHeld(_)) => {
                        warn!("Job was reclaimed before success could be acked");
                        Ok(JobResolution::Abandoned)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => {
                warn!("Sync job failed: {}", e);
                if let TaskExecutionError::RateLimited { retry_after } = &e {
                    let now = Utc::now();
                    if let Err(pause_err) = self
                        .bucket
                        .pause(&job.instance_id, now + *retry_after, now)
                        .await
                    {
                        error!(
                            "Failed to pause bucket for {}: {}",
                            job.instance_id, pause_err
                        );
                    }
                }
                if matches!(e, TaskExecutionError::Cancelled) {
                    return self.settle_cancelled(&job, &e.to_string()).await;
                }
                self.settle_failure(&job, &e.to_string(), e.is_retryable())
                    .await
            }
        }
    }

    /// 在超时与取消约束下调用执行器
    ///
    /// 执行期间定期续约认领；续约失败说明任务已被回收，立即取消执行
    async fn execute(
        &self,
        job: &SyncJob,
        payload: &JobPayload,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, TaskExecutionError> {
        let job_cancel = cancel.child_token();
        let timeout = self.config.execution_timeout;

        let result = tokio::select! {
            result = self.executor.execute(job.job_type, payload, job_cancel.clone()) => result,
            _ = sleep(timeout) => Err(TaskExecutionError::Timeout(timeout)),
            _ = cancel.cancelled() => Err(TaskExecutionError::Cancelled),
            _ = self.keep_claim(job) => Err(TaskExecutionError::Cancelled),
        };
        job_cancel.cancel();
        result
    }

    /// 按心跳间隔续约认领，只在认领丢失时返回
    async fn keep_claim(&self, job: &SyncJob) {
        let mut ticker = interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 第一次 tick 立即完成
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match self.queue.heartbeat(job, self.worker_id, Utc::now()).await {
                Ok(()) => debug!("Renewed claim on job {}", job.id),
                Err(QueueError::NotHeld(_)) => {
                    warn!("Claim on job {} was lost while executing", job.id);
                    return;
                }
                Err(e) => warn!("Failed to renew claim on job {}: {}", job.id, e),
            }
        }
    }

    async fn settle_cancelled(
        &self,
        job: &SyncJob,
        error: &str,
    ) -> Result<JobResolution, WorkerError> {
        match self.queue.ack_cancelled(job, error, Utc::now()).await {
            Ok(status) => Ok(status.into()),
            Err(QueueError::NotHeld(_)) => {
                warn!("Job was reclaimed before cancellation could be acked");
                Ok(JobResolution::Abandoned)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn settle_failure(
        &self,
        job: &SyncJob,
        error: &str,
        retryable: bool,
    ) -> Result<JobResolution, WorkerError> {
        match self
            .queue
            .ack_failure(job, error, retryable, Utc::now())
            .await
        {
            Ok(status) => Ok(status.into()),
            Err(QueueError::NotHeld(_)) => {
                warn!("Job was reclaimed before failure could be acked");
                Ok(JobResolution::Abandoned)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn idle(&self, delay: Duration, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = sleep(delay) => {}
        }
    }
}

#[async_trait]
impl Worker for SyncWorker {
    async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        info!("Sync worker {} started", self.worker_id);
        let mut consecutive_errors: u32 = 0;

        while !cancel.is_cancelled() {
            match self.process_next(&cancel).await {
                Ok(Some(_)) => consecutive_errors = 0,
                Ok(None) => {
                    consecutive_errors = 0;
                    self.idle(self.config.poll_interval, &cancel).await;
                }
                Err(e) => {
                    error!("Error processing sync job: {}", e);
                    let exponent = consecutive_errors.min(MAX_ERROR_BACKOFF_EXPONENT);
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    self.idle(self.config.poll_interval * 2u32.pow(exponent), &cancel)
                        .await;
                }
            }
        }

        info!("Sync worker {} stopped", self.worker_id);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
