// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::sync_job::{JobStatus, SyncJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DbErr;
use thiserror::Error;
use uuid::Uuid;

/// 认领超时被回收的任务的错误标记
pub const CLAIM_EXPIRED: &str = "claim_expired";

/// 回收次数超限被终止的任务的错误标记
pub const RECLAIM_LIMIT_EXCEEDED: &str = "reclaim_limit_exceeded";

/// 仓库错误类型
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// 数据库错误，通常意味着存储不可达
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
    /// 违反活跃任务唯一约束
    #[error("Duplicate active job: {0}")]
    Duplicate(String),
    /// 记录未找到
    #[error("Record not found")]
    NotFound,
    /// 存储中的数据无法映射为领域模型
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// 认领结果
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// 成功认领
    Claimed(SyncJob),
    /// 没有可认领的任务
    Empty,
    /// 条件更新落空，被其他 worker 抢先
    Conflict(Uuid),
}

/// 同步任务仓库特质
///
/// 持久化任务表，所有状态转换都是带条件的原子更新
#[async_trait]
pub trait SyncJobRepository: Send + Sync {
    /// 插入排队任务，违反唯一约束时返回 [`RepositoryError::Duplicate`]
    async fn insert(&self, job: &SyncJob) -> Result<SyncJob, RepositoryError>;
    /// 根据ID查找任务
    async fn find_by_id(&self, id: Uuid) -> Result<Option<SyncJob>, RepositoryError>;
    /// 查询全部活跃任务（queued / claimed / running）
    async fn find_active(&self) -> Result<Vec<SyncJob>, RepositoryError>;
    /// 认领优先级最高且已到期的排队任务
    async fn claim_next(
        &self,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, RepositoryError>;
    /// claimed → running，仅限持有者
    async fn mark_running(
        &self,
        id: Uuid,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
    /// 刷新认领时间，仅限持有者且任务仍处于 claimed / running
    async fn heartbeat(
        &self,
        job: &SyncJob,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
    /// 标记成功，并在同一事务中更新仓库同步状态
    ///
    /// 仅当任务仍由 `job.claimed_by` 持有且尝试次数未变时生效
    async fn complete(
        &self,
        job: &SyncJob,
        watermark: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
    /// 记录失败，将任务转为 `next_status`（Queued 或 Dead）
    async fn record_failure(
        &self,
        job: &SyncJob,
        error: &str,
        next_status: JobStatus,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
    /// 回收认领时间早于 `cutoff` 的任务，返回被回收的任务
    async fn requeue_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, RepositoryError>;
    /// 将多次回收仍未完成的任务转为 Dead，返回被升级的任务
    async fn escalate_reclaimed(
        &self,
        reclaim_limit: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, RepositoryError>;
}
