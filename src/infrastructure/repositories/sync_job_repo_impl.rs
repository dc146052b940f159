// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::sync_job::{JobStatus, SyncJob};
use crate::domain::repositories::sync_job_repository::{
    ClaimOutcome, RepositoryError, SyncJobRepository, CLAIM_EXPIRED, RECLAIM_LIMIT_EXCEEDED,
};
use crate::infrastructure::database::entities::{
    repo as repo_entity, repo_sync_state as state_entity, sync_job as job_entity,
};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::{
    sea_query::{Expr, LockBehavior, LockType},
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DatabaseTransaction, DbErr,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, TransactionTrait,
};
use std::sync::Arc;
use uuid::Uuid;

pub(crate) fn to_fixed(ts: DateTime<Utc>) -> DateTime<FixedOffset> {
    ts.into()
}

pub(crate) fn to_utc(ts: DateTime<FixedOffset>) -> DateTime<Utc> {
    ts.with_timezone(&Utc)
}

/// 判断是否违反唯一约束
///
/// 驱动无法识别时退回到错误信息匹配（SQLite 与 Postgres 各一种）
fn is_unique_violation(err: &DbErr) -> bool {
    if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
        return true;
    }
    let message = err.to_string();
    message.contains("UNIQUE constraint failed") || message.contains("duplicate key")
}

fn active_statuses() -> Vec<String> {
    JobStatus::ACTIVE.iter().map(|s| s.to_string()).collect()
}

fn held_statuses() -> Vec<String> {
    vec![
        JobStatus::Claimed.to_string(),
        JobStatus::Running.to_string(),
    ]
}

/// 当前持有者条件，持有者为空时匹配 NULL
fn held_by(claimed_by: Option<Uuid>) -> Condition {
    match claimed_by {
        Some(worker) => Condition::all().add(job_entity::Column::ClaimedBy.eq(worker)),
        None => Condition::all().add(job_entity::Column::ClaimedBy.is_null()),
    }
}

impl TryFrom<job_entity::Model> for SyncJob {
    type Error = RepositoryError;

    fn try_from(model: job_entity::Model) -> Result<Self, Self::Error> {
        Ok(Self {
            id: model.id,
            repo_id: model.repo_id,
            instance_id: model.instance_id,
            budget_key: model.budget_key,
            breaker_key: model.breaker_key,
            job_type: model
                .job_type
                .parse()
                .map_err(|e| RepositoryError::Corrupt(format!("job {}: {}", model.id, e)))?,
            status: model
                .status
                .parse()
                .map_err(|e| RepositoryError::Corrupt(format!("job {}: {}", model.id, e)))?,
            effective_priority: model.effective_priority,
            payload: model.payload,
            attempt_count: model.attempt_count,
            max_attempts: model.max_attempts,
            claimed_by: model.claimed_by,
            claimed_at: model.claimed_at.map(to_utc),
            scheduled_for: to_utc(model.scheduled_for),
            finished_at: model.finished_at.map(to_utc),
            last_error: model.last_error,
            created_at: to_utc(model.created_at),
            updated_at: to_utc(model.updated_at),
        })
    }
}

impl From<&SyncJob> for job_entity::ActiveModel {
    fn from(job: &SyncJob) -> Self {
        Self {
            id: Set(job.id),
            repo_id: Set(job.repo_id),
            instance_id: Set(job.instance_id.clone()),
            budget_key: Set(job.budget_key.clone()),
            breaker_key: Set(job.breaker_key.clone()),
            job_type: Set(job.job_type.to_string()),
            status: Set(job.status.to_string()),
            effective_priority: Set(job.effective_priority),
            payload: Set(job.payload.clone()),
            attempt_count: Set(job.attempt_count),
            max_attempts: Set(job.max_attempts),
            claimed_by: Set(job.claimed_by),
            claimed_at: Set(job.claimed_at.map(to_fixed)),
            scheduled_for: Set(to_fixed(job.scheduled_for)),
            finished_at: Set(job.finished_at.map(to_fixed)),
            last_error: Set(job.last_error.clone()),
            created_at: Set(to_fixed(job.created_at)),
            updated_at: Set(to_fixed(job.updated_at)),
        }
    }
}

/// 同步任务仓库实现
///
/// 基于SeaORM实现的任务队列表访问层。所有状态转换都是带条件的
/// `UPDATE ... WHERE status = ?`，受影响行数为 0 即表示被其他进程抢先。
#[derive(Clone)]
pub struct SyncJobRepositoryImpl {
    /// 数据库连接
    db: Arc<DatabaseConnection>,
}

impl SyncJobRepositoryImpl {
    /// 创建新的任务仓库实例
    ///
    /// # 参数
    ///
    /// * `db` - 数据库连接
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn adjust_failure_streak(
        txn: &DatabaseTransaction,
        repo_id: Uuid,
        reset: bool,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        let streak = if reset {
            Expr::value(0)
        } else {
            Expr::col(repo_entity::Column::FailureStreak).add(1)
        };
        repo_entity::Entity::update_many()
            .col_expr(repo_entity::Column::FailureStreak, streak)
            .col_expr(repo_entity::Column::UpdatedAt, Expr::value(to_fixed(now)))
            .filter(repo_entity::Column::Id.eq(repo_id))
            .exec(txn)
            .await?;
        Ok(())
    }

    async fn upsert_sync_state(
        txn: &DatabaseTransaction,
        job: &SyncJob,
        watermark: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        let existing =
            state_entity::Entity::find_by_id((job.repo_id, job.job_type.to_string()))
                .one(txn)
                .await?;

        match existing {
            Some(model) => {
                let mut active: state_entity::ActiveModel = model.into();
                active.last_synced_at = Set(Some(to_fixed(now)));
                active.last_job_id = Set(Some(job.id));
                active.updated_at = Set(to_fixed(now));
                if let Some(watermark) = watermark {
                    active.watermark = Set(Some(watermark.to_string()));
                }
                active.update(txn).await?;
            }
            None => {
                state_entity::ActiveModel {
                    repo_id: Set(job.repo_id),
                    job_type: Set(job.job_type.to_string()),
                    watermark: Set(watermark.map(str::to_string)),
                    last_synced_at: Set(Some(to_fixed(now))),
                    last_job_id: Set(Some(job.id)),
                    updated_at: Set(to_fixed(now)),
                }
                .insert(txn)
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SyncJobRepository for SyncJobRepositoryImpl {
    async fn insert(&self, job: &SyncJob) -> Result<SyncJob, RepositoryError> {
        let model: job_entity::ActiveModel = job.into();

        match model.insert(self.db.as_ref()).await {
            Ok(inserted) => inserted.try_into(),
            Err(e) if is_unique_violation(&e) => Err(RepositoryError::Duplicate(format!(
                "{}/{}",
                job.repo_id, job.job_type
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<SyncJob>, RepositoryError> {
        let model = job_entity::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?;

        model.map(TryInto::try_into).transpose()
    }

    async fn find_active(&self) -> Result<Vec<SyncJob>, RepositoryError> {
        let models = job_entity::Entity::find()
            .filter(job_entity::Column::Status.is_in(active_statuses()))
            .order_by_asc(job_entity::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;

        models.into_iter().map(TryInto::try_into).collect()
    }

    async fn claim_next(
        &self,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, RepositoryError> {
        let txn = self.db.begin().await?;

        let candidate = job_entity::Entity::find()
            .filter(job_entity::Column::Status.eq(JobStatus::Queued.to_string()))
            .filter(job_entity::Column::ScheduledFor.lte(to_fixed(now)))
            .order_by_desc(job_entity::Column::EffectivePriority)
            .order_by_asc(job_entity::Column::ScheduledFor)
            .order_by_asc(job_entity::Column::CreatedAt)
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .one(&txn)
            .await?;

        let Some(model) = candidate else {
            txn.commit().await?;
            return Ok(ClaimOutcome::Empty);
        };

        let result = job_entity::Entity::update_many()
            .col_expr(
                job_entity::Column::Status,
                Expr::value(JobStatus::Claimed.to_string()),
            )
            .col_expr(job_entity::Column::ClaimedBy, Expr::value(Some(worker_id)))
            .col_expr(
                job_entity::Column::ClaimedAt,
                Expr::value(Some(to_fixed(now))),
            )
            .col_expr(job_entity::Column::UpdatedAt, Expr::value(to_fixed(now)))
            .filter(job_entity::Column::Id.eq(model.id))
            .filter(job_entity::Column::Status.eq(JobStatus::Queued.to_string()))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        if result.rows_affected == 0 {
            return Ok(ClaimOutcome::Conflict(model.id));
        }

        let mut job: SyncJob = model.try_into()?;
        job.status = JobStatus::Claimed;
        job.claimed_by = Some(worker_id);
        job.claimed_at = Some(now);
        job.updated_at = now;
        Ok(ClaimOutcome::Claimed(job))
    }

    async fn mark_running(
        &self,
        id: Uuid,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = job_entity::Entity::update_many()
            .col_expr(
                job_entity::Column::Status,
                Expr::value(JobStatus::Running.to_string()),
            )
            .col_expr(job_entity::Column::UpdatedAt, Expr::value(to_fixed(now)))
            .filter(job_entity::Column::Id.eq(id))
            .filter(job_entity::Column::ClaimedBy.eq(worker_id))
            .filter(job_entity::Column::Status.eq(JobStatus::Claimed.to_string()))
            .exec(self.db.as_ref())
            .await?;

        Ok(result.rows_affected == 1)
    }

    async fn heartbeat(
        &self,
        job: &SyncJob,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = job_entity::Entity::update_many()
            .col_expr(
                job_entity::Column::ClaimedAt,
                Expr::value(Some(to_fixed(now))),
            )
            .col_expr(job_entity::Column::UpdatedAt, Expr::value(to_fixed(now)))
            .filter(job_entity::Column::Id.eq(job.id))
            .filter(job_entity::Column::ClaimedBy.eq(worker_id))
            .filter(job_entity::Column::Status.is_in(held_statuses()))
            .filter(job_entity::Column::AttemptCount.eq(job.attempt_count))
            .exec(self.db.as_ref())
            .await?;

        Ok(result.rows_affected == 1)
    }

    async fn complete(
        &self,
        job: &SyncJob,
        watermark: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let txn = self.db.begin().await?;

        let result = job_entity::Entity::update_many()
            .col_expr(
                job_entity::Column::Status,
                Expr::value(JobStatus::Success.to_string()),
            )
            .col_expr(
                job_entity::Column::FinishedAt,
                Expr::value(Some(to_fixed(now))),
            )
            .col_expr(job_entity::Column::LastError, Expr::value(None::<String>))
            .col_expr(job_entity::Column::UpdatedAt, Expr::value(to_fixed(now)))
            .filter(job_entity::Column::Id.eq(job.id))
            .filter(job_entity::Column::Status.is_in(held_statuses()))
            .filter(job_entity::Column::AttemptCount.eq(job.attempt_count))
            .filter(held_by(job.claimed_by))
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(false);
        }

        Self::upsert_sync_state(&txn, job, watermark, now).await?;
        Self::adjust_failure_streak(&txn, job.repo_id, true, now).await?;
        txn.commit().await?;
        Ok(true)
    }

    async fn record_failure(
        &self,
        job: &SyncJob,
        error: &str,
        next_status: JobStatus,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let txn = self.db.begin().await?;

        let finished_at = next_status.is_terminal().then(|| to_fixed(now));
        let result = job_entity::Entity::update_many()
            .col_expr(
                job_entity::Column::Status,
                Expr::value(next_status.to_string()),
            )
            .col_expr(
                job_entity::Column::AttemptCount,
                Expr::value(job.attempt_count + 1),
            )
            .col_expr(
                job_entity::Column::LastError,
                Expr::value(Some(error.to_string())),
            )
            .col_expr(
                job_entity::Column::ScheduledFor,
                Expr::value(to_fixed(scheduled_for)),
            )
            .col_expr(job_entity::Column::ClaimedBy, Expr::value(None::<Uuid>))
            .col_expr(
                job_entity::Column::ClaimedAt,
                Expr::value(None::<DateTime<FixedOffset>>),
            )
            .col_expr(job_entity::Column::FinishedAt, Expr::value(finished_at))
            .col_expr(job_entity::Column::UpdatedAt, Expr::value(to_fixed(now)))
            .filter(job_entity::Column::Id.eq(job.id))
            .filter(job_entity::Column::Status.is_in(held_statuses()))
            .filter(job_entity::Column::AttemptCount.eq(job.attempt_count))
            .filter(held_by(job.claimed_by))
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(false);
        }

        Self::adjust_failure_streak(&txn, job.repo_id, false, now).await?;
        txn.commit().await?;
        Ok(true)
    }

    async fn requeue_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, RepositoryError> {
        let txn = self.db.begin().await?;

        let stale = job_entity::Entity::find()
            .filter(job_entity::Column::Status.is_in(held_statuses()))
            .filter(job_entity::Column::ClaimedAt.lt(to_fixed(cutoff)))
            .order_by_asc(job_entity::Column::ClaimedAt)
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .all(&txn)
            .await?;

        let mut requeued = Vec::with_capacity(stale.len());
        for model in stale {
            let result = job_entity::Entity::update_many()
                .col_expr(
                    job_entity::Column::Status,
                    Expr::value(JobStatus::Queued.to_string()),
                )
                .col_expr(
                    job_entity::Column::AttemptCount,
                    Expr::value(model.attempt_count + 1),
                )
                .col_expr(
                    job_entity::Column::LastError,
                    Expr::value(Some(CLAIM_EXPIRED.to_string())),
                )
                .col_expr(job_entity::Column::ClaimedBy, Expr::value(None::<Uuid>))
                .col_expr(
                    job_entity::Column::ClaimedAt,
                    Expr::value(None::<DateTime<FixedOffset>>),
                )
                .col_expr(job_entity::Column::ScheduledFor, Expr::value(to_fixed(now)))
                .col_expr(job_entity::Column::UpdatedAt, Expr::value(to_fixed(now)))
                .filter(job_entity::Column::Id.eq(model.id))
                .filter(job_entity::Column::Status.is_in(held_statuses()))
                .filter(job_entity::Column::ClaimedAt.lt(to_fixed(cutoff)))
                .exec(&txn)
                .await?;

            if result.rows_affected == 1 {
                let mut job: SyncJob = model.try_into()?;
                job.status = JobStatus::Queued;
                job.attempt_count += 1;
                job.last_error = Some(CLAIM_EXPIRED.to_string());
                job.claimed_by = None;
                job.claimed_at = None;
                job.scheduled_for = now;
                job.updated_at = now;
                requeued.push(job);
            }
        }

        txn.commit().await?;
        Ok(requeued)
    }

    async fn escalate_reclaimed(
        &self,
        reclaim_limit: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, RepositoryError> {
        let txn = self.db.begin().await?;

        let exhausted = job_entity::Entity::find()
            .filter(job_entity::Column::Status.eq(JobStatus::Queued.to_string()))
            .filter(job_entity::Column::LastError.eq(CLAIM_EXPIRED))
            .filter(job_entity::Column::AttemptCount.gt(reclaim_limit))
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .all(&txn)
            .await?;

        let mut escalated = Vec::with_capacity(exhausted.len());
        for model in exhausted {
            let result = job_entity::Entity::update_many()
                .col_expr(
                    job_entity::Column::Status,
                    Expr::value(JobStatus::Dead.to_string()),
                )
                .col_expr(
                    job_entity::Column::LastError,
                    Expr::value(Some(RECLAIM_LIMIT_EXCEEDED.to_string())),
                )
                .col_expr(
                    job_entity::Column::FinishedAt,
                    Expr::value(Some(to_fixed(now))),
                )
                .col_expr(job_entity::Column::UpdatedAt, Expr::value(to_fixed(now)))
                .filter(job_entity::Column::Id.eq(model.id))
                .filter(job_entity::Column::Status.eq(JobStatus::Queued.to_string()))
                .exec(&txn)
                .await?;

            if result.rows_affected == 1 {
                let mut job: SyncJob = model.try_into()?;
                job.status = JobStatus::Dead;
                job.last_error = Some(RECLAIM_LIMIT_EXCEEDED.to_string());
                job.finished_at = Some(now);
                job.updated_at = now;
                escalated.push(job);
            }
        }

        txn.commit().await?;
        Ok(escalated)
    }
}
