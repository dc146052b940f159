// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// 同步任务类型
///
/// 决定任务负载的结构以及成功后水位线的推进规则
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// 增量同步，从当前水位线继续
    Incremental,
    /// 历史回填，覆盖显式的时间区间
    Backfill,
}

impl JobType {
    pub const ALL: [JobType; 2] = [JobType::Incremental, JobType::Backfill];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Incremental => "incremental",
            JobType::Backfill => "backfill",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incremental" => Ok(JobType::Incremental),
            "backfill" => Ok(JobType::Backfill),
            other => Err(DomainError::ValidationError(format!(
                "unknown job type: {}",
                other
            ))),
        }
    }
}

/// 同步任务状态
///
/// 状态转换遵循以下流程：
/// Queued → Claimed → Running → Success / Queued(重试) / Dead
///
/// Success 与 Dead 为终态，终态行永久保留用于审计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// 已入队，等待被认领
    #[default]
    Queued,
    /// 已被某个 worker 认领
    Claimed,
    /// 正在执行
    Running,
    /// 执行成功
    Success,
    /// 执行失败（过渡状态，随后重新入队或进入 Dead）
    Failed,
    /// 重试耗尽，不再执行
    Dead,
}

impl JobStatus {
    /// 参与唯一性约束的活跃状态
    pub const ACTIVE: [JobStatus; 3] = [JobStatus::Queued, JobStatus::Claimed, JobStatus::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Claimed => "claimed",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Dead)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "claimed" => Ok(JobStatus::Claimed),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(DomainError::ValidationError(format!(
                "unknown job status: {}",
                other
            ))),
        }
    }
}

/// 任务负载
///
/// 以任务类型为标签的变体，每种类型拥有独立的结构。
/// 队列层只保存 JSON，认领后在派发给执行器之前解码校验。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum JobPayload {
    /// 增量同步负载
    Incremental {
        /// 起始游标（上次成功的水位线），首次同步时为空
        since: Option<String>,
    },
    /// 回填负载
    Backfill {
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        /// 成功后是否推进水位线，回填默认不推进
        update_watermark: bool,
    },
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::Incremental { .. } => JobType::Incremental,
            JobPayload::Backfill { .. } => JobType::Backfill,
        }
    }

    /// 成功确认时是否允许推进水位线
    pub fn allows_watermark_update(&self) -> bool {
        match self {
            JobPayload::Incremental { .. } => true,
            JobPayload::Backfill {
                update_watermark, ..
            } => *update_watermark,
        }
    }

    /// 校验负载与任务类型一致且内容合法
    pub fn validate_for(&self, job_type: JobType) -> Result<(), DomainError> {
        if self.job_type() != job_type {
            return Err(DomainError::ValidationError(format!(
                "payload tagged {} on a {} job",
                self.job_type(),
                job_type
            )));
        }
        if let JobPayload::Backfill { since, until, .. } = self {
            if since >= until {
                return Err(DomainError::ValidationError(format!(
                    "backfill range is empty: {} >= {}",
                    since, until
                )));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Value {
        // 枚举只包含可序列化字段，不会失败
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// 同步候选
///
/// 每次调度节拍计算得出，不直接持久化
#[derive(Debug, Clone, PartialEq)]
pub struct SyncJobCandidate {
    pub repo_id: Uuid,
    pub instance_id: String,
    /// 预算归属（租户或上游实例）
    pub budget_key: String,
    pub breaker_key: String,
    pub job_type: JobType,
    pub base_priority: i32,
    /// 距离上次成功同步已过去的时间
    pub staleness_age: Duration,
    pub payload: JobPayload,
}

/// 同步任务实体
///
/// 队列表中的一行。由调度节拍创建，由 worker 与 reaper 修改，永不删除。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub repo_id: Uuid,
    pub instance_id: String,
    pub budget_key: String,
    pub breaker_key: String,
    pub job_type: JobType,
    pub status: JobStatus,
    /// 有效优先级，数值越大越先被认领
    pub effective_priority: i32,
    /// 原始负载 JSON，使用 [`SyncJob::decode_payload`] 校验
    pub payload: serde_json::Value,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub claimed_by: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// 最早可被认领的时间，重试退避通过它表达
    pub scheduled_for: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 领域错误类型
#[derive(Error, Debug)]
pub enum DomainError {
    /// 无效的状态转换
    #[error("Invalid state transition from {0}")]
    InvalidStateTransition(JobStatus),

    /// 验证错误
    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl SyncJob {
    /// 由候选创建一个新的排队任务
    ///
    /// # 参数
    ///
    /// * `candidate` - 被策略引擎接纳的候选
    /// * `effective_priority` - 扣除限流惩罚后的优先级
    /// * `max_attempts` - 最大尝试次数
    /// * `now` - 当前时间
    pub fn from_candidate(
        candidate: &SyncJobCandidate,
        effective_priority: i32,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            repo_id: candidate.repo_id,
            instance_id: candidate.instance_id.clone(),
            budget_key: candidate.budget_key.clone(),
            breaker_key: candidate.breaker_key.clone(),
            job_type: candidate.job_type,
            status: JobStatus::Queued,
            effective_priority,
            payload: candidate.payload.to_json(),
            attempt_count: 0,
            max_attempts,
            claimed_by: None,
            claimed_at: None,
            scheduled_for: now,
            finished_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 解码并校验负载
    pub fn decode_payload(&self) -> Result<JobPayload, DomainError> {
        let payload: JobPayload = serde_json::from_value(self.payload.clone())
            .map_err(|e| DomainError::ValidationError(format!("invalid payload: {}", e)))?;
        payload.validate_for(self.job_type)?;
        Ok(payload)
    }

    /// 判断再失败一次后是否仍可重试
    pub fn can_retry(&self) -> bool {
        self.attempt_count + 1 < self.max_attempts
    }

    /// 是否被指定 worker 持有
    pub fn is_held_by(&self, worker_id: Uuid) -> bool {
        matches!(self.status, JobStatus::Claimed | JobStatus::Running)
            && self.claimed_by == Some(worker_id)
    }
}
