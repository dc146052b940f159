// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::sync_job::{JobPayload, JobType};
use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// 执行结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// 新的水位线，为空时不推进
    #[serde(default)]
    pub watermark: Option<String>,
    /// 同步的条目数，仅用于日志
    #[serde(default)]
    pub items_synced: u64,
}

/// 任务执行错误
#[derive(Error, Debug)]
pub enum TaskExecutionError {
    /// 可重试的失败
    #[error("Execution failed: {0}")]
    Failed(String),

    /// 不可重试的失败，任务直接进入 Dead
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// 上游限流，携带建议的等待时间
    #[error("Rate limited by upstream, retry after {retry_after}")]
    RateLimited { retry_after: Duration },

    /// 执行超时
    #[error("Execution timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// 被协作取消
    #[error("Execution cancelled")]
    Cancelled,
}

impl TaskExecutionError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TaskExecutionError::Permanent(_))
    }
}

/// 任务执行器特质
///
/// 实现者负责与具体的源码管理系统交互。
/// 应当定期检查 `cancel`，被取消时尽快返回 [`TaskExecutionError::Cancelled`]。
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// 执行一次同步
    ///
    /// # 参数
    ///
    /// * `job_type` - 任务类型
    /// * `payload` - 已校验的负载
    /// * `cancel` - 取消令牌
    ///
    /// # 返回值
    ///
    /// * `Ok(ExecutionOutcome)` - 执行成功
    /// * `Err(TaskExecutionError)` - 执行失败
    async fn execute(
        &self,
        job_type: JobType,
        payload: &JobPayload,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, TaskExecutionError>;
}
