// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::sync_job::{DomainError, JobType};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 源码管理系统类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScmType {
    #[default]
    Gitlab,
    Svn,
}

impl fmt::Display for ScmType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ScmType::Gitlab => write!(f, "gitlab"),
            ScmType::Svn => write!(f, "svn"),
        }
    }
}

impl FromStr for ScmType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gitlab" => Ok(ScmType::Gitlab),
            "svn" => Ok(ScmType::Svn),
            other => Err(DomainError::ValidationError(format!(
                "unknown scm type: {}",
                other
            ))),
        }
    }
}

/// 仓库实体
///
/// 表示一个需要同步的上游仓库，归属于某个上游实例（以及可选的租户）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repo {
    pub id: Uuid,
    pub name: String,
    pub scm_type: ScmType,
    /// 上游系统实例标识，例如 `gitlab.example.com`
    pub instance_id: String,
    /// 租户标识，存在时作为并发预算的归属
    pub tenant_id: Option<String>,
    /// 启用的同步任务类型
    pub job_types: Vec<JobType>,
    /// 覆盖全局修复窗口（小时）
    pub repair_window_hours: Option<i32>,
    /// 回填起点，缺省时按修复窗口回溯
    pub backfill_start: Option<DateTime<Utc>>,
    /// 连续失败次数
    pub failure_streak: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repo {
    /// 创建一个启用增量同步的新仓库
    pub fn new(name: impl Into<String>, scm_type: ScmType, instance_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            scm_type,
            instance_id: instance_id.into(),
            tenant_id: None,
            job_types: vec![JobType::Incremental],
            repair_window_hours: None,
            backfill_start: None,
            failure_streak: 0,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// 并发预算的归属键：租户优先，否则为上游实例
    pub fn budget_key(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or(&self.instance_id)
    }

    /// 计算有效修复窗口
    pub fn repair_window(&self, default_hours: i64) -> Duration {
        Duration::hours(
            self.repair_window_hours
                .map(i64::from)
                .unwrap_or(default_hours),
        )
    }
}

/// 仓库同步状态
///
/// 每个 (repo, job_type) 一条，记录水位线与最近一次成功时间
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoSyncState {
    pub repo_id: Uuid,
    pub job_type: JobType,
    /// 最近一次成功同步的游标（时间戳或修订号），不透明字符串
    pub watermark: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_job_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}
