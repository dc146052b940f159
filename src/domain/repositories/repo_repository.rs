// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::repo::{Repo, RepoSyncState};
use crate::domain::models::sync_job::JobType;
use crate::domain::repositories::sync_job_repository::RepositoryError;
use async_trait::async_trait;
use uuid::Uuid;

/// 仓库与水位线存储特质
///
/// 水位线的推进由任务仓库在确认成功的事务内完成
#[async_trait]
pub trait RepoRepository: Send + Sync {
    /// 创建仓库
    async fn create(&self, repo: &Repo) -> Result<Repo, RepositoryError>;
    /// 根据ID查找仓库
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Repo>, RepositoryError>;
    /// 列出所有启用的仓库
    async fn list_enabled(&self) -> Result<Vec<Repo>, RepositoryError>;
    /// 列出全部同步状态
    async fn list_sync_states(&self) -> Result<Vec<RepoSyncState>, RepositoryError>;
    /// 写入同步状态，用于导入已有水位线
    async fn save_sync_state(&self, state: &RepoSyncState) -> Result<(), RepositoryError>;
    /// 查找单个同步状态
    async fn find_sync_state(
        &self,
        repo_id: Uuid,
        job_type: JobType,
    ) -> Result<Option<RepoSyncState>, RepositoryError>;
}
