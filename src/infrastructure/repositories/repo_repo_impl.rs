// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::repo::{Repo, RepoSyncState};
use crate::domain::models::sync_job::JobType;
use crate::domain::repositories::repo_repository::RepoRepository;
use crate::domain::repositories::sync_job_repository::RepositoryError;
use crate::infrastructure::database::entities::{repo as repo_entity, repo_sync_state as state_entity};
use crate::infrastructure::repositories::sync_job_repo_impl::{to_fixed, to_utc};
use async_trait::async_trait;
use sea_orm::{
    sea_query::OnConflict, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

impl TryFrom<repo_entity::Model> for Repo {
    type Error = RepositoryError;

    fn try_from(model: repo_entity::Model) -> Result<Self, Self::Error> {
        let job_types: Vec<JobType> = serde_json::from_value(model.job_types)
            .map_err(|e| RepositoryError::Corrupt(format!("repo {}: {}", model.id, e)))?;
        Ok(Self {
            id: model.id,
            name: model.name,
            scm_type: model
                .scm_type
                .parse()
                .map_err(|e| RepositoryError::Corrupt(format!("repo {}: {}", model.id, e)))?,
            instance_id: model.instance_id,
            tenant_id: model.tenant_id,
            job_types,
            repair_window_hours: model.repair_window_hours,
            backfill_start: model.backfill_start.map(to_utc),
            failure_streak: model.failure_streak,
            enabled: model.enabled,
            created_at: to_utc(model.created_at),
            updated_at: to_utc(model.updated_at),
        })
    }
}

impl From<&Repo> for repo_entity::ActiveModel {
    fn from(repo: &Repo) -> Self {
        Self {
            id: Set(repo.id),
            name: Set(repo.name.clone()),
            scm_type: Set(repo.scm_type.to_string()),
            instance_id: Set(repo.instance_id.clone()),
            tenant_id: Set(repo.tenant_id.clone()),
            job_types: Set(serde_json::json!(repo
                .job_types
                .iter()
                .map(JobType::as_str)
                .collect::<Vec<_>>())),
            repair_window_hours: Set(repo.repair_window_hours),
            backfill_start: Set(repo.backfill_start.map(to_fixed)),
            failure_streak: Set(repo.failure_streak),
            enabled: Set(repo.enabled),
            created_at: Set(to_fixed(repo.created_at)),
            updated_at: Set(to_fixed(repo.updated_at)),
        }
    }
}

impl TryFrom<state_entity::Model> for RepoSyncState {
    type Error = RepositoryError;

    fn try_from(model: state_entity::Model) -> Result<Self, Self::Error> {
        Ok(Self {
            repo_id: model.repo_id,
            job_type: model
                .job_type
                .parse()
                .map_err(|e| RepositoryError::Corrupt(format!("sync state {}: {}", model.repo_id, e)))?,
            watermark: model.watermark,
            last_synced_at: model.last_synced_at.map(to_utc),
            last_job_id: model.last_job_id,
            updated_at: to_utc(model.updated_at),
        })
    }
}

/// 仓库元数据仓库实现
#[derive(Clone)]
pub struct RepoRepositoryImpl {
    /// 数据库连接
    db: Arc<DatabaseConnection>,
}

impl RepoRepositoryImpl {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RepoRepository for RepoRepositoryImpl {
    async fn create(&self, repo: &Repo) -> Result<Repo, RepositoryError> {
        let model: repo_entity::ActiveModel = repo.into();
        model.insert(self.db.as_ref()).await?.try_into()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Repo>, RepositoryError> {
        repo_entity::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?
            .map(TryInto::try_into)
            .transpose()
    }

    async fn list_enabled(&self) -> Result<Vec<Repo>, RepositoryError> {
        let models = repo_entity::Entity::find()
            .filter(repo_entity::Column::Enabled.eq(true))
            .order_by_asc(repo_entity::Column::Id)
            .all(self.db.as_ref())
            .await?;

        models.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_sync_states(&self) -> Result<Vec<RepoSyncState>, RepositoryError> {
        let models = state_entity::Entity::find().all(self.db.as_ref()).await?;
        models.into_iter().map(TryInto::try_into).collect()
    }

    async fn save_sync_state(&self, state: &RepoSyncState) -> Result<(), RepositoryError> {
        let model = state_entity::ActiveModel {
            repo_id: Set(state.repo_id),
            job_type: Set(state.job_type.to_string()),
            watermark: Set(state.watermark.clone()),
            last_synced_at: Set(state.last_synced_at.map(to_fixed)),
            last_job_id: Set(state.last_job_id),
            updated_at: Set(to_fixed(state.updated_at)),
        };

        state_entity::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([
                    state_entity::Column::RepoId,
                    state_entity::Column::JobType,
                ])
                .update_columns([
                    state_entity::Column::Watermark,
                    state_entity::Column::LastSyncedAt,
                    state_entity::Column::LastJobId,
                    state_entity::Column::UpdatedAt,
                ])
                .to_owned(),
            )
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    async fn find_sync_state(
        &self,
        repo_id: Uuid,
        job_type: JobType,
    ) -> Result<Option<RepoSyncState>, RepositoryError> {
        state_entity::Entity::find_by_id((repo_id, job_type.to_string()))
            .one(self.db.as_ref())
            .await?
            .map(TryInto::try_into)
            .transpose()
    }
}
