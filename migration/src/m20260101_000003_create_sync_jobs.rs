// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

/// 活跃状态下 (repo_id, job_type) 唯一
///
/// 部分索引在 Postgres 与 SQLite 上语法一致
const CREATE_ACTIVE_UNIQUE_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS uq_sync_jobs_active \
     ON sync_jobs (repo_id, job_type) \
     WHERE status IN ('queued', 'claimed', 'running')";

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncJobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncJobs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(SyncJobs::RepoId).uuid().not_null())
                    .col(ColumnDef::new(SyncJobs::InstanceId).string().not_null())
                    .col(ColumnDef::new(SyncJobs::BudgetKey).string().not_null())
                    .col(ColumnDef::new(SyncJobs::BreakerKey).string().not_null())
                    .col(ColumnDef::new(SyncJobs::JobType).string().not_null())
                    .col(ColumnDef::new(SyncJobs::Status).string().not_null())
                    .col(
                        ColumnDef::new(SyncJobs::EffectivePriority)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(SyncJobs::Payload).json().not_null())
                    .col(
                        ColumnDef::new(SyncJobs::AttemptCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::MaxAttempts)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(ColumnDef::new(SyncJobs::ClaimedBy).uuid())
                    .col(ColumnDef::new(SyncJobs::ClaimedAt).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(SyncJobs::ScheduledFor)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(SyncJobs::FinishedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(SyncJobs::LastError).text())
                    .col(
                        ColumnDef::new(SyncJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // claim 扫描路径
        manager
            .create_index(
                Index::create()
                    .name("idx_sync_jobs_status_priority_scheduled")
                    .table(SyncJobs::Table)
                    .col(SyncJobs::Status)
                    .col(SyncJobs::EffectivePriority)
                    .col(SyncJobs::ScheduledFor)
                    .to_owned(),
            )
            .await?;

        // reaper 扫描路径
        manager
            .create_index(
                Index::create()
                    .name("idx_sync_jobs_status_claimed_at")
                    .table(SyncJobs::Table)
                    .col(SyncJobs::Status)
                    .col(SyncJobs::ClaimedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .get_connection()
            .execute_unprepared(CREATE_ACTIVE_UNIQUE_INDEX)
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncJobs {
    Table,
    Id,
    RepoId,
    InstanceId,
    BudgetKey,
    BreakerKey,
    JobType,
    Status,
    EffectivePriority,
    Payload,
    AttemptCount,
    MaxAttempts,
    ClaimedBy,
    ClaimedAt,
    ScheduledFor,
    FinishedAt,
    LastError,
    CreatedAt,
    UpdatedAt,
}
