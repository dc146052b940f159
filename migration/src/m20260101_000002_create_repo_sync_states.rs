// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // 每个 (repo, job_type) 一行水位线
        manager
            .create_table(
                Table::create()
                    .table(RepoSyncStates::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(RepoSyncStates::RepoId).uuid().not_null())
                    .col(ColumnDef::new(RepoSyncStates::JobType).string().not_null())
                    .col(ColumnDef::new(RepoSyncStates::Watermark).string())
                    .col(ColumnDef::new(RepoSyncStates::LastSyncedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(RepoSyncStates::LastJobId).uuid())
                    .col(
                        ColumnDef::new(RepoSyncStates::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .col(RepoSyncStates::RepoId)
                            .col(RepoSyncStates::JobType),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RepoSyncStates::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RepoSyncStates {
    Table,
    RepoId,
    JobType,
    Watermark,
    LastSyncedAt,
    LastJobId,
    UpdatedAt,
}
