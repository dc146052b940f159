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
        manager
            .create_table(
                Table::create()
                    .table(Repos::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Repos::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Repos::Name).string().not_null())
                    .col(ColumnDef::new(Repos::ScmType).string().not_null())
                    .col(ColumnDef::new(Repos::InstanceId).string().not_null())
                    .col(ColumnDef::new(Repos::TenantId).string())
                    .col(ColumnDef::new(Repos::JobTypes).json().not_null())
                    .col(ColumnDef::new(Repos::RepairWindowHours).integer())
                    .col(ColumnDef::new(Repos::BackfillStart).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(Repos::FailureStreak)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Repos::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Repos::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Repos::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_repos_instance_id")
                    .table(Repos::Table)
                    .col(Repos::InstanceId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Repos::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Repos {
    Table,
    Id,
    Name,
    ScmType,
    InstanceId,
    TenantId,
    JobTypes,
    RepairWindowHours,
    BackfillStart,
    FailureStreak,
    Enabled,
    CreatedAt,
    UpdatedAt,
}
