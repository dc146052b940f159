// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "repos")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    pub scm_type: String,
    pub instance_id: String,
    pub tenant_id: Option<String>,
    /// 启用的任务类型，JSON 字符串数组
    pub job_types: Json,
    pub repair_window_hours: Option<i32>,
    pub backfill_start: Option<ChronoDateTimeWithTimeZone>,
    pub failure_streak: i32,
    pub enabled: bool,
    pub created_at: ChronoDateTimeWithTimeZone,
    pub updated_at: ChronoDateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
