// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 工作器模块
///
/// 提供同步任务执行、遗弃任务回收和工作器生命周期管理
pub mod manager;
pub mod reaper_worker;
pub mod sync_worker;
pub mod worker;

pub use worker::Worker;
