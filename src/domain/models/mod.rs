// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 领域模型模块
///
/// 定义仓库、同步任务、熔断器、令牌桶与预算等核心实体
pub mod bucket;
pub mod budget;
pub mod circuit_breaker;
pub mod repo;
pub mod sync_job;
