// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 领域层模块
///
/// 该模块包含同步引擎的核心业务逻辑，包括：
/// - 领域模型（models）：仓库、同步任务、熔断器与令牌桶状态
/// - 仓库接口（repositories）：任务队列、仓库元数据与键值状态的持久化抽象
/// - 服务（services）：策略引擎、熔断器、令牌桶与任务执行器接口
///
/// 领域层不依赖于任何具体的存储实现。
pub mod models;
pub mod repositories;
pub mod services;
