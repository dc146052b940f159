// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 仓库接口模块
///
/// 该模块定义了领域层的仓库接口，遵循依赖倒置原则。
/// 具体实现由基础设施层提供。
///
/// 包含的仓库接口：
/// - 仓库元数据仓库（repo_repository）：管理待同步仓库及其水位线
/// - 同步任务仓库（sync_job_repository）：管理持久化任务队列
/// - 状态存储（state_store）：熔断器、令牌桶与调度锁的键值存储
pub mod repo_repository;
pub mod state_store;
pub mod sync_job_repository;
