// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 配置模块
///
/// 处理应用程序的配置设置和环境变量
pub mod config;

/// 领域模块
///
/// 包含核心实体、策略引擎、熔断器、令牌桶和仓库接口
pub mod domain;

/// 基础设施模块
///
/// 提供数据库、状态存储、执行器与指标导出等外部集成
pub mod infrastructure;

/// 队列模块
///
/// 实现同步任务队列和调度节拍
pub mod queue;

/// 工具模块
///
/// 提供通用的工具函数和辅助功能
pub mod utils;

/// 工作器模块
///
/// 实现同步 worker、回收器和工作器管理
pub mod workers;
