// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 领域服务模块
///
/// 包含的服务：
/// - 熔断器（circuit_breaker）：按上游实例或仓库隔离故障
/// - 策略引擎（policy_engine）：决定本次节拍入队哪些任务
/// - 令牌桶（rate_limit_bucket）：按上游实例限流
/// - 任务执行器（task_executor）：实际执行同步的外部接口
pub mod circuit_breaker;
pub mod policy_engine;
pub mod rate_limit_bucket;
pub mod task_executor;
