// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 缓存模块
///
/// 提供共享键值状态的实现：
/// - Redis客户端（redis_client）
/// - 基于Redis的状态存储（redis_state_store），多进程部署使用
/// - 进程内状态存储（memory_state_store），测试与单进程部署使用
pub mod memory_state_store;
pub mod redis_client;
pub mod redis_state_store;
