// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 队列模块
///
/// 提供同步任务队列和调度节拍
pub mod scheduler;
pub mod sync_queue;
