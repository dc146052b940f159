// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use serde::{Deserialize, Serialize};

/// 全局共享预算的归属键
pub const GLOBAL_BUDGET_KEY: &str = "*";

/// 并发预算快照
///
/// 每次调度节拍重新读取，属于建议性数据，轻微过期可以接受
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    /// 租户或上游实例标识
    pub owner_id: String,
    pub max_concurrent: usize,
    /// 当前在途（排队、已认领、执行中）的任务数
    pub current_in_flight: usize,
}

impl BudgetSnapshot {
    pub fn new(owner_id: impl Into<String>, max_concurrent: usize, current_in_flight: usize) -> Self {
        Self {
            owner_id: owner_id.into(),
            max_concurrent,
            current_in_flight,
        }
    }

    /// 在已接纳 `admitted` 个任务后是否还有余量
    pub fn has_room(&self, admitted: usize) -> bool {
        self.current_in_flight + admitted < self.max_concurrent
    }
}
