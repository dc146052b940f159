// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 熔断器状态枚举
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// 关闭状态，正常放行
    #[default]
    Closed,
    /// 打开状态，拒绝放行
    Open,
    /// 半开状态，仅放行一个探测任务
    HalfOpen,
}

impl CircuitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half_open",
        }
    }
}

/// 熔断键的作用域
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BreakerScope {
    /// 以上游实例隔离
    #[default]
    Instance,
    /// 以单个仓库隔离
    Repo,
}

/// 持久化的熔断器状态
///
/// 以 JSON 形式存放在键值存储中，通过比较并交换更新
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub key: String,
    pub status: CircuitStatus,
    /// 时间窗口内的失败时间戳
    pub failures: Vec<DateTime<Utc>>,
    /// 自上次成功以来的连续失败次数
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    /// 当前冷却时长（秒），探测失败时会被延长
    pub cool_down_secs: i64,
    pub probe_in_flight: bool,
    pub probe_started_at: Option<DateTime<Utc>>,
}

impl CircuitBreakerState {
    pub fn closed(key: impl Into<String>, cool_down: Duration) -> Self {
        Self {
            key: key.into(),
            status: CircuitStatus::Closed,
            failures: Vec::new(),
            consecutive_failures: 0,
            opened_at: None,
            cool_down_secs: cool_down.num_seconds(),
            probe_in_flight: false,
            probe_started_at: None,
        }
    }

    pub fn cool_down(&self) -> Duration {
        Duration::seconds(self.cool_down_secs)
    }

    /// 在指定时刻观察到的状态
    ///
    /// Open 状态在冷却结束后视为 HalfOpen，无需写回存储
    pub fn observed_status(&self, now: DateTime<Utc>) -> CircuitStatus {
        match (self.status, self.opened_at) {
            (CircuitStatus::Open, Some(opened_at)) if now >= opened_at + self.cool_down() => {
                CircuitStatus::HalfOpen
            }
            (status, _) => status,
        }
    }

    /// 探测任务是否仍被视为在途
    pub fn probe_active(&self, now: DateTime<Utc>, probe_timeout: Duration) -> bool {
        match (self.probe_in_flight, self.probe_started_at) {
            (true, Some(started)) => now < started + probe_timeout,
            (true, None) => true,
            _ => false,
        }
    }
}

/// 提供给策略引擎的熔断器只读视图
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BreakerView {
    pub status: CircuitStatus,
    pub probe_in_flight: bool,
}
