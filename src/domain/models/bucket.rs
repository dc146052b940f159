// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 上游实例的令牌桶状态
///
/// 每个上游系统实例一份，存放在键值存储中
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceBucketStatus {
    pub instance_id: String,
    /// 当前令牌数（允许小数，连续补充）
    pub tokens: f64,
    pub capacity: f64,
    /// 每秒补充的令牌数
    pub refill_rate: f64,
    /// 上次结算令牌的时间，显式暂停时推迟到暂停结束
    pub updated_at: DateTime<Utc>,
    /// 预计令牌恢复到 1 的时间，令牌不足 1 时设置
    pub paused_until: Option<DateTime<Utc>>,
}

impl InstanceBucketStatus {
    pub fn full(
        instance_id: impl Into<String>,
        capacity: f64,
        refill_rate: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            tokens: capacity,
            capacity,
            refill_rate,
            updated_at: now,
            paused_until: None,
        }
    }

    /// 结算到指定时刻的令牌
    ///
    /// `updated_at` 可能位于未来（被显式暂停），此时不补充
    pub fn refilled(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        if now > self.updated_at {
            let elapsed = (now - self.updated_at).num_milliseconds() as f64 / 1000.0;
            next.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            next.updated_at = now;
        }
        next.paused_until = (next.tokens < 1.0).then(|| next.predict_refill());
        next
    }

    /// 预测令牌恢复到 1 的时间
    pub fn predict_refill(&self) -> DateTime<Utc> {
        if self.refill_rate <= 0.0 {
            return self.updated_at + Duration::days(365);
        }
        let missing = (1.0 - self.tokens).max(0.0);
        self.updated_at + Duration::milliseconds((missing / self.refill_rate * 1000.0).ceil() as i64)
    }

    /// 取走一个令牌，最低为零
    pub fn take_token(&mut self) {
        self.tokens = (self.tokens - 1.0).max(0.0);
        self.paused_until = (self.tokens < 1.0).then(|| self.predict_refill());
    }

    /// 清空令牌，`until` 之前不再补充
    pub fn hold_until(&mut self, until: DateTime<Utc>) {
        self.tokens = 0.0;
        self.updated_at = self.updated_at.max(until);
        self.paused_until = Some(self.predict_refill());
    }

    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.tokens < 1.0 || self.paused_until.is_some_and(|until| until > now)
    }
}
