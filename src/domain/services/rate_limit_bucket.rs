// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::bucket::InstanceBucketStatus;
use crate::domain::repositories::state_store::{load_json, update_json, StateStore, StateStoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub use crate::domain::services::policy_engine::calculate_bucket_priority_penalty;

/// 令牌桶配置
#[derive(Debug, Clone)]
pub struct BucketConfig {
    /// 桶容量
    pub capacity: f64,
    /// 每秒补充的令牌数
    pub refill_rate: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            refill_rate: 1.0,
        }
    }
}

/// 上游实例令牌桶
///
/// 只影响排序与排除，不会让调度节拍失败
#[derive(Clone)]
pub struct RateLimitBucket {
    store: Arc<dyn StateStore>,
    config: BucketConfig,
}

impl RateLimitBucket {
    pub fn new(store: Arc<dyn StateStore>, config: BucketConfig) -> Self {
        Self { store, config }
    }

    fn key(instance_id: &str) -> String {
        format!("bucket:{}", instance_id)
    }

    fn initial(&self, instance_id: &str, now: DateTime<Utc>) -> InstanceBucketStatus {
        InstanceBucketStatus::full(
            instance_id,
            self.config.capacity,
            self.config.refill_rate,
            now,
        )
    }

    /// 读取结算到 `now` 的令牌桶视图，不写回
    pub async fn snapshot(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<InstanceBucketStatus, StateStoreError> {
        let stored: Option<InstanceBucketStatus> =
            load_json(self.store.as_ref(), &Self::key(instance_id)).await?;
        Ok(stored
            .unwrap_or_else(|| self.initial(instance_id, now))
            .refilled(now))
    }

    /// 消耗一个令牌
    ///
    /// 令牌数最低为零，空桶时不报错
    pub async fn consume(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<InstanceBucketStatus, StateStoreError> {
        update_json(
            self.store.as_ref(),
            &Self::key(instance_id),
            || self.initial(instance_id, now),
            |state: InstanceBucketStatus| {
                let mut next = state.refilled(now);
                next.take_token();
                (Some(next.clone()), next)
            },
        )
        .await
    }

    /// 上游报告限流时清空令牌并暂停到 `until`
    pub async fn pause(
        &self,
        instance_id: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<InstanceBucketStatus, StateStoreError> {
        let paused = update_json(
            self.store.as_ref(),
            &Self::key(instance_id),
            || self.initial(instance_id, now),
            |state: InstanceBucketStatus| {
                let mut next = state.refilled(now);
                next.hold_until(until);
                (Some(next.clone()), next)
            },
        )
        .await?;
        tracing::warn!(
            "Bucket for instance {} paused until {}",
            instance_id,
            until
        );
        Ok(paused)
    }
}
