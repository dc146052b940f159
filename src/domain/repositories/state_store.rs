// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// CAS 冲突时的最大重试次数
pub const MAX_CAS_ATTEMPTS: usize = 16;

/// 状态存储错误类型
#[derive(Error, Debug)]
pub enum StateStoreError {
    /// Redis错误
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 多次比较并交换均失败
    #[error("Too much contention on key {key} after {attempts} attempts")]
    Contention { key: String, attempts: usize },
}

/// 带版本号的值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: String,
    pub version: u64,
}

/// 键值状态存储特质
///
/// 熔断器与令牌桶的状态都保存在这里，以便多个调度器和 worker 进程共享。
/// 所有写入都通过版本号做比较并交换。
#[async_trait]
pub trait StateStore: Send + Sync {
    /// 读取键的当前值与版本
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StateStoreError>;

    /// 比较并交换
    ///
    /// `expected_version` 为 `None` 表示要求键不存在。
    /// 成功写入返回 `true`，版本不匹配返回 `false`。
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: &str,
    ) -> Result<bool, StateStoreError>;

    /// 尝试获取带过期时间的租约（建议锁）
    async fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StateStoreError>;

    /// 释放租约，只有持有者可以释放
    async fn release_lease(&self, key: &str, holder: &str) -> Result<(), StateStoreError>;
}

/// 读取 JSON 状态
pub async fn load_json<T>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>, StateStoreError>
where
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(current) => Ok(Some(serde_json::from_str(&current.value)?)),
        None => Ok(None),
    }
}

/// 以 CAS 循环更新 JSON 状态
///
/// `mutate` 接收当前值（不存在时为 `init()`），返回新值与附带结果。
/// 若返回的新值为 `None` 则不写入，直接返回结果。
pub async fn update_json<T, R, I, F>(
    store: &dyn StateStore,
    key: &str,
    init: I,
    mut mutate: F,
) -> Result<R, StateStoreError>
where
    T: Serialize + DeserializeOwned,
    I: Fn() -> T,
    F: FnMut(T) -> (Option<T>, R),
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let current = store.get(key).await?;
        let (state, version) = match &current {
            Some(v) => (serde_json::from_str::<T>(&v.value)?, Some(v.version)),
            None => (init(), None),
        };

        let (next, result) = mutate(state);
        let Some(next) = next else {
            return Ok(result);
        };

        let encoded = serde_json::to_string(&next)?;
        if store.compare_and_swap(key, version, &encoded).await? {
            return Ok(result);
        }
        tracing::debug!("CAS conflict on {}, retrying", key);
    }

    Err(StateStoreError::Contention {
        key: key.to_string(),
        attempts: MAX_CAS_ATTEMPTS,
    })
}
