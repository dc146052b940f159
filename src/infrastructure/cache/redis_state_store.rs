// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::repositories::state_store::{StateStore, StateStoreError, Versioned};
use crate::infrastructure::cache::redis_client::RedisClient;
use async_trait::async_trait;
use std::time::Duration;

/// 版本号匹配时写入并递增版本
///
/// 期望版本为空字符串表示要求键不存在
const CAS_SCRIPT: &str = r#"
    local key = KEYS[1]
    local expected = ARGV[1]
    local value = ARGV[2]

    local current = redis.call("HGET", key, "version")
    if expected == "" then
        if current then
            return 0
        end
    elseif (not current) or current ~= expected then
        return 0
    end

    local next_version = (tonumber(current) or 0) + 1
    redis.call("HSET", key, "value", value, "version", next_version)
    return 1
"#;

/// 仅持有者可以释放租约
const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    end
    return 0
"#;

/// 基于Redis的状态存储
///
/// 每个键是一个包含 `value` 与 `version` 字段的哈希，
/// 比较并交换通过 Lua 脚本原子执行
#[derive(Clone)]
pub struct RedisStateStore {
    client: RedisClient,
    prefix: String,
}

impl RedisStateStore {
    /// 创建新的状态存储
    ///
    /// # 参数
    ///
    /// * `client` - Redis客户端
    /// * `prefix` - 键前缀，用于与其他应用隔离
    pub fn new(client: RedisClient, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StateStoreError> {
        let mut conn = self.client.connection().await?;
        let (value, version): (Option<String>, Option<u64>) = redis::cmd("HMGET")
            .arg(self.key(key))
            .arg("value")
            .arg("version")
            .query_async(&mut conn)
            .await?;

        Ok(match (value, version) {
            (Some(value), Some(version)) => Some(Versioned { value, version }),
            _ => None,
        })
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: &str,
    ) -> Result<bool, StateStoreError> {
        let mut conn = self.client.connection().await?;
        let expected = expected_version.map(|v| v.to_string()).unwrap_or_default();
        let swapped: i64 = redis::Script::new(CAS_SCRIPT)
            .key(self.key(key))
            .arg(expected)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StateStoreError> {
        let mut conn = self.client.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<(), StateStoreError> {
        let mut conn = self.client.connection().await?;
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.key(key))
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
