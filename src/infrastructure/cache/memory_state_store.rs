// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::repositories::state_store::{StateStore, StateStoreError, Versioned};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// 进程内状态存储
///
/// 用于测试与单进程部署，多个进程之间不共享
#[derive(Default)]
pub struct MemoryStateStore {
    values: DashMap<String, Versioned>,
    leases: DashMap<String, (String, Instant)>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StateStoreError> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: &str,
    ) -> Result<bool, StateStoreError> {
        match self.values.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if expected_version != Some(entry.get().version) {
                    return Ok(false);
                }
                let version = entry.get().version + 1;
                entry.insert(Versioned {
                    value: value.to_string(),
                    version,
                });
                Ok(true)
            }
            Entry::Vacant(entry) => {
                if expected_version.is_some() {
                    return Ok(false);
                }
                entry.insert(Versioned {
                    value: value.to_string(),
                    version: 1,
                });
                Ok(true)
            }
        }
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StateStoreError> {
        let now = Instant::now();
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let (current, expires_at) = entry.get();
                if current != holder && *expires_at > now {
                    return Ok(false);
                }
                entry.insert((holder.to_string(), now + ttl));
                Ok(true)
            }
            Entry::Vacant(entry) => {
                entry.insert((holder.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<(), StateStoreError> {
        self.leases.remove_if(key, |_, (current, _)| current == holder);
        Ok(())
    }
}
