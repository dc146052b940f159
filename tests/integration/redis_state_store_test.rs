// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::helpers::t0;
use chrono::Duration;
use scmsync::domain::models::circuit_breaker::CircuitStatus;
use scmsync::domain::repositories::state_store::StateStore;
use scmsync::domain::services::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerController};
use scmsync::infrastructure::cache::redis_client::RedisClient;
use scmsync::infrastructure::cache::redis_state_store::RedisStateStore;
use std::sync::Arc;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage};

async fn start_redis() -> (ContainerAsync<GenericImage>, RedisStateStore) {
    let node = GenericImage::new("redis", "7-alpine")
        .start()
        .await
        .expect("Failed to start Redis");
    let port = node
        .get_host_port_ipv4(6379)
        .await
        .expect("Failed to get Redis port");
    let client = RedisClient::new(&format!("redis://127.0.0.1:{}", port)).unwrap();
    (node, RedisStateStore::new(client, "scmsync-test:"))
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_compare_and_swap_versions() {
    let (_node, store) = start_redis().await;

    assert!(store.get("k").await.unwrap().is_none());
    assert!(store.compare_and_swap("k", None, "v1").await.unwrap());
    assert!(!store.compare_and_swap("k", None, "v1-again").await.unwrap());

    let current = store.get("k").await.unwrap().unwrap();
    assert_eq!(current.value, "v1");
    assert!(store
        .compare_and_swap("k", Some(current.version), "v2")
        .await
        .unwrap());
    assert!(!store
        .compare_and_swap("k", Some(current.version), "stale")
        .await
        .unwrap());
    assert_eq!(store.get("k").await.unwrap().unwrap().value, "v2");
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_lease_is_exclusive_until_released() {
    let (_node, store) = start_redis().await;
    let ttl = std::time::Duration::from_secs(30);

    assert!(store.try_acquire_lease("lock", "a", ttl).await.unwrap());
    assert!(!store.try_acquire_lease("lock", "b", ttl).await.unwrap());

    // 非持有者释放无效
    store.release_lease("lock", "b").await.unwrap();
    assert!(!store.try_acquire_lease("lock", "b", ttl).await.unwrap());

    store.release_lease("lock", "a").await.unwrap();
    assert!(store.try_acquire_lease("lock", "b", ttl).await.unwrap());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_breaker_state_is_shared_through_redis() {
    let (_node, store) = start_redis().await;
    let store: Arc<dyn StateStore> = Arc::new(store);
    let config = CircuitBreakerConfig {
        failure_threshold: 2,
        ..Default::default()
    };
    let first = CircuitBreakerController::new(store.clone(), config.clone());
    let second = CircuitBreakerController::new(store, config);

    first.record_failure("instance:gitlab", t0()).await.unwrap();
    second.record_failure("instance:gitlab", t0()).await.unwrap();

    let view = first
        .snapshot("instance:gitlab", t0() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(view.status, CircuitStatus::Open);
}
