// ============================================================================
// Redis Dedup Store Integration Tests
// ============================================================================
//
// These tests require a Redis instance (local or test container).
//
// Run with: cargo test --test dedup_redis_test -- --ignored
//
// ============================================================================

use herald_shared::delivery_worker::{DedupStore, RedisDedupStore};
use herald_shared::events::UserRegisteredEvent;
use serial_test::serial;
use std::env;
use std::time::Duration;

async fn connect() -> RedisDedupStore {
    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    RedisDedupStore::connect(&redis_url)
        .await
        .expect("Failed to connect to Redis for tests")
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_mark_then_seen() {
    let store = connect().await;
    let key = UserRegisteredEvent::new("redis-test@x.com", "alice")
        .dedup_key()
        .unwrap();

    assert!(!store.is_processed(&key).await.unwrap());
    store
        .mark_processed(&key, Duration::from_secs(60))
        .await
        .unwrap();
    assert!(store.is_processed(&key).await.unwrap());
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_mark_expires_after_ttl() {
    let store = connect().await;
    let key = UserRegisteredEvent::new("redis-ttl@x.com", "alice")
        .dedup_key()
        .unwrap();

    store
        .mark_processed(&key, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(store.is_processed(&key).await.unwrap());

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert!(!store.is_processed(&key).await.unwrap());
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_tokens_are_independent() {
    let store = connect().await;
    let first = UserRegisteredEvent::new("redis-pair@x.com", "alice");
    let second = UserRegisteredEvent::new("redis-pair@x.com", "alice");

    store
        .mark_processed(&first.dedup_key().unwrap(), Duration::from_secs(60))
        .await
        .unwrap();

    assert!(
        !store
            .is_processed(&second.dedup_key().unwrap())
            .await
            .unwrap()
    );
}
