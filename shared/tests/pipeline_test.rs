// ============================================================================
// Pipeline Integration Tests
// ============================================================================
//
// Registration -> publisher -> broker -> consumer member(s) -> executor ->
// channel, over the in-process broker. No external services needed.
//
// ============================================================================


use herald_shared::delivery_worker::{FailureKind, InMemoryDedupStore};
use herald_shared::events::{USER_REGISTERED_TOPIC, UserRegisteredEvent};
use herald_shared::health::HealthStatus;
use herald_shared::notification::ChannelError;
use herald_shared::registration::{InMemoryAccountStore, RegisterRequest, RegistrationService};
use std::sync::Arc;
use std::time::Duration;
use test_utils::{Pipeline, fixed_backoff, wait_until};
use tokio_util::sync::CancellationToken;

fn unavailable() -> ChannelError {
    ChannelError::Unavailable { status: 503 }
}

#[tokio::test]
async fn test_registration_leads_to_welcome_delivery() {
    let pipeline = Pipeline::new(2);
    let handle = pipeline.start_member();

    let service = RegistrationService::new(
        Arc::new(InMemoryAccountStore::new()),
        pipeline.publisher(),
        "test-salt",
    )
    .unwrap();
    service
        .register(RegisterRequest {
            username: "alice".to_string(),
            email: "a@x.com".to_string(),
            password: "correct horse battery".to_string(),
        })
        .await
        .unwrap();

    wait_until("welcome delivery", || {
        pipeline.channel.calls_to("a@x.com").len() == 1
    })
    .await;
    let message = &pipeline.channel.calls_to("a@x.com")[0];
    assert_eq!(message.recipient_name, "alice");
    assert_eq!(message.subject, "Welcome to Our App!");
    assert!(message.html_body.contains("Dear alice,"));

    wait_until("commit", || pipeline.fully_committed()).await;
    assert_eq!(pipeline.health.status(), HealthStatus::Ready);

    handle.request_shutdown();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_committed_record_is_not_redelivered_after_restart() {
    let pipeline = Pipeline::new(1);
    let publisher = pipeline.publisher();
    publisher
        .publish("a@x.com", &UserRegisteredEvent::new("a@x.com", "alice"))
        .await
        .unwrap();

    let first = pipeline.start_member();
    wait_until("commit", || pipeline.committed(0) == Some(1)).await;
    first.request_shutdown();
    let stats = first.join().await.unwrap();
    assert_eq!(stats.delivered, 1);

    let second = pipeline.start_member();
    tokio::time::sleep(Duration::from_millis(150)).await;
    second.request_shutdown();
    let stats = second.join().await.unwrap();

    assert_eq!(stats.delivered, 0);
    assert_eq!(pipeline.channel.calls_to("a@x.com").len(), 1);
}

#[tokio::test]
async fn test_same_key_is_delivered_in_publish_order() {
    let pipeline = Pipeline::new(4);
    let first = pipeline.start_member();
    let second = pipeline.start_member();
    wait_until("both members joined", || {
        pipeline
            .broker
            .member_count(test_utils::GROUP, USER_REGISTERED_TOPIC)
            == 2
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let publisher = pipeline.publisher();
    for i in 0..10 {
        publisher
            .publish(
                "a@x.com",
                &UserRegisteredEvent::new("a@x.com", format!("user-{}", i)),
            )
            .await
            .unwrap();
        let other = format!("b{}@x.com", i);
        publisher
            .publish(&other, &UserRegisteredEvent::new(other.clone(), "bob"))
            .await
            .unwrap();
    }

    wait_until("all committed", || pipeline.fully_committed()).await;

    let order: Vec<String> = pipeline
        .channel
        .calls_to("a@x.com")
        .into_iter()
        .map(|message| message.recipient_name)
        .collect();
    let expected: Vec<String> = (0..10).map(|i| format!("user-{}", i)).collect();
    assert_eq!(order, expected);

    first.request_shutdown();
    second.request_shutdown();
    first.join().await.unwrap();
    second.join().await.unwrap();
}

#[tokio::test]
async fn test_poison_record_does_not_block_partition() {
    let pipeline = Pipeline::new(1);
    pipeline
        .broker
        .append(USER_REGISTERED_TOPIC, Some("a@x.com"), b"\x00\x01 not an event");
    pipeline.broker.append(
        USER_REGISTERED_TOPIC,
        Some("a@x.com"),
        br#"{"email":"a@x.com"}"#,
    );
    pipeline
        .publisher()
        .publish("a@x.com", &UserRegisteredEvent::new("a@x.com", "alice"))
        .await
        .unwrap();

    let handle = pipeline.start_member();
    wait_until("commit past poison", || pipeline.committed(0) == Some(3)).await;
    handle.request_shutdown();
    let stats = handle.join().await.unwrap();

    assert_eq!(stats.poison, 2);
    assert_eq!(stats.delivered, 1);
    assert_eq!(pipeline.channel.calls().len(), 1);
    assert!(pipeline.dead_letters().is_empty());
}

#[tokio::test]
async fn test_transient_failures_exhaust_retries_then_dead_letter_once() {
    let pipeline = Pipeline::new(1);
    pipeline
        .channel
        .fail_next("a@x.com", vec![unavailable(), unavailable(), unavailable()]);
    pipeline
        .publisher()
        .publish("a@x.com", &UserRegisteredEvent::new("a@x.com", "alice"))
        .await
        .unwrap();

    let handle = pipeline.start_member();
    wait_until("commit", || pipeline.committed(0) == Some(1)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.request_shutdown();
    let stats = handle.join().await.unwrap();

    assert_eq!(pipeline.channel.calls_to("a@x.com").len(), 3);
    let dead_letters = pipeline.dead_letters();
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].event.email, "a@x.com");
    assert_eq!(dead_letters[0].failure_kind, FailureKind::RetriesExhausted);
    assert_eq!(dead_letters[0].attempts, 3);
    assert_eq!(dead_letters[0].source_offset, 0);
    assert_eq!(stats.dead_lettered, 1);
}

#[tokio::test]
async fn test_transient_failure_recovers_before_max_attempts() {
    let pipeline = Pipeline::new(1);
    pipeline
        .channel
        .fail_next("a@x.com", vec![ChannelError::Timeout(Duration::from_secs(10))]);
    pipeline
        .publisher()
        .publish("a@x.com", &UserRegisteredEvent::new("a@x.com", "alice"))
        .await
        .unwrap();

    let handle = pipeline.start_member();
    wait_until("commit", || pipeline.committed(0) == Some(1)).await;
    handle.request_shutdown();
    let stats = handle.join().await.unwrap();

    assert_eq!(pipeline.channel.calls_to("a@x.com").len(), 2);
    assert_eq!(stats.delivered, 1);
    assert!(pipeline.dead_letters().is_empty());
}

#[tokio::test]
async fn test_permanent_failure_is_dead_lettered_without_retry() {
    let pipeline = Pipeline::new(1);
    pipeline.channel.fail_next(
        "a@x.com",
        vec![ChannelError::InvalidRecipient("mailbox does not exist".to_string())],
    );
    pipeline
        .publisher()
        .publish("a@x.com", &UserRegisteredEvent::new("a@x.com", "alice"))
        .await
        .unwrap();
    pipeline
        .publisher()
        .publish("b@x.com", &UserRegisteredEvent::new("b@x.com", "bob"))
        .await
        .unwrap();

    let handle = pipeline.start_member();
    wait_until("commit", || pipeline.committed(0) == Some(2)).await;
    handle.request_shutdown();
    handle.join().await.unwrap();

    assert_eq!(pipeline.channel.calls_to("a@x.com").len(), 1);
    assert_eq!(pipeline.channel.calls_to("b@x.com").len(), 1);
    let dead_letters = pipeline.dead_letters();
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].failure_kind, FailureKind::Permanent);
    assert_eq!(dead_letters[0].attempts, 1);
}

#[tokio::test]
async fn test_duplicate_delivery_is_tolerated() {
    let pipeline = Pipeline::new(1);
    let event = UserRegisteredEvent::new("a@x.com", "alice");
    let publisher = pipeline.publisher();
    publisher.publish("a@x.com", &event).await.unwrap();
    publisher.publish("a@x.com", &event).await.unwrap();

    let handle = pipeline.start_member();
    wait_until("commit", || pipeline.committed(0) == Some(2)).await;
    handle.request_shutdown();
    let stats = handle.join().await.unwrap();

    assert_eq!(stats.delivered, 2);
    assert_eq!(pipeline.channel.calls_to("a@x.com").len(), 2);
    assert_eq!(pipeline.health.status(), HealthStatus::Ready);
}

#[tokio::test]
async fn test_dedup_store_suppresses_redelivered_event() {
    let pipeline = Pipeline::new(1).with_dedup(Arc::new(InMemoryDedupStore::new()));
    let event = UserRegisteredEvent::new("a@x.com", "alice");
    let publisher = pipeline.publisher();
    publisher.publish("a@x.com", &event).await.unwrap();
    publisher.publish("a@x.com", &event).await.unwrap();
    // a new registration attempt carries a new token and is delivered
    publisher
        .publish("a@x.com", &UserRegisteredEvent::new("a@x.com", "alice"))
        .await
        .unwrap();

    let handle = pipeline.start_member();
    wait_until("commit", || pipeline.committed(0) == Some(3)).await;
    handle.request_shutdown();
    let stats = handle.join().await.unwrap();

    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.duplicates_skipped, 1);
    assert_eq!(pipeline.channel.calls_to("a@x.com").len(), 2);
}

#[tokio::test]
async fn test_shutdown_mid_send_finishes_and_commits() {
    let pipeline = Pipeline::new(1);
    pipeline.channel.set_send_delay(Duration::from_millis(200));
    pipeline
        .publisher()
        .publish("a@x.com", &UserRegisteredEvent::new("a@x.com", "alice"))
        .await
        .unwrap();

    let handle = pipeline.start_member();
    wait_until("send in flight", || pipeline.channel.in_flight() == 1).await;
    handle.request_shutdown();
    let stats = handle.join().await.unwrap();

    assert_eq!(stats.delivered, 1);
    assert_eq!(pipeline.committed(0), Some(1));
}

#[tokio::test]
async fn test_shutdown_during_retry_backoff_leaves_record_for_redelivery() {
    let mut pipeline = Pipeline::new(1)
        .with_delivery_policy(fixed_backoff(5, Duration::from_secs(30)));
    pipeline.channel.fail_next("a@x.com", vec![unavailable()]);
    pipeline
        .publisher()
        .publish("a@x.com", &UserRegisteredEvent::new("a@x.com", "alice"))
        .await
        .unwrap();

    let handle = pipeline.start_member();
    wait_until("first attempt", || pipeline.channel.calls().len() == 1).await;
    handle.request_shutdown();
    let stats = tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("shutdown should not wait out the backoff")
        .unwrap();

    assert_eq!(stats.left_uncommitted, 1);
    assert_eq!(pipeline.committed(0), None);
    assert!(pipeline.dead_letters().is_empty());

    // the next member picks the record up again
    pipeline.delivery_policy = fixed_backoff(3, Duration::from_millis(5));
    let restarted = pipeline.start_member();
    wait_until("redelivery commit", || pipeline.committed(0) == Some(1)).await;
    restarted.request_shutdown();
    restarted.join().await.unwrap();

    assert_eq!(pipeline.channel.calls_to("a@x.com").len(), 2);
}

#[tokio::test]
async fn test_members_share_partitions_and_deliver_everything() {
    let pipeline = Pipeline::new(4);
    let shutdown = CancellationToken::new();
    let handles: Vec<_> = (0..3)
        .map(|_| pipeline.member().start_with(shutdown.child_token()))
        .collect();

    let publisher = pipeline.publisher();
    for i in 0..30 {
        let email = format!("user{}@x.com", i);
        publisher
            .publish(&email, &UserRegisteredEvent::new(email.clone(), format!("user{}", i)))
            .await
            .unwrap();
    }

    wait_until("all committed", || pipeline.fully_committed()).await;
    for i in 0..30 {
        assert!(
            !pipeline
                .channel
                .calls_to(&format!("user{}@x.com", i))
                .is_empty()
        );
    }

    shutdown.cancel();
    let mut delivered = 0;
    for handle in handles {
        delivered += handle.join().await.unwrap().delivered;
    }
    assert!(delivered >= 30);
    assert_eq!(
        pipeline
            .broker
            .member_count(test_utils::GROUP, USER_REGISTERED_TOPIC),
        0
    );
    assert!(pipeline.dead_letters().is_empty());
}
