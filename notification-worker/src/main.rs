// ============================================================================
// Notification Worker - welcome email dispatch
// ============================================================================
//
// Hosts CONSUMER_CONCURRENCY members of the notification consumer group.
// Each member owns its own Kafka consumer handle and runs an independent poll
// loop; Kafka spreads the topic's partitions across them, so every partition
// (and therefore every email) is handled by exactly one member at a time.
//
// Per record:
// 1. Decode UserRegistered (poison -> log, commit)
// 2. Dedup check (optional, Redis or in-process)
// 3. Send the welcome message, retrying transient failures with backoff
// 4. Delivered -> commit; undeliverable -> dead-letter topic, then commit
//
// Shutdown (SIGTERM / Ctrl-C):
// - members stop polling, settle their current record, leave the group
// - we wait at most SHUTDOWN_GRACE_SECS, then flush the dead-letter producer
// - exit code is non-zero if any member lost the broker for good or was
//   still running when the grace period ran out
//
// ============================================================================

use anyhow::{Context, Result};
use herald_config::Config;
use herald_shared::broker::RecordProducer;
use herald_shared::delivery_worker::{
    ConsumerHandle, ConsumerSettings, DedupStore, DeliveryExecutor, EventConsumer,
    InMemoryDedupStore, RedisDedupStore, RetryPolicy, TopicDeadLetterSink, drain_members,
};
use herald_shared::health::{HealthState, health_router};
use herald_shared::kafka::{KafkaEventConsumer, KafkaEventProducer};
use herald_shared::notification::{Sender, build_channel};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.rust_log.clone()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("=== Notification Worker Starting ===");
    info!("Kafka Brokers: {}", config.kafka.brokers);
    info!("Kafka Topic: {}", config.kafka.topic);
    info!("Kafka Consumer Group: {}", config.kafka.consumer_group);
    info!("Dead-letter Topic: {}", config.kafka.dead_letter_topic);
    info!("Consumer members: {}", config.delivery.concurrency);
    info!("Notification channel: {:?}", config.channel.kind);

    if !config.kafka.enabled {
        anyhow::bail!("The notification worker requires KAFKA_ENABLED=true");
    }

    let salt = config.logging.hash_salt.clone();

    let channel =
        build_channel(&config.channel, &salt).context("Failed to build notification channel")?;
    let mut executor = DeliveryExecutor::new(
        channel,
        Sender::from_config(&config.channel),
        RetryPolicy::from_config(&config.delivery),
    )
    .with_log_salt(salt.clone());
    if let Some(store) = build_dedup_store(&config).await? {
        executor = executor.with_dedup(store, config.delivery.dedup_ttl());
    }
    let executor = Arc::new(executor);

    let dlq_producer = KafkaEventProducer::new(&config.kafka)
        .context("Failed to initialize Kafka dead-letter producer")?;
    let dead_letters = Arc::new(TopicDeadLetterSink::new(
        Arc::new(dlq_producer.clone()),
        config.kafka.dead_letter_topic.clone(),
        salt.clone(),
    ));

    let health = HealthState::new();
    let shutdown = CancellationToken::new();

    let mut members: Vec<ConsumerHandle> = Vec::with_capacity(config.delivery.concurrency);
    for member in 0..config.delivery.concurrency {
        let consumer = KafkaEventConsumer::new(&config.kafka)
            .with_context(|| format!("Failed to initialize Kafka consumer {}", member))?;
        let handle = EventConsumer::new(
            consumer,
            executor.clone(),
            dead_letters.clone(),
            health.clone(),
            ConsumerSettings::from_config(&config.delivery, member, salt.clone()),
        )
        .start_with(shutdown.child_token());
        members.push(handle);
    }
    info!("Started {} consumer member(s)", members.len());

    let health_server = tokio::spawn(serve_health(
        config.health_port,
        health.clone(),
        shutdown.clone(),
    ));

    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    // A member only finishes on its own after losing the broker for good
    let mut watchdog = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = watchdog.tick() => {
                if members.iter().any(|m| m.is_finished()) {
                    error!("A consumer member stopped unexpectedly, shutting down");
                    shutdown.cancel();
                    break;
                }
            }
        }
    }

    let grace = config.delivery.shutdown_grace();
    info!(grace_secs = grace.as_secs(), "Draining consumer members");
    let mut report = drain_members(members, grace).await;
    if report.unfinished > 0 {
        warn!(
            unfinished = report.unfinished,
            "Shutdown grace period elapsed before all members stopped"
        );
    }

    if let Err(e) = dlq_producer.flush(Duration::from_secs(5)).await {
        warn!(error = %e, "Failed to flush dead-letter producer");
    }

    if let Ok(Err(e)) = health_server.await {
        warn!(error = %e, "Health server stopped with an error");
    }

    let fatal = report.first_error();
    if let Some(e) = &fatal {
        error!(error = %e, "Member failed");
    }
    for result in &report.results {
        match result {
            Ok(stats) => info!(
                delivered = stats.delivered,
                dead_lettered = stats.dead_lettered,
                poison = stats.poison,
                left_uncommitted = stats.left_uncommitted,
                "Member finished"
            ),
            Err(e) => error!(error = %e, "Member failed"),
        }
    }

    info!("=== Notification Worker Stopped ===");
    if let Some(e) = fatal {
        return Err(e.into());
    }
    if report.unfinished > 0 {
        anyhow::bail!(
            "{} consumer member(s) did not stop within {}s",
            report.unfinished,
            grace.as_secs()
        );
    }
    Ok(())
}

async fn build_dedup_store(config: &Config) -> Result<Option<Arc<dyn DedupStore>>> {
    if !config.delivery.dedup_enabled {
        return Ok(None);
    }
    match &config.delivery.redis_url {
        Some(url) => {
            let store = RedisDedupStore::connect(url)
                .await
                .context("Failed to connect dedup store to Redis")?;
            info!("Deduplication enabled (Redis)");
            Ok(Some(Arc::new(store)))
        }
        None => {
            warn!("Deduplication enabled without REDIS_URL, using an in-process store");
            Ok(Some(Arc::new(InMemoryDedupStore::new())))
        }
    }
}

async fn serve_health(port: u16, health: HealthState, shutdown: CancellationToken) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind health server on {}", addr))?;
    info!("Health endpoint listening on {}", addr);

    axum::serve(listener, health_router(health))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("Health server failed")
}

async fn shutdown_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, initiating graceful shutdown...");
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("SIGINT received, initiating graceful shutdown...");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler, waiting for Ctrl-C only");
                tokio::signal::ctrl_c().await.ok();
                info!("SIGINT received, initiating graceful shutdown...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, initiating graceful shutdown...");
    }
    shutdown.cancel();
}
