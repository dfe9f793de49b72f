// ============================================================================
// Event Consumer
// ============================================================================
//
// One consumer-group member: a long-running poll loop that owns its broker
// handle exclusively.
//
//   Stopped -> Subscribing -> Polling <-> Dispatching -> Committing -> Polling
//                                 ...  -> Draining -> Stopped
//
// Commit rules (the offset only moves once a record has a defined outcome):
// - Delivered (or skipped as duplicate)       -> commit
// - Permanent failure / retries exhausted     -> dead-letter, then commit
// - Poison (payload cannot be decoded)        -> log, commit, no dead-letter
// - Shutdown interrupted retry or DLQ write   -> no commit, redelivered later
//
// Broker errors never end the loop on their own: the member backs off and
// re-subscribes. Only `reconnect_max_failures` consecutive failures mark the
// shared health state Failed and return `ConsumerError`.
//
// ============================================================================

use futures_util::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dlq::{DeadLetterRecord, DeadLetterSink, FailureKind};
use super::processor::{DeliveryExecutor, DeliveryOutcome};
use super::retry::{RetryPolicy, sleep_or_cancel};
use crate::broker::{BrokerError, ConsumedRecord, RecordConsumer};
use crate::events::UserRegisteredEvent;
use crate::health::{HealthState, HealthStatus};
use crate::metrics;
use crate::utils::log_safe_id;
use herald_config::DeliveryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Subscribing,
    Polling,
    Dispatching,
    Committing,
    Draining,
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("broker unreachable after {failures} consecutive failures: {last_error}")]
    BrokerConnectionLost {
        failures: u32,
        last_error: BrokerError,
    },

    #[error("consumer task failed: {0}")]
    TaskFailed(String),
}

/// Per-member counters, logged periodically and returned on exit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub delivered: u64,
    pub duplicates_skipped: u64,
    pub dead_lettered: u64,
    pub poison: u64,
    pub left_uncommitted: u64,
    pub commit_failures: u64,
    pub reconnects: u64,
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Label used in logs when one process hosts several members
    pub member: usize,
    pub poll_timeout: Duration,
    pub reconnect_max_failures: u32,
    /// Backoff for re-subscribing and for dead-letter write retries
    pub backoff: RetryPolicy,
    pub stats_interval: Duration,
    pub log_salt: String,
}

impl ConsumerSettings {
    pub fn from_config(config: &DeliveryConfig, member: usize, log_salt: impl Into<String>) -> Self {
        Self {
            member,
            poll_timeout: config.poll_timeout(),
            reconnect_max_failures: config.reconnect_max_failures,
            backoff: RetryPolicy::from_config(config),
            stats_interval: Duration::from_secs(30),
            log_salt: log_salt.into(),
        }
    }
}

pub struct EventConsumer<C: RecordConsumer> {
    consumer: C,
    executor: Arc<DeliveryExecutor>,
    dead_letters: Arc<dyn DeadLetterSink>,
    health: HealthState,
    settings: ConsumerSettings,
    stats: ConsumerStats,
    state: watch::Sender<ConsumerState>,
}

/// Lifecycle handle returned by [`EventConsumer::start`]
pub struct ConsumerHandle {
    cancel: CancellationToken,
    state: watch::Receiver<ConsumerState>,
    task: JoinHandle<Result<ConsumerStats, ConsumerError>>,
}

impl ConsumerHandle {
    /// Ask the member to finish its current record, release its partitions and stop
    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<ConsumerStats, ConsumerError> {
        self.task
            .await
            .map_err(|e| ConsumerError::TaskFailed(e.to_string()))?
    }
}

/// What [`drain_members`] collected before the grace period ran out
#[derive(Debug, Default)]
pub struct DrainReport {
    /// One entry per member that stopped, in handle order
    pub results: Vec<Result<ConsumerStats, ConsumerError>>,
    /// Members still running at the deadline
    pub unfinished: usize,
}

impl DrainReport {
    /// First member error, if any member failed
    pub fn first_error(&mut self) -> Option<ConsumerError> {
        let index = self.results.iter().position(Result::is_err)?;
        self.results.remove(index).err()
    }
}

/// Join `members` within one shared `grace` deadline
///
/// Members that already stopped are always collected, even after the
/// deadline has passed; members still running at the deadline are counted in
/// `unfinished` and left detached.
pub async fn drain_members(members: Vec<ConsumerHandle>, grace: Duration) -> DrainReport {
    let deadline = tokio::time::Instant::now() + grace;
    let joined = join_all(
        members
            .into_iter()
            .map(|member| tokio::time::timeout_at(deadline, member.join())),
    )
    .await;

    let mut report = DrainReport::default();
    for outcome in joined {
        match outcome {
            Ok(result) => report.results.push(result),
            Err(_) => report.unfinished += 1,
        }
    }
    report
}

impl<C: RecordConsumer + 'static> EventConsumer<C> {
    pub fn new(
        consumer: C,
        executor: Arc<DeliveryExecutor>,
        dead_letters: Arc<dyn DeadLetterSink>,
        health: HealthState,
        settings: ConsumerSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Stopped);
        Self {
            consumer,
            executor,
            dead_letters,
            health,
            settings,
            stats: ConsumerStats::default(),
            state,
        }
    }

    /// Spawn the poll loop on the runtime
    pub fn start(self) -> ConsumerHandle {
        self.start_with(CancellationToken::new())
    }

    /// Spawn the poll loop, stopping when `cancel` (or the handle) requests it
    pub fn start_with(self, cancel: CancellationToken) -> ConsumerHandle {
        let state = self.state.subscribe();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(self.run(task_cancel));
        ConsumerHandle {
            cancel,
            state,
            task,
        }
    }

    /// Run until cancelled or the broker is lost for good
    pub async fn run(mut self, cancel: CancellationToken) -> Result<ConsumerStats, ConsumerError> {
        info!(member = self.settings.member, "Event consumer starting");

        let result = self.poll_loop(&cancel).await;

        self.set_state(ConsumerState::Draining);
        if let Err(e) = self.consumer.close().await {
            warn!(member = self.settings.member, error = %e, "Failed to leave consumer group cleanly");
        }
        self.set_state(ConsumerState::Stopped);
        self.log_stats("Event consumer stopped");

        result.map(|()| self.stats)
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    fn log_stats(&self, message: &'static str) {
        info!(
            member = self.settings.member,
            delivered = self.stats.delivered,
            duplicates_skipped = self.stats.duplicates_skipped,
            dead_lettered = self.stats.dead_lettered,
            poison = self.stats.poison,
            left_uncommitted = self.stats.left_uncommitted,
            commit_failures = self.stats.commit_failures,
            reconnects = self.stats.reconnects,
            "{}",
            message
        );
    }

    async fn poll_loop(&mut self, cancel: &CancellationToken) -> Result<(), ConsumerError> {
        let mut subscribed = false;
        let mut failures: u32 = 0;
        let mut last_stats_log = Instant::now();

        while !cancel.is_cancelled() {
            if !subscribed {
                self.set_state(ConsumerState::Subscribing);
                match self.consumer.subscribe().await {
                    Ok(()) => {
                        if failures > 0 {
                            self.stats.reconnects += 1;
                            metrics::BROKER_RECONNECTS_TOTAL.inc();
                            info!(member = self.settings.member, "Re-subscribed after broker failure");
                        }
                        subscribed = true;
                    }
                    Err(e) => {
                        failures += 1;
                        self.broker_failure(e, failures, cancel).await?;
                        continue;
                    }
                }
            }

            self.set_state(ConsumerState::Polling);
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                polled = self.consumer.poll(self.settings.poll_timeout) => polled,
            };

            match polled {
                Ok(record) => {
                    if failures > 0 || self.health.status() == HealthStatus::Starting {
                        failures = 0;
                        self.health.set_ready();
                    }
                    if let Some(record) = record {
                        self.handle_record(record, cancel).await;
                    }
                }
                Err(e) => {
                    failures += 1;
                    if e.is_connection_loss() {
                        subscribed = false;
                    }
                    self.broker_failure(e, failures, cancel).await?;
                }
            }

            if last_stats_log.elapsed() >= self.settings.stats_interval {
                self.log_stats("Event consumer stats");
                last_stats_log = Instant::now();
            }
        }

        Ok(())
    }

    async fn broker_failure(
        &mut self,
        err: BrokerError,
        failures: u32,
        cancel: &CancellationToken,
    ) -> Result<(), ConsumerError> {
        if failures > self.settings.reconnect_max_failures {
            self.health.set_failed();
            error!(
                member = self.settings.member,
                failures = failures,
                error = %err,
                "Broker connection lost, giving up"
            );
            return Err(ConsumerError::BrokerConnectionLost {
                failures,
                last_error: err,
            });
        }

        self.health.set_degraded();
        let delay = self.settings.backoff.backoff(failures);
        warn!(
            member = self.settings.member,
            failures = failures,
            max_failures = self.settings.reconnect_max_failures,
            retry_in_ms = delay.as_millis() as u64,
            error = %err,
            "Broker error, backing off"
        );
        sleep_or_cancel(delay, cancel).await;
        Ok(())
    }

    async fn handle_record(&mut self, record: ConsumedRecord, cancel: &CancellationToken) {
        metrics::EVENTS_CONSUMED_TOTAL.inc();
        self.set_state(ConsumerState::Dispatching);

        let event = match UserRegisteredEvent::from_payload(record.payload()) {
            Ok(event) => event,
            Err(e) => {
                metrics::POISON_RECORDS_TOTAL.inc();
                self.stats.poison += 1;
                warn!(
                    member = self.settings.member,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Poison record skipped"
                );
                self.commit(&record).await;
                return;
            }
        };

        let report = self.executor.deliver(&event, cancel).await;
        if report.interrupted {
            self.stats.left_uncommitted += 1;
            return;
        }

        match report.outcome {
            DeliveryOutcome::Delivered => {
                if report.skipped_duplicate {
                    self.stats.duplicates_skipped += 1;
                } else {
                    self.stats.delivered += 1;
                }
                self.commit(&record).await;
            }
            DeliveryOutcome::TransientFailure(err) => {
                let dead_letter = DeadLetterRecord::new(
                    event,
                    &record,
                    report.attempts,
                    FailureKind::RetriesExhausted,
                    err.to_string(),
                );
                self.dead_letter_then_commit(dead_letter, &record, cancel)
                    .await;
            }
            DeliveryOutcome::PermanentFailure(err) => {
                let dead_letter = DeadLetterRecord::new(
                    event,
                    &record,
                    report.attempts,
                    FailureKind::Permanent,
                    err.to_string(),
                );
                self.dead_letter_then_commit(dead_letter, &record, cancel)
                    .await;
            }
        }
    }

    async fn dead_letter_then_commit(
        &mut self,
        dead_letter: DeadLetterRecord,
        record: &ConsumedRecord,
        cancel: &CancellationToken,
    ) {
        let mut attempt = 1;
        loop {
            match self.dead_letters.write(&dead_letter).await {
                Ok(_) => {
                    metrics::DEAD_LETTERED_TOTAL
                        .with_label_values(&[dead_letter.failure_kind.as_str()])
                        .inc();
                    self.stats.dead_lettered += 1;
                    self.commit(record).await;
                    return;
                }
                Err(e) => {
                    let delay = self.settings.backoff.backoff(attempt);
                    error!(
                        member = self.settings.member,
                        user_hash = %log_safe_id(&dead_letter.event.email, &self.settings.log_salt),
                        partition = record.partition,
                        offset = record.offset,
                        attempt = attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Dead-letter write failed, offset NOT committed"
                    );
                    if !sleep_or_cancel(delay, cancel).await {
                        self.stats.left_uncommitted += 1;
                        return;
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn commit(&mut self, record: &ConsumedRecord) {
        self.set_state(ConsumerState::Committing);
        match self.consumer.commit(record).await {
            Ok(()) => debug!(
                member = self.settings.member,
                partition = record.partition,
                offset = record.offset,
                "Offset committed"
            ),
            Err(e) => {
                // A later commit on the partition covers this one; after a
                // revocation the new owner re-reads the record instead
                metrics::COMMIT_FAILURES_TOTAL.inc();
                self.stats.commit_failures += 1;
                warn!(
                    member = self.settings.member,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Offset commit failed"
                );
            }
        }
    }
}
