// ============================================================================
// In-Memory Broker
// ============================================================================
//
// A partitioned, append-only log with consumer groups, kept in process.
// Used by the integration tests and for running the pipeline without Kafka.
//
// - Records are routed to a partition by hashing the key (same key, same
//   partition, so per-key order holds).
// - Each (group, topic, partition) has a committed offset; a new member of
//   the group starts from it, or from the reset policy when there is none.
// - Partitions are assigned round-robin over the current group members and
//   the assignment is recomputed on every poll, so members joining or
//   leaving behave like a rebalance at a poll boundary.
//
// ============================================================================

use super::{BrokerError, ConsumedRecord, DeliveryReceipt, RecordConsumer, RecordProducer};
use async_trait::async_trait;
use herald_config::OffsetReset;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const POLL_TICK: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
}

#[derive(Debug)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    /// (group, topic, partition) -> next offset to read
    committed: HashMap<(String, String, i32), i64>,
    /// (group, topic) -> member ids
    members: HashMap<(String, String), BTreeSet<u64>>,
    next_member_id: u64,
    available: bool,
    failing_sends: u32,
    send_delay: Duration,
}

/// Shared handle to one in-process broker
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    partitions: usize,
}

impl InMemoryBroker {
    /// Create a broker whose topics all have `partitions` partitions
    pub fn new(partitions: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                topics: HashMap::new(),
                committed: HashMap::new(),
                members: HashMap::new(),
                next_member_id: 0,
                available: true,
                failing_sends: 0,
                send_delay: Duration::ZERO,
            })),
            partitions: partitions.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn producer(&self) -> InMemoryProducer {
        InMemoryProducer {
            broker: self.clone(),
        }
    }

    /// A new (not yet subscribed) member of `group` reading `topic`
    pub fn consumer(
        &self,
        group: impl Into<String>,
        topic: impl Into<String>,
        reset: OffsetReset,
    ) -> InMemoryConsumer {
        InMemoryConsumer {
            broker: self.clone(),
            group: group.into(),
            topic: topic.into(),
            reset,
            member_id: None,
            positions: HashMap::new(),
            next_partition: 0,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions
    }

    /// Partition a key is routed to
    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as i32
    }

    /// Append a raw record, bypassing availability checks
    ///
    /// Records without a key go to partition 0.
    pub fn append(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> DeliveryReceipt {
        let partition = key.map(|k| self.partition_for(k)).unwrap_or(0);
        let mut state = self.lock();
        Self::append_locked(&mut state, self.partitions, topic, partition, key, payload)
    }

    fn append_locked(
        state: &mut BrokerState,
        partitions: usize,
        topic: &str,
        partition: i32,
        key: Option<&str>,
        payload: &[u8],
    ) -> DeliveryReceipt {
        let log = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions]);
        let records = &mut log[partition as usize];
        records.push(StoredRecord {
            key: key.map(|k| k.as_bytes().to_vec()),
            payload: Some(payload.to_vec()),
        });

        DeliveryReceipt {
            partition,
            offset: records.len() as i64 - 1,
        }
    }

    /// Every record of `topic`, partition by partition in offset order
    pub fn records(&self, topic: &str) -> Vec<ConsumedRecord> {
        let state = self.lock();
        let Some(log) = state.topics.get(topic) else {
            return Vec::new();
        };

        log.iter()
            .enumerate()
            .flat_map(|(partition, records)| {
                records
                    .iter()
                    .enumerate()
                    .map(move |(offset, record)| ConsumedRecord {
                        topic: topic.to_string(),
                        partition: partition as i32,
                        offset: offset as i64,
                        key: record.key.clone(),
                        payload: record.payload.clone(),
                    })
            })
            .collect()
    }

    /// Next offset `group` will read on `partition`, if it ever committed
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    pub fn member_count(&self, group: &str, topic: &str) -> usize {
        self.lock()
            .members
            .get(&(group.to_string(), topic.to_string()))
            .map(BTreeSet::len)
            .unwrap_or(0)
    }

    /// Simulate the broker going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Reject the next `count` produce calls
    pub fn fail_next_sends(&self, count: u32) {
        self.lock().failing_sends = count;
    }

    /// Delay every produce acknowledgment
    pub fn set_send_delay(&self, delay: Duration) {
        self.lock().send_delay = delay;
    }

    fn leave_group(&self, group: &str, topic: &str, member_id: u64) {
        let mut state = self.lock();
        if let Some(members) = state.members.get_mut(&(group.to_string(), topic.to_string())) {
            members.remove(&member_id);
        }
    }
}

/// Producer handle for an [`InMemoryBroker`]
#[derive(Debug, Clone)]
pub struct InMemoryProducer {
    broker: InMemoryBroker,
}

#[async_trait]
impl RecordProducer for InMemoryProducer {
    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<DeliveryReceipt, BrokerError> {
        let delay = self.broker.lock().send_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let partition = self.broker.partition_for(key);
        let mut state = self.broker.lock();
        if !state.available {
            return Err(BrokerError::Unavailable("in-memory broker is down".to_string()));
        }
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(BrokerError::Rejected("injected send failure".to_string()));
        }

        Ok(InMemoryBroker::append_locked(
            &mut state,
            self.broker.partitions,
            topic,
            partition,
            Some(key),
            payload,
        ))
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// One consumer-group member of an [`InMemoryBroker`]
#[derive(Debug)]
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    group: String,
    topic: String,
    reset: OffsetReset,
    member_id: Option<u64>,
    /// Fetch position per currently assigned partition
    positions: HashMap<i32, i64>,
    next_partition: usize,
}

impl InMemoryConsumer {
    /// Partitions currently assigned to this member
    pub fn assignment(&self) -> Vec<i32> {
        let state = self.broker.lock();
        self.assigned_partitions(&state)
    }

    fn assigned_partitions(&self, state: &BrokerState) -> Vec<i32> {
        let Some(member_id) = self.member_id else {
            return Vec::new();
        };
        let Some(members) = state
            .members
            .get(&(self.group.clone(), self.topic.clone()))
        else {
            return Vec::new();
        };
        let Some(index) = members.iter().position(|id| *id == member_id) else {
            return Vec::new();
        };

        (0..self.broker.partitions)
            .filter(|p| p % members.len() == index)
            .map(|p| p as i32)
            .collect()
    }

    fn try_fetch(&mut self) -> Result<Option<ConsumedRecord>, BrokerError> {
        let broker = self.broker.clone();
        let state = broker.lock();
        if !state.available {
            return Err(BrokerError::Unavailable("in-memory broker is down".to_string()));
        }
        if self.member_id.is_none() {
            return Err(BrokerError::NotSubscribed);
        }

        let assigned = self.assigned_partitions(&state);

        // Revoked partitions lose their fetch position
        self.positions.retain(|p, _| assigned.contains(p));

        let log = state.topics.get(&self.topic);
        for partition in &assigned {
            if self.positions.contains_key(partition) {
                continue;
            }
            let committed = state
                .committed
                .get(&(self.group.clone(), self.topic.clone(), *partition))
                .copied();
            let start = committed.unwrap_or_else(|| match self.reset {
                OffsetReset::Earliest => 0,
                OffsetReset::Latest => log
                    .map(|l| l[*partition as usize].len() as i64)
                    .unwrap_or(0),
            });
            self.positions.insert(*partition, start);
        }

        let Some(log) = log else {
            return Ok(None);
        };

        for step in 0..assigned.len() {
            let slot = (self.next_partition + step) % assigned.len();
            let partition = assigned[slot];
            let position = self.positions.get(&partition).copied().unwrap_or(0);
            let records = &log[partition as usize];

            if let Some(record) = records.get(position as usize) {
                self.positions.insert(partition, position + 1);
                self.next_partition = slot + 1;
                return Ok(Some(ConsumedRecord {
                    topic: self.topic.clone(),
                    partition,
                    offset: position,
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                }));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl RecordConsumer for InMemoryConsumer {
    async fn subscribe(&mut self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        if !state.available {
            return Err(BrokerError::Unavailable("in-memory broker is down".to_string()));
        }
        if self.member_id.is_none() {
            let id = state.next_member_id;
            state.next_member_id += 1;
            state
                .members
                .entry((self.group.clone(), self.topic.clone()))
                .or_default()
                .insert(id);
            self.member_id = Some(id);
        }
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedRecord>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(record) = self.try_fetch()? {
                return Ok(Some(record));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_TICK.min(deadline - now)).await;
        }
    }

    async fn commit(&mut self, record: &ConsumedRecord) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        if !state.available {
            return Err(BrokerError::Commit("in-memory broker is down".to_string()));
        }
        if !self.assigned_partitions(&state).contains(&record.partition) {
            return Err(BrokerError::Commit(format!(
                "partition {} is no longer assigned to this member",
                record.partition
            )));
        }
        // A late commit for an older record never rewinds the group
        let committed = state
            .committed
            .entry((self.group.clone(), record.topic.clone(), record.partition))
            .or_insert(record.offset + 1);
        *committed = (*committed).max(record.offset + 1);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if let Some(member_id) = self.member_id.take() {
            self.broker.leave_group(&self.group, &self.topic, member_id);
        }
        self.positions.clear();
        Ok(())
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        if let Some(member_id) = self.member_id.take() {
            self.broker.leave_group(&self.group, &self.topic, member_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "user-registered";

    #[test]
    fn test_same_key_same_partition() {
        let broker = InMemoryBroker::new(8);
        let first = broker.append(TOPIC, Some("a@x.com"), b"1");
        let second = broker.append(TOPIC, Some("a@x.com"), b"2");

        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);
    }

    #[tokio::test]
    async fn test_poll_then_commit_advances_group_offset() {
        let broker = InMemoryBroker::new(1);
        broker.append(TOPIC, Some("a@x.com"), b"first");

        let mut consumer = broker.consumer("g", TOPIC, OffsetReset::Earliest);
        consumer.subscribe().await.unwrap();

        let record = consumer
            .poll(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.payload(), b"first");
        assert_eq!(broker.committed_offset("g", TOPIC, 0), None);

        consumer.commit(&record).await.unwrap();
        assert_eq!(broker.committed_offset("g", TOPIC, 0), Some(1));
    }

    #[tokio::test]
    async fn test_out_of_order_commit_does_not_rewind_offset() {
        let broker = InMemoryBroker::new(1);
        broker.append(TOPIC, Some("a@x.com"), b"first");
        broker.append(TOPIC, Some("a@x.com"), b"second");

        let mut consumer = broker.consumer("g", TOPIC, OffsetReset::Earliest);
        consumer.subscribe().await.unwrap();
        let first = consumer.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        let second = consumer.poll(Duration::from_millis(50)).await.unwrap().unwrap();

        consumer.commit(&second).await.unwrap();
        consumer.commit(&first).await.unwrap();

        assert_eq!(broker.committed_offset("g", TOPIC, 0), Some(2));
    }

    #[tokio::test]
    async fn test_uncommitted_record_is_redelivered_to_next_member() {
        let broker = InMemoryBroker::new(1);
        broker.append(TOPIC, Some("a@x.com"), b"first");

        {
            let mut consumer = broker.consumer("g", TOPIC, OffsetReset::Earliest);
            consumer.subscribe().await.unwrap();
            let record = consumer.poll(Duration::from_millis(50)).await.unwrap();
            assert!(record.is_some());
            // dropped without commit (crash)
        }

        let mut consumer = broker.consumer("g", TOPIC, OffsetReset::Earliest);
        consumer.subscribe().await.unwrap();
        let record = consumer
            .poll(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.offset, 0);
    }

    #[tokio::test]
    async fn test_groups_read_independently() {
        let broker = InMemoryBroker::new(1);
        broker.append(TOPIC, Some("a@x.com"), b"first");

        let mut email = broker.consumer("email", TOPIC, OffsetReset::Earliest);
        let mut audit = broker.consumer("audit", TOPIC, OffsetReset::Earliest);
        email.subscribe().await.unwrap();
        audit.subscribe().await.unwrap();

        let record = email.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        email.commit(&record).await.unwrap();

        let record = audit.poll(Duration::from_millis(50)).await.unwrap();
        assert!(record.is_some());
    }

    #[tokio::test]
    async fn test_latest_reset_skips_existing_records() {
        let broker = InMemoryBroker::new(1);
        broker.append(TOPIC, Some("a@x.com"), b"old");

        let mut consumer = broker.consumer("g", TOPIC, OffsetReset::Latest);
        consumer.subscribe().await.unwrap();
        assert!(consumer
            .poll(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());

        broker.append(TOPIC, Some("a@x.com"), b"new");
        let record = consumer.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(record.payload(), b"new");
    }

    #[tokio::test]
    async fn test_rebalance_splits_partitions() {
        let broker = InMemoryBroker::new(4);
        let mut first = broker.consumer("g", TOPIC, OffsetReset::Earliest);
        first.subscribe().await.unwrap();
        assert_eq!(first.assignment().len(), 4);

        let mut second = broker.consumer("g", TOPIC, OffsetReset::Earliest);
        second.subscribe().await.unwrap();
        assert_eq!(first.assignment().len(), 2);
        assert_eq!(second.assignment().len(), 2);

        second.close().await.unwrap();
        assert_eq!(first.assignment().len(), 4);
        assert_eq!(broker.member_count("g", TOPIC), 1);
    }

    #[tokio::test]
    async fn test_unavailable_broker_errors() {
        let broker = InMemoryBroker::new(1);
        let mut consumer = broker.consumer("g", TOPIC, OffsetReset::Earliest);
        consumer.subscribe().await.unwrap();

        broker.set_available(false);
        let err = consumer.poll(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_connection_loss());

        let err = broker
            .producer()
            .send(TOPIC, "a@x.com", b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_poll_without_subscribe_fails() {
        let broker = InMemoryBroker::new(1);
        let mut consumer = broker.consumer("g", TOPIC, OffsetReset::Earliest);
        assert!(matches!(
            consumer.poll(Duration::from_millis(10)).await,
            Err(BrokerError::NotSubscribed)
        ));
    }
}
