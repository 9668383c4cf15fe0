//! In-Memory Broker
//!
//! A complete [`BrokerTransport`] that keeps every topic in process memory. It
//! is what the client test-suites run against, and it is handy for local
//! development when no real broker is around.
//!
//! ## Model
//!
//! - Each topic has a fixed number of partitions (default: 1), created on first
//!   use. Non-empty keys are hashed to a partition; empty keys are spread round
//!   robin.
//! - Consumer groups track members per `(group, topic)`. Partition `p` is owned
//!   by member `p % members.len()`. Every join or leave bumps the group
//!   generation, and members restart from the committed offsets (a rebalance).
//! - Committed offsets are "next offset to read", as in Kafka.
//! - `CommitMode::Auto` subscriptions commit their read positions whenever a
//!   read happens at least `interval` after the previous auto-commit.
//!
//! ## Fault Injection
//!
//! Tests can make the next N connects, writes, reads or commits fail, reject
//! individual messages inside a batch, slow writes down, or kill every open
//! connection at once with [`MemoryBroker::disconnect_all`].
//!
//! ## Journal
//!
//! Everything the broker receives is recorded: batch sizes, payloads in arrival
//! order, explicit commit calls and connection counts.
//!
//! ## Example
//!
//! ```ignore
//! let broker = MemoryBroker::with_partitions(3);
//! broker.publish("orders", ProduceRequest::new("user-1", "hello"));
//!
//! let transport: Arc<dyn BrokerTransport> = Arc::new(broker.clone());
//! let conn = transport.connect(&["memory".to_string()]).await?;
//! ```

use crate::error::{Result, TransportError};
use crate::message::{now_millis, Header, Message, ProduceRequest, RecordMetadata};
use crate::transport::{
    BrokerConnection, BrokerTransport, CommitMode, DeliveryResult, Subscription,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Bytes,
    value: Bytes,
    headers: Vec<Header>,
    timestamp: u64,
}

#[derive(Default)]
struct Group {
    members: Vec<u64>,
    generation: u64,
    committed: HashMap<i32, i64>,
}

impl Group {
    fn assigned(&self, member: u64, partitions: i32) -> Vec<i32> {
        match self.members.iter().position(|m| *m == member) {
            Some(index) => (0..partitions)
                .filter(|p| (*p as usize) % self.members.len() == index)
                .collect(),
            None => Vec::new(),
        }
    }

    fn commit(&mut self, partition: i32, next_offset: i64) {
        let entry = self.committed.entry(partition).or_insert(next_offset);
        if next_offset > *entry {
            *entry = next_offset;
        }
    }
}

#[derive(Default)]
struct Faults {
    connect: u32,
    write: u32,
    reject: u32,
    read: u32,
    commit: u32,
    write_latency: Option<Duration>,
    commit_latency: Option<Duration>,
}

/// One explicit commit call received by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub group_id: String,
    /// `(topic, partition, offset)` of every message in the call, in order
    pub offsets: Vec<(String, i32, i64)>,
}

#[derive(Default)]
struct Journal {
    received: Vec<(String, Bytes)>,
    batches: Vec<(String, usize)>,
    commits: Vec<CommitRecord>,
    auto_commits: usize,
}

struct BrokerState {
    partitions: i32,
    logs: Mutex<HashMap<String, Vec<Vec<StoredRecord>>>>,
    groups: Mutex<HashMap<(String, String), Group>>,
    faults: Mutex<Faults>,
    journal: Mutex<Journal>,
    notify: Notify,
    epoch: AtomicU64,
    next_connection_id: AtomicU64,
    round_robin: AtomicUsize,
    write_calls: AtomicUsize,
    connections_opened: AtomicUsize,
    connections_closed: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BrokerState {
    fn take_fault(&self, pick: impl FnOnce(&mut Faults) -> &mut u32) -> bool {
        let mut faults = lock(&self.faults);
        let counter = pick(&mut faults);
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }

    fn route(&self, key: &Bytes) -> i32 {
        if key.is_empty() {
            (self.round_robin.fetch_add(1, Ordering::Relaxed) % self.partitions as usize) as i32
        } else {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() % self.partitions as u64) as i32
        }
    }

    fn append(&self, topic: &str, partition: i32, request: &ProduceRequest) -> RecordMetadata {
        let mut logs = lock(&self.logs);
        let log = logs
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); self.partitions as usize]);
        let part = &mut log[partition as usize];
        part.push(StoredRecord {
            key: request.key.clone(),
            value: request.value.clone(),
            headers: request.headers.clone(),
            timestamp: now_millis(),
        });
        RecordMetadata {
            partition,
            offset: (part.len() - 1) as i64,
        }
    }
}

/// In-memory broker. Cloning shares the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Broker with one partition per topic.
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    /// Broker with `partitions` partitions per topic (at least one).
    pub fn with_partitions(partitions: i32) -> Self {
        Self {
            state: Arc::new(BrokerState {
                partitions: partitions.max(1),
                logs: Mutex::new(HashMap::new()),
                groups: Mutex::new(HashMap::new()),
                faults: Mutex::new(Faults::default()),
                journal: Mutex::new(Journal::default()),
                notify: Notify::new(),
                epoch: AtomicU64::new(0),
                next_connection_id: AtomicU64::new(1),
                round_robin: AtomicUsize::new(0),
                write_calls: AtomicUsize::new(0),
                connections_opened: AtomicUsize::new(0),
                connections_closed: AtomicUsize::new(0),
            }),
        }
    }

    pub fn partitions(&self) -> i32 {
        self.state.partitions
    }

    /// Append a record directly, bypassing any connection. Not journaled.
    pub fn publish(&self, topic: &str, request: ProduceRequest) -> RecordMetadata {
        let partition = self.state.route(&request.key);
        self.publish_to(topic, partition, request)
    }

    /// Append a record to a specific partition.
    pub fn publish_to(&self, topic: &str, partition: i32, request: ProduceRequest) -> RecordMetadata {
        let partition = partition.clamp(0, self.state.partitions - 1);
        let metadata = self.state.append(topic, partition, &request);
        self.state.notify.notify_waiters();
        metadata
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    pub fn fail_next_connects(&self, n: u32) {
        lock(&self.state.faults).connect = n;
    }

    pub fn fail_next_writes(&self, n: u32) {
        lock(&self.state.faults).write = n;
    }

    /// Reject the next `n` individual messages written, whatever batch they are in.
    pub fn reject_next_messages(&self, n: u32) {
        lock(&self.state.faults).reject = n;
    }

    pub fn fail_next_reads(&self, n: u32) {
        lock(&self.state.faults).read = n;
    }

    pub fn fail_next_commits(&self, n: u32) {
        lock(&self.state.faults).commit = n;
    }

    pub fn set_write_latency(&self, latency: Option<Duration>) {
        lock(&self.state.faults).write_latency = latency;
    }

    /// Delay every explicit commit by `latency` before it is applied.
    pub fn set_commit_latency(&self, latency: Option<Duration>) {
        lock(&self.state.faults).commit_latency = latency;
    }

    /// Invalidate every open connection. Their operations fail with `Closed`
    /// and `is_alive` turns false; new connections are unaffected.
    pub fn disconnect_all(&self) {
        self.state.epoch.fetch_add(1, Ordering::AcqRel);
        self.state.notify.notify_waiters();
        debug!("All memory broker connections invalidated");
    }

    // ------------------------------------------------------------------------
    // Journal
    // ------------------------------------------------------------------------

    /// Values successfully written to `topic` through connections, in arrival order.
    pub fn received(&self, topic: &str) -> Vec<Bytes> {
        lock(&self.state.journal)
            .received
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Size of every batch written to `topic`, in arrival order.
    pub fn batch_sizes(&self, topic: &str) -> Vec<usize> {
        lock(&self.state.journal)
            .batches
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, n)| *n)
            .collect()
    }

    /// Number of `write_batch` calls, including failed ones.
    pub fn write_calls(&self) -> usize {
        self.state.write_calls.load(Ordering::Acquire)
    }

    pub fn commits(&self) -> Vec<CommitRecord> {
        lock(&self.state.journal).commits.clone()
    }

    /// Number of successful explicit commit calls.
    pub fn commit_calls(&self) -> usize {
        lock(&self.state.journal).commits.len()
    }

    pub fn auto_commits(&self) -> usize {
        lock(&self.state.journal).auto_commits
    }

    /// Next offset to read for `group` on `topic`/`partition`, if anything was committed.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        lock(&self.state.groups)
            .get(&(group.to_string(), topic.to_string()))
            .and_then(|g| g.committed.get(&partition).copied())
    }

    pub fn group_members(&self, group: &str, topic: &str) -> usize {
        lock(&self.state.groups)
            .get(&(group.to_string(), topic.to_string()))
            .map(|g| g.members.len())
            .unwrap_or(0)
    }

    /// Number of records stored in `topic`/`partition`.
    pub fn partition_len(&self, topic: &str, partition: i32) -> usize {
        lock(&self.state.logs)
            .get(topic)
            .and_then(|log| log.get(partition as usize))
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::Acquire)
    }

    pub fn connections_closed(&self) -> usize {
        self.state.connections_closed.load(Ordering::Acquire)
    }

    pub fn open_connections(&self) -> usize {
        self.connections_opened() - self.connections_closed()
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn connect(&self, addresses: &[String]) -> Result<Box<dyn BrokerConnection>> {
        if addresses.is_empty() {
            return Err(TransportError::Connect(
                "<none>".to_string(),
                "no broker addresses configured".to_string(),
            ));
        }
        if self.state.take_fault(|f| &mut f.connect) {
            return Err(TransportError::Connect(
                addresses.join(","),
                "injected connect failure".to_string(),
            ));
        }

        let id = self.state.next_connection_id.fetch_add(1, Ordering::AcqRel);
        self.state.connections_opened.fetch_add(1, Ordering::AcqRel);
        trace!(connection_id = id, "Memory broker connection opened");

        Ok(Box::new(MemoryConnection {
            id,
            epoch: self.state.epoch.load(Ordering::Acquire),
            state: self.state.clone(),
            closed: AtomicBool::new(false),
            subscription: Mutex::new(None),
        }))
    }
}

struct SubscriptionState {
    subscription: Subscription,
    generation: u64,
    positions: HashMap<i32, i64>,
    next_partition: usize,
    last_auto_commit: Instant,
}

/// Connection handed out by [`MemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    epoch: u64,
    state: Arc<BrokerState>,
    closed: AtomicBool,
    subscription: Mutex<Option<SubscriptionState>>,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn leave_group(&self, subscription: &Subscription) {
        let mut groups = lock(&self.state.groups);
        if let Some(group) = groups.get_mut(&(
            subscription.group_id.clone(),
            subscription.topic.clone(),
        )) {
            let before = group.members.len();
            group.members.retain(|m| *m != self.id);
            if group.members.len() != before {
                group.generation += 1;
            }
        }
    }

    /// Take the next available message without waiting.
    fn poll_once(&self) -> Result<Option<Message>> {
        let mut guard = lock(&self.subscription);
        let sub = guard
            .as_mut()
            .ok_or_else(|| TransportError::Read("connection is not subscribed".to_string()))?;
        let topic = sub.subscription.topic.clone();
        let group_key = (sub.subscription.group_id.clone(), topic.clone());

        let (assigned, committed) = {
            let mut groups = lock(&self.state.groups);
            let group = groups.entry(group_key).or_default();
            if group.generation != sub.generation {
                trace!(
                    connection_id = self.id,
                    generation = group.generation,
                    "Group membership changed, resetting positions"
                );
                sub.positions.clear();
                sub.generation = group.generation;
            }
            let assigned = group.assigned(self.id, self.state.partitions);

            if let CommitMode::Auto { interval } = sub.subscription.commit_mode {
                if sub.last_auto_commit.elapsed() >= interval {
                    for (partition, position) in &sub.positions {
                        if assigned.contains(partition) {
                            group.commit(*partition, *position);
                        }
                    }
                    sub.last_auto_commit = Instant::now();
                    lock(&self.state.journal).auto_commits += 1;
                }
            }
            (assigned, group.committed.clone())
        };

        if assigned.is_empty() {
            return Ok(None);
        }

        let logs = lock(&self.state.logs);
        let Some(log) = logs.get(&topic) else {
            return Ok(None);
        };

        for i in 0..assigned.len() {
            let partition = assigned[(sub.next_partition + i) % assigned.len()];
            let position = *sub
                .positions
                .entry(partition)
                .or_insert_with(|| committed.get(&partition).copied().unwrap_or(0));

            if let Some(record) = log
                .get(partition as usize)
                .and_then(|part| part.get(position as usize))
            {
                sub.positions.insert(partition, position + 1);
                sub.next_partition = (sub.next_partition + i + 1) % assigned.len();
                return Ok(Some(Message {
                    topic,
                    key: record.key.clone(),
                    value: record.value.clone(),
                    headers: record.headers.clone(),
                    partition,
                    offset: position,
                    timestamp: record.timestamp,
                }));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn subscribe(&self, subscription: Subscription) -> Result<()> {
        self.ensure_open()?;

        let mut guard = lock(&self.subscription);
        if let Some(previous) = guard.take() {
            self.leave_group(&previous.subscription);
        }

        let generation = {
            let mut groups = lock(&self.state.groups);
            let group = groups
                .entry((subscription.group_id.clone(), subscription.topic.clone()))
                .or_default();
            group.members.push(self.id);
            group.generation += 1;
            group.generation
        };

        debug!(
            connection_id = self.id,
            topic = %subscription.topic,
            group_id = %subscription.group_id,
            generation,
            "Subscribed"
        );

        *guard = Some(SubscriptionState {
            subscription,
            // Forces a position reset on the first read.
            generation: generation.wrapping_sub(1),
            positions: HashMap::new(),
            next_partition: 0,
            last_auto_commit: Instant::now(),
        });
        Ok(())
    }

    async fn write_batch(&self, topic: &str, batch: &[ProduceRequest]) -> Result<Vec<DeliveryResult>> {
        self.ensure_open()?;
        self.state.write_calls.fetch_add(1, Ordering::AcqRel);

        let latency = lock(&self.state.faults).write_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
            self.ensure_open()?;
        }

        if self.state.take_fault(|f| &mut f.write) {
            return Err(TransportError::Write(
                topic.to_string(),
                "injected write failure".to_string(),
            ));
        }

        let mut results = Vec::with_capacity(batch.len());
        let mut accepted = Vec::with_capacity(batch.len());
        for request in batch {
            if self.state.take_fault(|f| &mut f.reject) {
                results.push(Err(TransportError::MessageRejected(
                    "injected message rejection".to_string(),
                )));
                continue;
            }
            let partition = self.state.route(&request.key);
            results.push(Ok(self.state.append(topic, partition, request)));
            accepted.push((topic.to_string(), request.value.clone()));
        }

        {
            let mut journal = lock(&self.state.journal);
            journal.batches.push((topic.to_string(), batch.len()));
            journal.received.extend(accepted);
        }

        trace!(connection_id = self.id, topic = %topic, size = batch.len(), "Batch written");
        self.state.notify.notify_waiters();
        Ok(results)
    }

    async fn read_message(&self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_open()?;
            if self.state.take_fault(|f| &mut f.read) {
                return Err(TransportError::Read("injected read failure".to_string()));
            }
            if let Some(message) = self.poll_once()? {
                return Ok(message);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(TransportError::ReadTimeout);
            }
        }
    }

    async fn commit(&self, group_id: &str, messages: &[Message]) -> Result<()> {
        self.ensure_open()?;
        let latency = lock(&self.state.faults).commit_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
            self.ensure_open()?;
        }
        if self.state.take_fault(|f| &mut f.commit) {
            return Err(TransportError::Commit(
                group_id.to_string(),
                "injected commit failure".to_string(),
            ));
        }

        {
            let mut groups = lock(&self.state.groups);
            for message in messages {
                groups
                    .entry((group_id.to_string(), message.topic.clone()))
                    .or_default()
                    .commit(message.partition, message.offset + 1);
            }
        }

        lock(&self.state.journal).commits.push(CommitRecord {
            group_id: group_id.to_string(),
            offsets: messages
                .iter()
                .map(|m| (m.topic.clone(), m.partition, m.offset))
                .collect(),
        });
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.epoch == self.state.epoch.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(sub) = lock(&self.subscription).take() {
            self.leave_group(&sub.subscription);
        }
        self.state.connections_closed.fetch_add(1, Ordering::AcqRel);
        self.state.notify.notify_waiters();
        trace!(connection_id = self.id, "Memory broker connection closed");
        Ok(())
    }
}
