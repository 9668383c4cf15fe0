//! Manual-commit consumer.
//!
//! ## Acknowledgment Rules
//!
//! - A message enters the [`CommitSet`] only after its handler succeeded.
//! - Offsets within one partition are strictly increasing in the set.
//! - Once a handler fails on a partition, later messages of that partition
//!   are not added: committing them would implicitly acknowledge the failed
//!   offset. The partition opens again when the failed offset is delivered
//!   anew (a rebalance rewinds to the committed offset), on reconnect, or on
//!   restart.
//! - The set is cleared only after a successful commit; messages added while
//!   a commit was in flight stay pending.
//!
//! ```text
//!   handler ok ──► CommitSet [p0:4, p0:5, p1:9] ── len ≥ commit_batch_size ──► commit
//!   handler err ─► partition blocked                 commit() / close() ───────┘
//! ```

use super::runner::{Acknowledger, ConsumerCore};
use super::{Consumer, ConsumerState};
use crate::error::Result;
use crate::middleware::Handler;
use async_trait::async_trait;
use courier_core::Message;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Handled messages waiting to be committed.
#[derive(Debug, Default)]
pub struct CommitSet {
    entries: Vec<Arc<Message>>,
    high_water: HashMap<i32, i64>,
    /// Partition to the offset whose handler failed.
    blocked: HashMap<i32, i64>,
}

impl CommitSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handled message.
    ///
    /// Returns `false` when the message is not acknowledged: its partition
    /// is blocked by an earlier failure, or its offset is not beyond what the
    /// set already covers. A message at or before the failed offset is a
    /// redelivery and opens the partition again.
    pub fn add(&mut self, message: Arc<Message>) -> bool {
        if let Some(&failed) = self.blocked.get(&message.partition) {
            if message.offset > failed {
                return false;
            }
            self.blocked.remove(&message.partition);
        }
        if let Some(&high) = self.high_water.get(&message.partition) {
            if message.offset <= high {
                return false;
            }
        }
        self.high_water.insert(message.partition, message.offset);
        self.entries.push(message);
        true
    }

    /// Stop acknowledging `partition` after the handler failed at `offset`.
    /// The earliest failure on a partition is kept.
    pub fn block(&mut self, partition: i32, offset: i64) {
        let failed = self.blocked.entry(partition).or_insert(offset);
        *failed = (*failed).min(offset);
    }

    pub fn is_blocked(&self, partition: i32) -> bool {
        self.blocked.contains_key(&partition)
    }

    /// Blocked partitions, ascending.
    pub fn blocked_partitions(&self) -> Vec<i32> {
        let mut partitions: Vec<i32> = self.blocked.keys().copied().collect();
        partitions.sort_unstable();
        partitions
    }

    /// Re-enable every partition (the failed messages will be redelivered).
    pub fn unblock_all(&mut self) {
        self.blocked.clear();
    }

    /// Forget the high-water marks of messages that were never committed, so
    /// their redelivery is acknowledged again.
    fn rewind(&mut self) {
        let mut committed_high = HashMap::new();
        std::mem::swap(&mut committed_high, &mut self.high_water);
        for entry in &self.entries {
            let high = committed_high.entry(entry.partition).or_insert(entry.offset);
            *high = (*high).max(entry.offset);
        }
        self.high_water = committed_high
            .into_iter()
            .filter(|(partition, _)| self.entries.iter().any(|e| e.partition == *partition))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of the pending messages, in acknowledgment order.
    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.iter().map(|m| (**m).clone()).collect()
    }

    /// Drop the first `count` entries after they were committed.
    pub fn drain_committed(&mut self, count: usize) {
        let count = count.min(self.entries.len());
        self.entries.drain(..count);
    }
}

struct PendingCommits {
    set: Mutex<CommitSet>,
    commit_lock: tokio::sync::Mutex<()>,
    batch_size: usize,
}

impl PendingCommits {
    fn lock(&self) -> MutexGuard<'_, CommitSet> {
        self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn commit(&self, core: &ConsumerCore) -> Result<()> {
        let _serialized = self.commit_lock.lock().await;
        let snapshot = self.lock().snapshot();
        if snapshot.is_empty() {
            return Ok(());
        }
        core.commit(&snapshot).await?;
        self.lock().drain_committed(snapshot.len());
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for PendingCommits {
    async fn acknowledge(&self, core: &ConsumerCore, message: Arc<Message>) -> Result<()> {
        let (partition, offset) = (message.partition, message.offset);
        let due = {
            let mut set = self.lock();
            if !set.add(message) {
                trace!(partition, offset, "Message not acknowledged");
                return Ok(());
            }
            set.len() >= self.batch_size
        };
        if due {
            self.commit(core).await?;
        }
        Ok(())
    }

    fn reject(&self, message: &Message) {
        let mut set = self.lock();
        if !set.is_blocked(message.partition) {
            warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Commits paused for partition until the failed offset is redelivered"
            );
        }
        set.block(message.partition, message.offset);
    }

    fn reconnected(&self) {
        let mut set = self.lock();
        set.unblock_all();
        set.rewind();
    }

    async fn finish(&self, core: &ConsumerCore) -> Result<()> {
        self.commit(core).await
    }
}

/// Consumer that commits handled messages in batches.
pub struct ManualCommitConsumer {
    core: ConsumerCore,
    acks: PendingCommits,
}

impl ManualCommitConsumer {
    pub(crate) fn new(core: ConsumerCore) -> Self {
        let batch_size = core.config().commit_batch_size;
        Self {
            core,
            acks: PendingCommits {
                set: Mutex::new(CommitSet::new()),
                commit_lock: tokio::sync::Mutex::new(()),
                batch_size,
            },
        }
    }

    /// Commit every pending acknowledgment now.
    ///
    /// # Errors
    ///
    /// Transport errors leave the set untouched; the next commit retries it.
    pub async fn commit(&self) -> Result<()> {
        self.acks.commit(&self.core).await
    }

    /// Handled messages not yet committed.
    pub fn pending(&self) -> usize {
        self.acks.lock().len()
    }

    /// Partitions whose commits are paused by a handler failure.
    pub fn blocked_partitions(&self) -> Vec<i32> {
        self.acks.lock().blocked_partitions()
    }
}

#[async_trait]
impl Consumer for ManualCommitConsumer {
    fn topic(&self) -> &str {
        &self.core.config().topic
    }

    fn group_id(&self) -> &str {
        &self.core.config().group_id
    }

    fn instance_id(&self) -> &str {
        self.core.instance_id()
    }

    async fn start(&self, handler: Handler, cancel: CancellationToken) -> Result<()> {
        self.core.run(handler, cancel, &self.acks).await
    }

    async fn stop(&self) {
        self.core.stop(&self.acks).await
    }

    async fn close(&self) -> Result<()> {
        self.core.close(&self.acks).await
    }

    fn state(&self) -> ConsumerState {
        self.core.state()
    }
}
