use super::runner::{Acknowledger, ConsumerCore};
use super::{Consumer, ConsumerState};
use crate::error::Result;
use crate::middleware::Handler;
use async_trait::async_trait;
use courier_core::Message;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Consumer whose offsets are committed by the transport on an interval.
///
/// The transport commits read positions, so a message whose handler failed
/// can be committed too. On close, the latest handled message of every
/// partition is committed explicitly so no handled work is redelivered.
pub struct AutoCommitConsumer {
    core: ConsumerCore,
    acks: LatestHandled,
}

/// Latest handled message per partition.
#[derive(Default)]
struct LatestHandled {
    latest: Mutex<BTreeMap<i32, Message>>,
}

impl LatestHandled {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<i32, Message>> {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Acknowledger for LatestHandled {
    async fn acknowledge(&self, _core: &ConsumerCore, message: Arc<Message>) -> Result<()> {
        let mut latest = self.lock();
        let newer = latest
            .get(&message.partition)
            .map_or(true, |seen| message.offset > seen.offset);
        if newer {
            latest.insert(message.partition, (*message).clone());
        }
        Ok(())
    }

    fn reject(&self, _message: &Message) {}

    async fn finish(&self, core: &ConsumerCore) -> Result<()> {
        let latest: Vec<Message> = std::mem::take(&mut *self.lock()).into_values().collect();
        if latest.is_empty() {
            return Ok(());
        }
        debug!(partitions = latest.len(), "Committing latest handled offsets");
        core.commit(&latest).await
    }
}

impl AutoCommitConsumer {
    pub(crate) fn new(core: ConsumerCore) -> Self {
        Self {
            core,
            acks: LatestHandled::default(),
        }
    }
}

#[async_trait]
impl Consumer for AutoCommitConsumer {
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
