//! Consumer Group Manager
//!
//! Runs several consumer instances of one group in the same process, each on
//! its own task. Which instance reads which partition is decided by the
//! transport's group assignment.
//!
//! ```text
//!                      ┌─ instance-0 ── start() ── partitions {0, 3}
//!   ConsumerGroupManager ─ instance-1 ── start() ── partitions {1, 4}
//!                      └─ instance-2 ── start() ── partitions {2, 5}
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let template = ConsumerBuilder::new()
//!     .transport(transport)
//!     .topic("orders")
//!     .group_id("billing");
//!
//! let group = ConsumerGroupManager::new(template);
//! group.start(3, handler).await?;
//! // ...
//! group.stop_all().await?;
//! ```

use crate::consumer::{Consumer, ConsumerBuilder, ConsumerState};
use crate::error::{ClientError, Result};
use crate::middleware::Handler;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct Member {
    consumer: Arc<dyn Consumer>,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

/// Starts and stops the instances of one consumer group.
pub struct ConsumerGroupManager {
    group_id: String,
    template: ConsumerBuilder,
    members: Mutex<Vec<Member>>,
}

impl ConsumerGroupManager {
    /// Every instance is built from a clone of `template`, with its own
    /// instance id.
    pub fn new(template: ConsumerBuilder) -> Self {
        Self {
            group_id: template.group_id_value().to_string(),
            template,
            members: Mutex::new(Vec::new()),
        }
    }

    /// Build, connect and start `instances` consumers.
    ///
    /// Instances are named `instance-0` to `instance-{n-1}`.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the group is already started
    /// - `Config` if `instances` is zero or the template is invalid
    /// - the connect error of the first instance that failed; the instances
    ///   started before it are stopped again
    pub async fn start(&self, instances: usize, handler: Handler) -> Result<()> {
        if instances == 0 {
            return Err(ClientError::Config("instances must be > 0".into()));
        }
        let mut members = self.members.lock().await;
        if !members.is_empty() {
            return Err(ClientError::InvalidState("consumer group is already started".into()));
        }

        for index in 0..instances {
            let instance_id = format!("instance-{index}");
            let consumer = match self.template.clone().instance_id(&instance_id).build().await {
                Ok(consumer) => consumer,
                Err(e) => {
                    error!(instance = %instance_id, error = %e, "Consumer instance failed to connect");
                    let started = std::mem::take(&mut *members);
                    if let Err(stop_error) = shutdown(started).await {
                        warn!(error = %stop_error, "Stopping started instances failed");
                    }
                    return Err(e);
                }
            };

            let cancel = CancellationToken::new();
            let task = {
                let consumer = consumer.clone();
                let handler = handler.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { consumer.start(handler, cancel).await })
            };
            members.push(Member {
                consumer,
                cancel,
                task,
            });
        }

        info!(
            group_id = %self.group_id,
            instances,
            "Consumer group started"
        );
        Ok(())
    }

    /// Stop and close every instance.
    ///
    /// Every instance is stopped even when some of them fail; the first error
    /// is returned.
    pub async fn stop_all(&self) -> Result<()> {
        let members = std::mem::take(&mut *self.members.lock().await);
        if members.is_empty() {
            return Ok(());
        }
        let count = members.len();
        let result = shutdown(members).await;
        info!(group_id = %self.group_id, instances = count, "Consumer group stopped");
        result
    }

    /// Number of running instances.
    pub async fn len(&self) -> usize {
        self.members.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.lock().await.is_empty()
    }

    /// `(instance id, state)` of every instance.
    pub async fn states(&self) -> Vec<(String, ConsumerState)> {
        self.members
            .lock()
            .await
            .iter()
            .map(|m| (m.consumer.instance_id().to_string(), m.consumer.state()))
            .collect()
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }
}

/// Cancel every member first so no survivor picks up the partitions of one
/// that is leaving, then close each and wait for its task.
async fn shutdown(members: Vec<Member>) -> Result<()> {
    for member in &members {
        member.cancel.cancel();
    }

    let mut first_error = None;
    for member in members {
        let closed = member.consumer.close().await;
        let finished = match member.task.await {
            Ok(result) => result,
            Err(e) => Err(ClientError::InvalidState(format!(
                "consumer task failed: {e}"
            ))),
        };

        for result in [finished, closed] {
            if let Err(e) = result {
                warn!(
                    instance = %member.consumer.instance_id(),
                    error = %e,
                    "Consumer instance stopped with an error"
                );
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
