//! Read loop and lifecycle shared by both commit strategies.

use super::ConsumerState;
use crate::config::ConsumerConfig;
use crate::error::{ClientError, Result};
use crate::middleware::{Handler, MiddlewareChain};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::retry::retry_with_jittered_backoff;
use async_trait::async_trait;
use courier_core::{CommitMode, Message, Subscription, TransportError};
use courier_observability::MetricsRecorder;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// What a commit strategy does with handler outcomes.
#[async_trait]
pub(crate) trait Acknowledger: Send + Sync {
    /// The handler finished `message` successfully.
    async fn acknowledge(&self, core: &ConsumerCore, message: Arc<Message>) -> Result<()>;

    /// The handler failed on `message`.
    fn reject(&self, message: &Message);

    /// A fresh connection replaced a lost one; uncommitted messages will be
    /// delivered again.
    fn reconnected(&self) {}

    /// Commit whatever is pending before the connection is released.
    async fn finish(&self, core: &ConsumerCore) -> Result<()>;
}

pub(crate) struct ConsumerCore {
    config: ConsumerConfig,
    instance_id: String,
    commit_mode: CommitMode,
    pool: Arc<ConnectionPool>,
    owns_pool: bool,
    middleware: MiddlewareChain,
    metrics: Arc<dyn MetricsRecorder>,
    conn: RwLock<Option<PooledConnection>>,
    state: AtomicU8,
    stop: CancellationToken,
    /// Set by `close`, which then finalizes and reports the outcome itself.
    closing: AtomicBool,
    running: Mutex<()>,
    finalized: Mutex<bool>,
}

pub(crate) struct CoreParts {
    pub config: ConsumerConfig,
    pub instance_id: String,
    pub commit_mode: CommitMode,
    pub pool: Arc<ConnectionPool>,
    pub owns_pool: bool,
    pub middleware: MiddlewareChain,
    pub metrics: Arc<dyn MetricsRecorder>,
}

impl ConsumerCore {
    /// Subscribe a pooled connection and return a `Connected` core.
    pub(crate) async fn connect(parts: CoreParts) -> Result<Self> {
        let core = Self {
            config: parts.config,
            instance_id: parts.instance_id,
            commit_mode: parts.commit_mode,
            pool: parts.pool,
            owns_pool: parts.owns_pool,
            middleware: parts.middleware,
            metrics: parts.metrics,
            conn: RwLock::new(None),
            state: AtomicU8::new(ConsumerState::Created as u8),
            stop: CancellationToken::new(),
            closing: AtomicBool::new(false),
            running: Mutex::new(()),
            finalized: Mutex::new(false),
        };

        let conn = match core.open_subscribed().await {
            Ok(conn) => conn,
            Err(e) => {
                if core.owns_pool {
                    let _ = core.pool.close().await;
                }
                return Err(e);
            }
        };
        *core.conn.write().await = Some(conn);
        core.set_state(ConsumerState::Connected);
        info!(
            topic = %core.config.topic,
            group_id = %core.config.group_id,
            instance = %core.instance_id,
            "Consumer connected"
        );
        Ok(core)
    }

    pub(crate) fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub(crate) fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub(crate) fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn subscription(&self) -> Subscription {
        Subscription::new(
            self.config.topic.clone(),
            self.config.group_id.clone(),
            self.commit_mode,
        )
    }

    async fn open_subscribed(&self) -> Result<PooledConnection> {
        let conn = self.pool.get().await?;
        if let Err(e) = conn.subscribe(self.subscription()).await {
            self.pool.discard(conn).await;
            return Err(e.into());
        }
        debug!(
            connection_id = conn.id(),
            instance = %self.instance_id,
            "Subscription established"
        );
        Ok(conn)
    }

    /// Commit `messages` on the current connection.
    pub(crate) async fn commit(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let guard = self.conn.read().await;
        let conn = guard.as_ref().ok_or(ClientError::Closed)?;
        conn.commit(&self.config.group_id, messages).await?;
        self.metrics.record_commit(&self.config.group_id, messages.len());
        debug!(
            group_id = %self.config.group_id,
            instance = %self.instance_id,
            messages = messages.len(),
            "Offsets committed"
        );
        Ok(())
    }

    /// Run the read loop until `cancel` fires, `stop` is called or the
    /// connection cannot be restored; then finalize, unless `close` is
    /// waiting to do it.
    pub(crate) async fn run(
        &self,
        handler: Handler,
        cancel: CancellationToken,
        acks: &dyn Acknowledger,
    ) -> Result<()> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| ClientError::InvalidState("consumer is already running".into()))?;

        let state = self.state();
        if state != ConsumerState::Connected {
            return Err(ClientError::InvalidState(format!(
                "cannot start a consumer that is {state}"
            )));
        }
        self.set_state(ConsumerState::Running);
        info!(
            topic = %self.config.topic,
            group_id = %self.config.group_id,
            instance = %self.instance_id,
            "Consumer started"
        );

        let handler = self.middleware.then(handler);
        let outcome = self.read_loop(&handler, &cancel, acks).await;
        if let Err(e) = &outcome {
            error!(instance = %self.instance_id, error = %e, "Consumer loop failed");
        }

        if self.closing.load(Ordering::Acquire) {
            return outcome;
        }
        let finished = self.finalize(acks).await;
        outcome.and(finished)
    }

    fn stop_requested(&self, cancel: &CancellationToken) -> bool {
        self.stop.is_cancelled() || cancel.is_cancelled()
    }

    async fn read_loop(
        &self,
        handler: &Handler,
        cancel: &CancellationToken,
        acks: &dyn Acknowledger,
    ) -> Result<()> {
        loop {
            if self.stop_requested(cancel) {
                return Ok(());
            }

            let read = {
                let guard = self.conn.read().await;
                let Some(conn) = guard.as_ref() else {
                    return Err(ClientError::Closed);
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    _ = self.stop.cancelled() => return Ok(()),
                    read = conn.read_message(self.config.read_timeout) => read,
                }
            };

            match read {
                Ok(message) => self.handle(handler, message, acks).await,
                Err(TransportError::ReadTimeout) => {
                    trace!(instance = %self.instance_id, "No message within read timeout");
                }
                Err(e) if self.stop_requested(cancel) => {
                    debug!(error = %e, "Read failed during shutdown");
                    return Ok(());
                }
                Err(e) if e.is_connection_error() => {
                    warn!(instance = %self.instance_id, error = %e, "Connection lost, reconnecting");
                    self.metrics.record_connection_error();
                    self.reconnect(cancel).await?;
                    acks.reconnected();
                }
                Err(e) => {
                    warn!(
                        instance = %self.instance_id,
                        error = %e,
                        backoff_ms = self.config.error_backoff.as_millis() as u64,
                        "Read failed, backing off"
                    );
                    let error = ClientError::from(e);
                    self.metrics
                        .record_consume_error(&self.config.topic, &self.config.group_id, error.kind());
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = self.stop.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }
    }

    async fn handle(&self, handler: &Handler, message: Message, acks: &dyn Acknowledger) {
        let message = Arc::new(message);
        let started = Instant::now();

        match handler(message.clone()).await {
            Ok(()) => {
                self.metrics.record_consumed(
                    &message.topic,
                    &self.config.group_id,
                    message.estimated_size(),
                    started.elapsed(),
                );
                if let Err(e) = acks.acknowledge(self, message.clone()).await {
                    warn!(
                        instance = %self.instance_id,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "Commit failed, offsets stay pending"
                    );
                }
            }
            Err(e) => {
                self.metrics
                    .record_consume_error(&message.topic, &self.config.group_id, e.kind());
                warn!(
                    instance = %self.instance_id,
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Handler failed, message not acknowledged"
                );
                acks.reject(&message);
            }
        }
    }

    async fn reconnect(&self, cancel: &CancellationToken) -> Result<()> {
        let mut slot = self.conn.write().await;
        if let Some(old) = slot.take() {
            self.pool.discard(old).await;
        }

        let conn = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = self.stop.cancelled() => return Ok(()),
            conn = retry_with_jittered_backoff(&self.config.reconnect, || self.open_subscribed()) => conn?,
        };
        info!(
            instance = %self.instance_id,
            connection_id = conn.id(),
            "Consumer reconnected"
        );
        *slot = Some(conn);
        Ok(())
    }

    /// Request the loop to exit and wait until it has finished.
    async fn halt(&self) {
        self.stop.cancel();
        let _ = self.running.lock().await;
    }

    /// Halt, then finalize if the loop did not (it never ran, or `close`
    /// took over). Errors are logged by `finalize`.
    pub(crate) async fn stop(&self, acks: &dyn Acknowledger) {
        self.halt().await;
        let _ = self.finalize(acks).await;
    }

    /// Final commit, release the connection, move to `Closed`. Runs once.
    pub(crate) async fn finalize(&self, acks: &dyn Acknowledger) -> Result<()> {
        let mut finalized = self.finalized.lock().await;
        if *finalized {
            return Ok(());
        }
        *finalized = true;
        self.set_state(ConsumerState::Stopping);

        let timeout = self.config.shutdown_timeout;
        let committed = match tokio::time::timeout(timeout, acks.finish(self)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::DeadlineExceeded(timeout)),
        };
        if let Err(e) = &committed {
            error!(instance = %self.instance_id, error = %e, "Final commit failed");
        }

        let conn = self.conn.write().await.take();
        if let Some(conn) = conn {
            self.pool.discard(conn).await;
        }
        if self.owns_pool {
            self.pool.close().await?;
        }

        self.set_state(ConsumerState::Closed);
        info!(
            topic = %self.config.topic,
            group_id = %self.config.group_id,
            instance = %self.instance_id,
            "Consumer closed"
        );
        committed
    }

    /// Stop if running, then finalize. The first close reports the final
    /// commit's outcome when it is the one to finalize.
    pub(crate) async fn close(&self, acks: &dyn Acknowledger) -> Result<()> {
        self.closing.store(true, Ordering::Release);
        self.halt().await;
        self.finalize(acks).await
    }
}
