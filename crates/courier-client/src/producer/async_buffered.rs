//! Async-buffered producer.
//!
//! `send` offers the record to a bounded channel and returns immediately. A
//! background worker drains the channel into batches and writes each batch on
//! its own task, at most `max_in_flight` at a time.
//!
//! ```text
//!   send ──try_send──► [ mpsc (queue_capacity) ] ──► worker
//!     │ full: Backpressure                            │ batch_size or linger
//!     │ closed: Closed                                ▼
//!                                         ┌─────────────────────────┐
//!                                         │ JoinSet + Semaphore     │ ≤ max_in_flight
//!                                         │ write ─► on_delivery()  │
//!                                         └─────────────────────────┘
//! ```
//!
//! Batches in flight at the same time may complete in any order.

use super::{BatchWriter, DeliveryCallback, Producer};
use crate::config::ProducerConfig;
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use courier_core::ProduceRequest;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, trace, warn};

enum Command {
    Record(ProduceRequest),
    Flush(oneshot::Sender<()>),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Producer that never blocks on `send`.
pub struct AsyncProducer {
    writer: Arc<BatchWriter>,
    sender: Mutex<Option<mpsc::Sender<Command>>>,
    closed: AtomicBool,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    config: ProducerConfig,
}

struct Worker {
    writer: Arc<BatchWriter>,
    batch_size: usize,
    permits: Arc<Semaphore>,
    in_flight: JoinSet<()>,
    on_delivery: Option<DeliveryCallback>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, config: ProducerConfig) {
        let mut batch: Vec<ProduceRequest> = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval(config.linger);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Record(record)) => {
                        batch.push(record);
                        if batch.len() >= self.batch_size {
                            self.dispatch(&mut batch).await;
                        }
                    }
                    Some(Command::Flush(done)) => {
                        self.dispatch(&mut batch).await;
                        self.wait_in_flight().await;
                        let _ = done.send(());
                    }
                    None => break,
                },
                _ = ticker.tick() => self.dispatch(&mut batch).await,
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    Self::log_join(joined);
                }
            }
        }

        self.dispatch(&mut batch).await;
        self.wait_in_flight().await;
        trace!(topic = %self.writer.topic(), "Async producer worker stopped");
    }

    /// Hand the current batch to a writer task once an in-flight slot is free.
    async fn dispatch(&mut self, batch: &mut Vec<ProduceRequest>) {
        if batch.is_empty() {
            return;
        }
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            return;
        };
        let records = std::mem::replace(batch, Vec::with_capacity(self.batch_size));
        let writer = self.writer.clone();
        let on_delivery = self.on_delivery.clone();

        self.in_flight.spawn(async move {
            let _permit = permit;
            deliver(&writer, records, on_delivery.as_ref()).await;
        });
    }

    async fn wait_in_flight(&mut self) {
        while let Some(joined) = self.in_flight.join_next().await {
            Self::log_join(joined);
        }
    }

    fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            error!(error = %e, "Batch writer task failed");
        }
    }
}

async fn deliver(writer: &BatchWriter, records: Vec<ProduceRequest>, on_delivery: Option<&DeliveryCallback>) {
    match writer.write(&records).await {
        Ok(results) => {
            for (record, result) in records.iter().zip(results) {
                match (result, on_delivery) {
                    (Ok(meta), Some(callback)) => callback(record, Ok(meta)),
                    (Err(e), Some(callback)) => callback(record, Err(&ClientError::from(e))),
                    (Err(e), None) => warn!(
                        topic = %writer.topic(),
                        error = %e,
                        "Record rejected"
                    ),
                    (Ok(_), None) => {}
                }
            }
        }
        Err(e) => match on_delivery {
            Some(callback) => {
                for record in &records {
                    callback(record, Err(&e));
                }
            }
            None => error!(
                topic = %writer.topic(),
                records = records.len(),
                error = %e,
                "Batch lost"
            ),
        },
    }
}

impl AsyncProducer {
    pub(crate) fn new(
        writer: BatchWriter,
        config: ProducerConfig,
        on_delivery: Option<DeliveryCallback>,
    ) -> Self {
        let writer = Arc::new(writer);
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let worker = Worker {
            writer: writer.clone(),
            batch_size: config.batch_size,
            permits: Arc::new(Semaphore::new(config.max_in_flight)),
            in_flight: JoinSet::new(),
            on_delivery,
        };
        let handle = tokio::spawn(worker.run(receiver, config.clone()));

        Self {
            writer,
            sender: Mutex::new(Some(sender)),
            closed: AtomicBool::new(false),
            worker: tokio::sync::Mutex::new(Some(handle)),
            config,
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Command>> {
        lock(&self.sender).clone().ok_or(ClientError::Closed)
    }
}

#[async_trait]
impl Producer for AsyncProducer {
    fn topic(&self) -> &str {
        self.writer.topic()
    }

    /// Queue `record` without waiting.
    ///
    /// # Errors
    ///
    /// - `Backpressure` if the queue is full
    /// - `Closed` after `close`
    async fn send_record(&self, record: ProduceRequest) -> Result<()> {
        let guard = lock(&self.sender);
        let sender = guard.as_ref().ok_or(ClientError::Closed)?;
        match sender.try_send(Command::Record(record)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ClientError::Backpressure),
            Err(TrySendError::Closed(_)) => Err(ClientError::Closed),
        }
    }

    /// Wait until everything queued before this call has been written.
    async fn flush(&self) -> Result<()> {
        let sender = match self.sender() {
            Ok(sender) => sender,
            Err(_) => return Ok(()),
        };
        let (done, finished) = oneshot::channel();
        sender
            .send(Command::Flush(done))
            .await
            .map_err(|_| ClientError::Closed)?;
        finished.await.map_err(|_| ClientError::Closed)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        lock(&self.sender).take();

        let timeout = self.config.shutdown_timeout;
        let mut worker = self.worker.lock().await;
        let drained = match worker.as_mut() {
            Some(handle) => match tokio::time::timeout(timeout, &mut *handle).await {
                Ok(_) => Ok(()),
                Err(_) => {
                    handle.abort();
                    error!(topic = %self.topic(), "Async producer did not drain before the deadline");
                    Err(ClientError::DeadlineExceeded(timeout))
                }
            },
            None => Ok(()),
        };
        worker.take();
        drop(worker);

        self.writer.close().await?;
        debug!(topic = %self.topic(), "Async producer closed");
        drained
    }
}
