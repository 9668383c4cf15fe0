//! Batch-buffered producer.
//!
//! ## Flush Triggers
//!
//! The buffer is flushed when ANY of these happen:
//! - **Size**: the buffer reaches `batch_size` records (the background
//!   flusher is woken; `send` itself never waits for I/O)
//! - **Time**: the `linger` ticker fires
//! - **Manual**: `flush()` or `close()`
//!
//! ## Ordering
//!
//! A flush moves the whole buffer in flight, cuts it into chunks of at most
//! `batch_size` and writes them one after another. Flushes are serialized by
//! an async lock, so batches reach the transport in submission order. When a
//! chunk fails as a whole, the chunks behind it are not attempted and stay in
//! flight for the next flush.
//!
//! ```text
//!   send ──► [ buffer ] ──stage──► [ in flight ] ──► chunk₁ ─► chunk₂ ─► chunk₃
//!                                       ▲                  │ failed
//!                                       └── requeue (front) ◄┘
//! ```
//!
//! ## Shutdown
//!
//! `close` drains under `shutdown_timeout`. Whatever is still buffered, in
//! flight or requeued when the deadline passes (or the final flush fails) is
//! handed to the failure callback with the error, and counted in the log.
//! A record abandoned mid-write may still have reached the broker.

use super::{BatchWriter, FailureCallback, Producer};
use crate::config::ProducerConfig;
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use courier_core::ProduceRequest;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

struct Shared {
    writer: BatchWriter,
    config: ProducerConfig,
    buffer: Mutex<VecDeque<ProduceRequest>>,
    /// Taken from the buffer by the running flush and not yet resolved.
    in_flight: Mutex<VecDeque<ProduceRequest>>,
    /// Failed records waiting for another attempt; they go out first.
    requeued: Mutex<Vec<ProduceRequest>>,
    closed: AtomicBool,
    wake: Notify,
    flush_lock: tokio::sync::Mutex<()>,
    on_failure: Option<FailureCallback>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    /// Records not yet delivered or reported, in flight ones included.
    fn buffered(&self) -> usize {
        let buffered = lock(&self.buffer).len();
        let in_flight = lock(&self.in_flight).len();
        buffered + in_flight + lock(&self.requeued).len()
    }

    /// Report a request whose delivery failed, or keep it for another attempt.
    fn fail(&self, mut request: ProduceRequest, error: &ClientError) {
        request.attempts += 1;
        if self.config.requeue_failed && request.attempts < self.config.max_attempts {
            trace!(attempts = request.attempts, "Requeueing failed record");
            lock(&self.requeued).push(request);
            return;
        }
        match &self.on_failure {
            Some(callback) => callback(request, error),
            None => error!(
                topic = %self.writer.topic(),
                attempts = request.attempts,
                error = %error,
                "Dropping undeliverable record"
            ),
        }
    }

    /// Stage requeued records ahead of anything an interrupted flush left in
    /// flight, and newly buffered records behind it.
    fn stage(&self) -> usize {
        let requeued = std::mem::take(&mut *lock(&self.requeued));
        let fresh = std::mem::take(&mut *lock(&self.buffer));

        let mut in_flight = lock(&self.in_flight);
        for request in requeued.into_iter().rev() {
            in_flight.push_front(request);
        }
        in_flight.extend(fresh);
        in_flight.len()
    }

    /// Write everything currently buffered.
    ///
    /// Returns the whole-batch error if a chunk could not be written at all;
    /// the chunks behind it stay in flight for the next flush. Per-message
    /// failures go to the failure callback (or the requeue).
    async fn flush(&self) -> Result<()> {
        let _serialized = self.flush_lock.lock().await;

        let staged = self.stage();
        if staged == 0 {
            return Ok(());
        }
        debug!(
            topic = %self.writer.topic(),
            records = staged,
            "Flushing buffered records"
        );

        loop {
            let chunk: Vec<ProduceRequest> = {
                let in_flight = lock(&self.in_flight);
                if in_flight.is_empty() {
                    return Ok(());
                }
                in_flight
                    .iter()
                    .take(self.config.batch_size)
                    .cloned()
                    .collect()
            };

            let written = self.writer.write(&chunk).await;
            {
                let mut in_flight = lock(&self.in_flight);
                let resolved = chunk.len().min(in_flight.len());
                in_flight.drain(..resolved);
            }

            match written {
                Ok(results) => {
                    for (request, result) in chunk.into_iter().zip(results) {
                        if let Err(e) = result {
                            self.fail(request, &ClientError::from(e));
                        }
                    }
                }
                Err(e) => {
                    for request in chunk {
                        self.fail(request, &e);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Give up on every record still held, handing each to the failure
    /// callback. Returns how many were abandoned.
    fn abandon(&self, error: &ClientError) -> usize {
        let mut records = std::mem::take(&mut *lock(&self.requeued));
        records.extend(std::mem::take(&mut *lock(&self.in_flight)));
        records.extend(std::mem::take(&mut *lock(&self.buffer)));

        let abandoned = records.len();
        if let Some(callback) = &self.on_failure {
            for request in records {
                callback(request, error);
            }
        }
        abandoned
    }
}

/// Producer that appends to a shared buffer and writes in batches.
pub struct BatchProducer {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl BatchProducer {
    pub(crate) fn new(
        writer: BatchWriter,
        config: ProducerConfig,
        on_failure: Option<FailureCallback>,
    ) -> Self {
        let shared = Arc::new(Shared {
            writer,
            config,
            buffer: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(VecDeque::new()),
            requeued: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
            flush_lock: tokio::sync::Mutex::new(()),
            on_failure,
        });
        let shutdown = CancellationToken::new();
        let flusher = tokio::spawn(Self::run_flusher(shared.clone(), shutdown.clone()));

        Self {
            shared,
            shutdown,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    /// Records waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.shared.buffered()
    }

    async fn run_flusher(shared: Arc<Shared>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(shared.config.linger);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = shared.wake.notified() => {}
                _ = ticker.tick() => {}
            }
            if let Err(e) = shared.flush().await {
                warn!(topic = %shared.writer.topic(), error = %e, "Background flush failed");
            }
        }
        trace!(topic = %shared.writer.topic(), "Batch flusher stopped");
    }

    /// Flush until the buffer is empty or a flush fails.
    async fn drain(&self) -> Result<()> {
        loop {
            self.shared.flush().await?;
            if self.shared.buffered() == 0 {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl Producer for BatchProducer {
    fn topic(&self) -> &str {
        self.shared.writer.topic()
    }

    async fn send_record(&self, record: ProduceRequest) -> Result<()> {
        let full = {
            let mut buffer = lock(&self.shared.buffer);
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(ClientError::Closed);
            }
            buffer.push_back(record);
            buffer.len() >= self.shared.config.batch_size
        };
        if full {
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.shared.flush().await
    }

    async fn close(&self) -> Result<()> {
        {
            let _buffer = lock(&self.shared.buffer);
            if self.shared.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
        }
        self.shutdown.cancel();
        let flusher = lock(&self.flusher).take();
        if let Some(flusher) = flusher {
            let _ = flusher.await;
        }

        let timeout = self.shared.config.shutdown_timeout;
        let flushed = match tokio::time::timeout(timeout, self.drain()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::DeadlineExceeded(timeout)),
        };
        if let Err(e) = &flushed {
            let abandoned = self.shared.abandon(e);
            error!(
                topic = %self.topic(),
                abandoned,
                reported = self.shared.on_failure.is_some(),
                error = %e,
                "Final flush failed"
            );
        }

        self.shared.writer.close().await?;
        debug!(topic = %self.topic(), "Batch producer closed");
        flushed
    }
}

impl Drop for BatchProducer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
