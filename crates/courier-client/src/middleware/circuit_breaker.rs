//! Circuit Breaker Middleware
//!
//! Stops calling a handler that keeps failing, giving its dependencies time to
//! recover.
//!
//! ## State Transitions
//!
//! ```text
//! ┌────────┐  threshold consecutive failures  ┌──────┐
//! │ Closed │ ───────────────────────────────> │ Open │ <──────────┐
//! └───▲────┘                                  └──┬───┘            │
//!     │                                          │ reset_time     │ trial
//!     │ trial succeeds                           ▼ elapsed        │ fails
//!     │                                    ┌──────────┐           │
//!     └─────────────────────────────────── │ HalfOpen │ ──────────┘
//!                                          └──────────┘
//! ```
//!
//! - **Closed**: calls pass through; consecutive failures are counted and any
//!   success resets the count.
//! - **Open**: calls fail with `CircuitOpen` without invoking the handler.
//! - **HalfOpen**: exactly one trial call runs. Other calls arriving while the
//!   trial is in flight fail fast.
//!
//! The breaker owns its own lock; share it between consumers through `Arc`.

use super::{handler_fn, Handler, Middleware};
use crate::error::{ClientError, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - calls pass through
    Closed,
    /// Too many failures - reject calls immediately
    Open,
    /// Testing recovery - one trial call in flight
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker usable as middleware.
///
/// # Examples
///
/// ```ignore
/// let breaker = Arc::new(CircuitBreaker::new(3, Duration::from_secs(10)));
/// let handler = compose(my_handler, &[breaker.middleware()]);
///
/// if breaker.state() == CircuitState::Open {
///     warn!("downstream is unhealthy");
/// }
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    reset_time: Duration,
    inner: Mutex<BreakerState>,
}

/// Permission to run one call. Reports a failure if dropped unfinished, so an
/// abandoned trial cannot leave the breaker stuck half-open.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    finished: bool,
}

impl CallPermit<'_> {
    fn finish(mut self, success: bool) {
        self.finished = true;
        if success {
            self.breaker.on_success(self.trial);
        } else {
            self.breaker.on_failure(self.trial);
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.finished && self.trial {
            self.breaker.on_failure(true);
        }
    }
}

impl CircuitBreaker {
    /// Create a breaker that opens after `threshold` consecutive failures
    /// (at least 1) and allows one trial call after `reset_time`.
    pub fn new(threshold: u32, reset_time: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            reset_time,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures counted in the closed state.
    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    /// Force the breaker back to closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
    }

    fn acquire(&self) -> Result<CallPermit<'_>> {
        let mut inner = self.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.reset_time);
                if elapsed < self.reset_time {
                    return Err(ClientError::CircuitOpen);
                }
                inner.state = CircuitState::HalfOpen;
                info!("Circuit breaker half-open, allowing trial call");
                true
            }
            CircuitState::HalfOpen => return Err(ClientError::CircuitOpen),
        };
        Ok(CallPermit {
            breaker: self,
            trial,
            finished: false,
        })
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.state = CircuitState::Closed;
            inner.failures = 0;
            inner.opened_at = None;
            info!("Circuit breaker closed after successful trial");
        } else if inner.state == CircuitState::Closed {
            inner.failures = 0;
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!("Circuit breaker trial failed, reopening");
        } else if inner.state == CircuitState::Closed {
            inner.failures += 1;
            if inner.failures >= self.threshold {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(
                    failures = inner.failures,
                    threshold = self.threshold,
                    reset_ms = self.reset_time.as_millis() as u64,
                    "Circuit breaker opened"
                );
            }
        }
    }

    /// Middleware guarded by this breaker.
    pub fn middleware(self: &Arc<Self>) -> Middleware {
        let breaker = self.clone();
        Arc::new(move |next: Handler| {
            let breaker = breaker.clone();
            handler_fn(move |msg| {
                let next = next.clone();
                let breaker = breaker.clone();
                async move {
                    let permit = breaker.acquire()?;
                    let result = next(msg).await;
                    permit.finish(result.is_ok());
                    result
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::compose;
    use crate::middleware::test_support::message;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn switchable(fail: Arc<AtomicBool>, calls: Arc<AtomicUsize>) -> Handler {
        handler_fn(move |_msg| {
            let fail = fail.clone();
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail.load(Ordering::SeqCst) {
                    Err(ClientError::handler_msg("downstream error"))
                } else {
                    Ok(())
                }
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_fails_fast_and_recovers() {
        let breaker = Arc::new(CircuitBreaker::new(3, Duration::from_secs(10)));
        let fail = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = compose(
            switchable(fail.clone(), calls.clone()),
            &[breaker.middleware()],
        );

        for _ in 0..3 {
            assert!(matches!(
                handler(message(0)).await,
                Err(ClientError::Handler(_))
            ));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Before reset_time: fail fast without invoking the handler
        assert!(matches!(
            handler(message(0)).await,
            Err(ClientError::CircuitOpen)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // After reset_time: one trial, success closes the breaker
        tokio::time::advance(Duration::from_secs(11)).await;
        fail.store(false, Ordering::SeqCst);
        handler(message(0)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(5)));
        let fail = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = compose(switchable(fail, calls.clone()), &[breaker.middleware()]);

        let _ = handler(message(0)).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(6)).await;
        let _ = handler(message(0)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.state(), CircuitState::Open);

        // Timer restarted by the failed trial
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(matches!(
            handler(message(0)).await,
            Err(ClientError::CircuitOpen)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_while_half_open() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(1)));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = compose(
            handler_fn(move |msg| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if msg.offset == 0 {
                        return Err(ClientError::handler_msg("trip"));
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                }
            }),
            &[breaker.middleware()],
        );

        let _ = handler(message(0)).await;
        tokio::time::advance(Duration::from_secs(2)).await;

        let trial = tokio::spawn(handler(message(1)));
        tokio::task::yield_now().await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(matches!(
            handler(message(2)).await,
            Err(ClientError::CircuitOpen)
        ));

        trial.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_count() {
        let breaker = Arc::new(CircuitBreaker::new(3, Duration::from_secs(1)));
        let fail = Arc::new(AtomicBool::new(true));
        let handler = compose(
            switchable(fail.clone(), Arc::new(AtomicUsize::new(0))),
            &[breaker.middleware()],
        );

        let _ = handler(message(0)).await;
        let _ = handler(message(0)).await;
        assert_eq!(breaker.failure_count(), 2);

        fail.store(false, Ordering::SeqCst);
        handler(message(0)).await.unwrap();
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_reopens() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(1)));
        let handler = compose(
            handler_fn(|msg| async move {
                if msg.offset == 0 {
                    return Err(ClientError::handler_msg("trip"));
                }
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
            &[breaker.middleware()],
        );

        let _ = handler(message(0)).await;
        tokio::time::advance(Duration::from_secs(2)).await;

        let trial = handler(message(1));
        let _ = tokio::time::timeout(Duration::from_millis(10), trial).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
