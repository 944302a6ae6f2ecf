//! Bounded, predicate-gated retry with a fixed backoff and an absolute
//! deadline, plus the cooperative cancellation signal every loop honours.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Why a retry loop ended without a value.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The cancellation signal fired. Checked before every attempt and
    /// raced against every backoff sleep.
    Cancelled,
    /// A retryable error was still being returned when the deadline passed.
    DeadlineExceeded {
        operation: String,
        attempts: u32,
        last_error: E,
    },
    /// The operation returned an error the predicate does not retry.
    Fatal(E),
}

/// Sender side of the shutdown signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiver side of the shutdown signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn new() -> (CancelHandle, Cancellation) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Cancellation { rx })
    }

    /// A signal that never fires.
    pub fn never() -> Cancellation {
        let (_tx, rx) = watch::channel(false);
        Cancellation { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the sender
    /// is gone without having cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for `duration` unless cancelled first. Returns `false` on
    /// cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Cancellation::never()
    }
}

/// Deadline for a loop starting now.
pub fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout
}

/// Fixed backoff and overall timeout of one polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn new(backoff: Duration, timeout: Duration) -> Self {
        Self { backoff, timeout }
    }

    /// Deadline of a loop entered now.
    pub fn deadline(&self) -> Instant {
        deadline_after(self.timeout)
    }
}

/// Invoke `op` until it succeeds, returns a non-retryable error, the
/// deadline passes or `cancel` fires.
///
/// `op` always runs at least once, even when `deadline` is already in the
/// past; in that case its error is returned without sleeping. Sleeps never
/// extend past the deadline, so the last attempt happens at the deadline
/// at the latest. `op` receives the 1-based attempt number.
pub async fn retry_until<T, E, F, Fut, P>(
    operation: &str,
    deadline: Instant,
    backoff: Duration,
    cancel: &Cancellation,
    is_retryable: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempts = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempts += 1;

        let err = match op(attempts).await {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) => return Err(RetryError::Fatal(e)),
            Err(e) => e,
        };

        let now = Instant::now();
        if now >= deadline {
            return Err(RetryError::DeadlineExceeded {
                operation: operation.to_string(),
                attempts,
                last_error: err,
            });
        }

        debug!(
            operation,
            attempt = attempts,
            error = %err,
            "[Retry] retryable failure, backing off"
        );
        let wait = backoff.min(deadline.saturating_duration_since(now));
        if !cancel.sleep(wait).await {
            return Err(RetryError::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Retry,
        Stop,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    fn retryable(e: &TestError) -> bool {
        *e == TestError::Retry
    }

    #[tokio::test(start_paused = true)]
    async fn retries_k_times_then_succeeds() {
        let calls = AtomicU32::new(0);
        let out = retry_until(
            "k-then-ok",
            deadline_after(Duration::from_secs(60)),
            Duration::from_secs(1),
            &Cancellation::never(),
            retryable,
            |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(TestError::Retry)
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;

        assert!(matches!(out, Ok(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn past_deadline_runs_once_without_sleeping() {
        let start = Instant::now();
        let deadline = start - Duration::from_millis(1);
        let calls = AtomicU32::new(0);

        let out: Result<(), _> = retry_until(
            "expired",
            deadline,
            Duration::from_secs(5),
            &Cancellation::never(),
            retryable,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Retry) }
            },
        )
        .await;

        assert!(matches!(
            out,
            Err(RetryError::DeadlineExceeded { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_stop_immediately() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = retry_until(
            "fatal",
            deadline_after(Duration::from_secs(60)),
            Duration::from_secs(1),
            &Cancellation::never(),
            retryable,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Stop) }
            },
        )
        .await;

        assert!(matches!(out, Err(RetryError::Fatal(TestError::Stop))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_total_latency() {
        let start = Instant::now();
        let out: Result<(), _> = retry_until(
            "slow",
            deadline_after(Duration::from_secs(10)),
            Duration::from_secs(3),
            &Cancellation::never(),
            retryable,
            |_| async { Err(TestError::Retry) },
        )
        .await;

        // Attempts at 0, 3, 6, 9 and a final one clamped to 10.
        assert!(matches!(
            out,
            Err(RetryError::DeadlineExceeded { attempts: 5, .. })
        ));
        assert_eq!(Instant::now() - start, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let (handle, cancel) = Cancellation::new();
        let calls = AtomicU32::new(0);

        let loop_fut = retry_until(
            "cancelled",
            deadline_after(Duration::from_secs(600)),
            Duration::from_secs(30),
            &cancel,
            retryable,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Retry) }
            },
        );
        let canceller = async {
            tokio::time::sleep(Duration::from_secs(45)).await;
            handle.cancel();
        };
        let (out, _) = tokio::join!(loop_fut, canceller);

        assert!(matches!(out, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let (handle, cancel) = Cancellation::new();
        handle.cancel();
        let out: Result<(), RetryError<TestError>> = retry_until(
            "never-started",
            deadline_after(Duration::from_secs(1)),
            Duration::from_millis(10),
            &cancel,
            retryable,
            |_| async { Ok(()) },
        )
        .await;
        assert!(matches!(out, Err(RetryError::Cancelled)));
    }
}
