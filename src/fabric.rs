//! Timeout, retry, and circuit-breaker primitives.
//!
//! Every browser-facing call in the service goes through one of these
//! wrappers; no other module races futures against deadlines or invents its
//! own backoff. Cancellation is cooperative: a timed-out future is dropped,
//! and the underlying CDP round-trip dies when its transport notices.

use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub enum FabricError<E> {
    Timeout { label: String, timeout: Duration },

    RetryExhausted {
        attempts: u32,
        last: Box<FabricError<E>>,
    },

    CircuitOpen,

    Inner(E),
}

// Derived via a manual impl rather than `#[derive(thiserror::Error)]`: thiserror
// would add a `Box<FabricError<E>>: Display` where-clause for the
// `RetryExhausted` variant's interpolated `{last}`, and resolving that bound
// recursively through the stdlib's blanket `Box<T>: Display` overflows the
// trait solver.
impl<E: fmt::Display> fmt::Display for FabricError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FabricError::Timeout { label, timeout } => {
                write!(f, "{label} timed out after {timeout:?}")
            }
            FabricError::RetryExhausted { attempts, last } => {
                write!(f, "retries exhausted after {attempts} attempts: {last}")
            }
            FabricError::CircuitOpen => write!(f, "circuit open"),
            FabricError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for FabricError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FabricError::RetryExhausted { last, .. } => Some(last.as_ref()),
            FabricError::Inner(e) => e.source(),
            _ => None,
        }
    }
}

impl<E> FabricError<E> {
    /// Whether the terminal cause was a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        match self {
            FabricError::Timeout { .. } => true,
            FabricError::RetryExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }
}

/// Race `op` against a deadline.
pub async fn with_timeout<T, E, F>(
    op: F,
    timeout: Duration,
    label: &str,
) -> Result<T, FabricError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(timeout, op).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(FabricError::Inner(e)),
        Err(_) => Err(FabricError::Timeout {
            label: label.to_string(),
            timeout,
        }),
    }
}

/// Retry policy for [`with_retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts (a value of 3 means up to 3 tries).
    pub retries: u32,
    /// Base delay; the sleep after failed attempt `i` is `backoff * 2^i`.
    pub backoff: Duration,
    /// Per-attempt deadline.
    pub timeout: Duration,
}

/// Attempt `make_op()` up to `policy.retries` times with exponential backoff.
///
/// Each attempt runs under `policy.timeout`. Terminal failure wraps the last
/// error so callers can distinguish a timeout from an operation error.
pub async fn with_retry<T, E, F, Fut>(
    mut make_op: F,
    policy: RetryPolicy,
    label: &str,
) -> Result<T, FabricError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.retries.max(1);
    let mut last: Option<FabricError<E>> = None;

    for attempt in 0..attempts {
        match with_timeout(make_op(), policy.timeout, label).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::debug!(label, attempt, error = %describe(&e), "attempt failed");
                last = Some(e);
            }
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(policy.backoff * 2u32.pow(attempt)).await;
        }
    }

    Err(FabricError::RetryExhausted {
        attempts,
        last: Box::new(last.unwrap_or(FabricError::CircuitOpen)),
    })
}

fn describe<E>(e: &FabricError<E>) -> &'static str {
    match e {
        FabricError::Timeout { .. } => "timeout",
        FabricError::RetryExhausted { .. } => "retry exhausted",
        FabricError::CircuitOpen => "circuit open",
        FabricError::Inner(_) => "operation error",
    }
}

/// Run `op`; on failure invoke `on_error` and return `fallback`.
///
/// Never propagates. This is the wrapper for best-effort paths (cleanup,
/// screencast stop, page reset) where an error must not take down the caller.
pub async fn safe<T, E, F, H>(op: F, fallback: T, on_error: H) -> T
where
    F: Future<Output = Result<T, E>>,
    H: FnOnce(&E),
{
    match op.await {
        Ok(value) => value,
        Err(e) => {
            on_error(&e);
            fallback
        }
    }
}

/// Snapshot of breaker state for the health endpoint.
#[derive(Debug, Clone, Copy)]
pub struct BreakerState {
    pub is_open: bool,
    pub failures: u32,
    pub last_failure_at: Option<Instant>,
}

#[derive(Debug)]
struct BreakerInner {
    failures: u32,
    last_failure_at: Option<Instant>,
    open: bool,
}

/// Two-state circuit breaker (Closed/Open).
///
/// Half-open behavior is collapsed into an eager reset: once `reset_after`
/// has elapsed since the last failure, the next call is attempted, and a
/// success closes the breaker and zeroes the counter.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    reset_after: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_after: Duration) -> Self {
        Self {
            threshold,
            reset_after,
            inner: Mutex::new(BreakerInner {
                failures: 0,
                last_failure_at: None,
                open: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerState {
            is_open: inner.open,
            failures: inner.failures,
            last_failure_at: inner.last_failure_at,
        }
    }

    /// Run `op` through the breaker.
    ///
    /// While open and within the reset window every call fails fast with
    /// `CircuitOpen` without invoking `op`.
    pub async fn run<T, E, F>(&self, op: F) -> Result<T, FabricError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        {
            let inner = self.inner.lock().expect("breaker lock poisoned");
            if inner.open {
                let elapsed_past_reset = inner
                    .last_failure_at
                    .map(|at| at.elapsed() > self.reset_after)
                    .unwrap_or(true);
                if !elapsed_past_reset {
                    return Err(FabricError::CircuitOpen);
                }
                tracing::info!("circuit breaker reset window elapsed, attempting call");
            }
        }

        match op.await {
            Ok(value) => {
                let mut inner = self.inner.lock().expect("breaker lock poisoned");
                inner.failures = 0;
                inner.open = false;
                Ok(value)
            }
            Err(e) => {
                let mut inner = self.inner.lock().expect("breaker lock poisoned");
                inner.failures += 1;
                inner.last_failure_at = Some(Instant::now());
                if inner.failures >= self.threshold && !inner.open {
                    inner.open = true;
                    tracing::warn!(
                        failures = inner.failures,
                        threshold = self.threshold,
                        "circuit breaker opened"
                    );
                }
                Err(FabricError::Inner(e))
            }
        }
    }
}
