//! Retry and error classification for datastore calls.
//!
//! Every remote call goes through [`ResilientClient::execute`]. The policy
//! is split in two parts:
//!
//! - [`classify`] is a pure function deciding whether a [`TransportError`] is worth another
//!   attempt
//! - the retry driver repeats retryable calls with exponential backoff and escalates the final
//!   failure into a [`StoreError`]
//!
//! # Classification
//!
//! | Failure | Decision |
//! |---------|----------|
//! | timeout, connection | retry; [`StoreError::Unreachable`] once exhausted |
//! | authentication | fatal immediately |
//! | authorization | fatal immediately, names the operation |
//! | bulk items | fatal if any status is not retryable, otherwise retry |
//! | API status | retry for 429, 502, 503, 504; fatal otherwise |
//! | anything else | fatal immediately |
//!
//! # Backoff Strategy
//!
//! The wait before retry `k` is `base_delay * 2^k + base_delay * jitter`
//! with `jitter` uniform in `[0, 1)`, see [`RetryPolicy::backoff`]. The
//! calling thread blocks for the whole wait; bound the call externally if a
//! deadline is needed.

use std::{fmt, sync::Arc, time::Duration};

use benchmark_metrics::{Endpoint, StoreError, StoreResult};
use fail::fail_point;
use rand::Rng;

use crate::{
    config::RetryPolicy,
    error::{TransportError, TransportResult},
    transport::Transport,
};

/// Status codes that indicate an overloaded or restarting datastore.
pub const RETRYABLE_STATUS_CODES: [u16; 4] = [429, 502, 503, 504];

/// Whether a status code is in [`RETRYABLE_STATUS_CODES`].
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS_CODES.contains(&status)
}

/// Outcome of [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Repeat the call while the retry budget lasts.
    Retry,
    /// Give up immediately.
    Fatal,
}

/// Decides whether a failed call should be repeated.
#[must_use]
pub fn classify(error: &TransportError) -> Disposition {
    match error {
        TransportError::Timeout { .. } | TransportError::Connection { .. } => Disposition::Retry,
        TransportError::Authentication | TransportError::Authorization => Disposition::Fatal,
        TransportError::Bulk { items } => {
            if items.iter().all(|item| is_retryable_status(item.status)) {
                Disposition::Retry
            } else {
                Disposition::Fatal
            }
        },
        TransportError::Api { status, .. } if is_retryable_status(*status) => Disposition::Retry,
        TransportError::Api { .. } | TransportError::Other { .. } => Disposition::Fatal,
    }
}

/// Blocks the calling thread between attempts.
pub trait Sleeper: fmt::Debug + Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by [`std::thread::sleep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A [`Transport`] wrapped with the retry policy.
///
/// The client keeps no state across calls; the attempt counter lives in a
/// single [`execute`](Self::execute) invocation. Clones share the
/// transport.
#[derive(Debug, Clone)]
pub struct ResilientClient {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl ResilientClient {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy, sleeper: Arc::new(ThreadSleeper) }
    }

    /// Replaces the sleeper used between attempts.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.transport.endpoint()
    }

    /// Runs `call` until it succeeds, fails fatally or the retry budget is
    /// spent.
    ///
    /// # Errors
    ///
    /// Returns the escalated [`StoreError`] of the last attempt.
    #[tracing::instrument(skip(self, call), fields(max_retries = self.policy.max_retries))]
    pub fn execute<T, F>(&self, operation: &str, mut call: F) -> StoreResult<T>
    where
        F: FnMut(&dyn Transport) -> TransportResult<T>,
    {
        let mut attempt: u32 = 0;
        loop {
            let error = match call(self.transport.as_ref()) {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(operation, attempt = attempt + 1, "operation succeeded after retry");
                    }
                    return Ok(value);
                },
                Err(error) => error,
            };

            let attempts = attempt + 1;
            match classify(&error) {
                Disposition::Retry if attempt < self.policy.max_retries => {
                    let delay = self.policy.backoff(attempt, rand::rng().random::<f64>());
                    tracing::debug!(
                        operation,
                        attempt = attempts,
                        max_attempts = self.policy.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient error, retrying after backoff",
                    );
                    fail_point!("resilient-before-sleep", |_| Err(self.escalate(
                        operation,
                        attempts,
                        error.clone()
                    )));
                    self.sleeper.sleep(delay);
                    attempt += 1;
                },
                Disposition::Retry | Disposition::Fatal => {
                    return Err(self.escalate(operation, attempts, error));
                },
            }
        }
    }

    /// Converts the final transport failure into a store error.
    fn escalate(&self, operation: &str, attempts: u32, error: TransportError) -> StoreError {
        let endpoint = self.transport.endpoint();
        let operation = operation.to_owned();
        let escalated = match error {
            TransportError::Timeout { message } | TransportError::Connection { message } => {
                StoreError::Unreachable { operation, endpoint, attempts, message }
            },
            TransportError::Authentication => StoreError::Authentication { endpoint },
            TransportError::Authorization => StoreError::Authorization { operation, endpoint },
            TransportError::Bulk { items } => {
                let first_fatal = items
                    .iter()
                    .find(|item| !is_retryable_status(item.status))
                    .map(|item| item.error_type.clone());
                match first_fatal {
                    Some(error_type) => StoreError::BulkRejected { error_type, errors: items },
                    None => StoreError::BulkExhausted { errors: items },
                }
            },
            TransportError::Api { status, reason } => {
                StoreError::Api { operation, endpoint, status, reason }
            },
            TransportError::Other { message } => StoreError::Transport { operation, endpoint, message },
        };
        tracing::error!(attempts, error = %escalated, "giving up on metrics store operation");
        escalated
    }
}
