//! Retry policies and the retry loop
//!
//! Policies are pure decision objects: every input (attempt count, the outcome of
//! the failed attempt, the caller's cancellation token) is passed in, nothing is
//! stored between calls. The loop that consumes them lives in [`execute`].

use crate::error::{ClientError, ClientResult};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// HTTP statuses the backend uses for transient conditions
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// What a failed attempt produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The request never produced a response (connect, TLS, timeout, reset)
    Transport,
    /// The server answered with this status
    Status(u16),
}

impl AttemptOutcome {
    /// Outcome carried by an error, if the error came from a wire attempt at all
    pub fn from_error(error: &ClientError) -> Option<Self> {
        match error {
            ClientError::Transport { .. } => Some(AttemptOutcome::Transport),
            ClientError::Api(e) => e.http_status.map(AttemptOutcome::Status),
            _ => None,
        }
    }
}

/// Decides whether a failed attempt is retried and how long to wait first
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn max_retries(&self) -> u32;

    /// Wait before retry number `attempt` (1-based; 0 is treated as 1)
    fn wait_time(&self, attempt: u32) -> Duration;

    /// `retries_so_far` counts retries already performed, not the initial attempt
    fn should_retry(
        &self,
        retries_so_far: u32,
        outcome: &AttemptOutcome,
        cancel: &CancellationToken,
    ) -> bool {
        if retries_so_far >= self.max_retries() || cancel.is_cancelled() {
            return false;
        }
        match outcome {
            AttemptOutcome::Transport => true,
            AttemptOutcome::Status(status) => is_retryable_status(*status),
        }
    }
}

/// Exponential backoff: `min_wait * factor^(attempt-1)` clamped to `[min_wait, max_wait]`
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    min_wait: Duration,
    max_wait: Duration,
    factor: f64,
    jitter: bool,
    max_retries: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            min_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
            factor: 2.0,
            jitter: true,
            max_retries: 3,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_min_wait(mut self, min_wait: Duration) -> Self {
        self.min_wait = min_wait;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Factors below 1.0 (or NaN) are treated as 1.0 so waits never shrink
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = if factor.is_nan() { 1.0 } else { factor.max(1.0) };
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    fn ceiling(&self) -> Duration {
        self.max_wait.max(self.min_wait)
    }

    fn base_wait(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.min_wait;
        }
        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let secs = self.min_wait.as_secs_f64() * self.factor.powi(exponent);
        let ceiling = self.ceiling();
        if !secs.is_finite() || secs >= ceiling.as_secs_f64() {
            ceiling
        } else {
            Duration::from_secs_f64(secs).max(self.min_wait)
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn name(&self) -> &'static str {
        "exponential_backoff"
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn wait_time(&self, attempt: u32) -> Duration {
        let base = self.base_wait(attempt);
        if !self.jitter {
            return base;
        }
        // Up to 10% extra, never below the unjittered wait and never past the ceiling.
        let extra = base.mul_f64(0.1 * fastrand::f64());
        base.saturating_add(extra).min(self.ceiling()).max(base)
    }
}

/// Same delay before every retry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedDelay {
    delay: Duration,
    max_retries: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }
}

impl RetryPolicy for FixedDelay {
    fn name(&self) -> &'static str {
        "fixed_delay"
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn wait_time(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Never retries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn name(&self) -> &'static str {
        "no_retry"
    }

    fn max_retries(&self) -> u32 {
        0
    }

    fn wait_time(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }

    fn should_retry(
        &self,
        _retries_so_far: u32,
        _outcome: &AttemptOutcome,
        _cancel: &CancellationToken,
    ) -> bool {
        false
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long an open circuit rejects requests before letting one through
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Fails requests fast after repeated transport failures or 5xx answers.
///
/// Shared by every client of one factory. After `recovery_timeout` a single
/// trial request is let through; its outcome closes or re-opens the circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU32,
    /// Milliseconds since `epoch` of the last trip or trial
    changed_at_ms: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            changed_at_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Admit or reject one request
    pub fn can_proceed(&self, operation: &str) -> ClientResult<()> {
        match self.state() {
            CircuitState::Closed => Ok(()),
            current => {
                if !self.recovery_elapsed() {
                    return Err(ClientError::CircuitOpen {
                        operation: operation.to_string(),
                    });
                }
                // Only the caller that wins the swap sends the trial request.
                let claimed = self.state.compare_exchange(
                    current as u8,
                    CircuitState::HalfOpen as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                if claimed.is_err() {
                    return Err(ClientError::CircuitOpen {
                        operation: operation.to_string(),
                    });
                }
                self.touch();
                debug!(operation, "circuit breaker half-open, sending trial request");
                Ok(())
            }
        }
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Release);
        let recovered = self.state.compare_exchange(
            CircuitState::HalfOpen as u8,
            CircuitState::Closed as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if recovered.is_ok() {
            info!("circuit breaker closed");
        }
    }

    pub fn record_failure(&self, operation: &str) {
        let failures = self.failure_count.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        match self.state() {
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                self.trip();
                warn!(operation, failures, "circuit breaker opened");
            }
            CircuitState::HalfOpen => {
                self.trip();
                warn!(operation, "circuit breaker trial failed, re-opening");
            }
            _ => {}
        }
    }

    pub fn reset(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        debug!("circuit breaker reset");
    }

    fn trip(&self) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        self.touch();
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis().min(u64::MAX as u128) as u64;
        self.changed_at_ms.store(now, Ordering::Release);
    }

    fn recovery_elapsed(&self) -> bool {
        let since = Duration::from_millis(self.changed_at_ms.load(Ordering::Acquire));
        self.epoch.elapsed().saturating_sub(since) >= self.config.recovery_timeout
    }
}

/// Run `attempt_fn` until it succeeds, the policy declines, or `cancel` fires.
///
/// Attempts are strictly sequential. `attempt_fn` receives the 1-based attempt
/// number. Errors that did not come from a wire attempt (precondition failures)
/// are returned immediately. On exhaustion the error of the last attempt is
/// returned; on cancellation `ClientError::Cancelled` is returned instead.
pub async fn execute<T, F, Fut>(
    policy: &dyn RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut attempt_fn: F,
) -> ClientResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ClientResult<T>>,
{
    if cancel.is_cancelled() {
        return Err(ClientError::cancelled(operation));
    }

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::cancelled(operation)),
            result = attempt_fn(attempt) => result,
        };

        let error = match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        let Some(outcome) = AttemptOutcome::from_error(&error) else {
            return Err(error);
        };

        if !policy.should_retry(attempt - 1, &outcome, cancel) {
            if cancel.is_cancelled() {
                return Err(ClientError::cancelled(operation));
            }
            if attempt > 1 {
                warn!(
                    operation,
                    attempts = attempt,
                    policy = policy.name(),
                    "giving up: {}",
                    error
                );
            }
            return Err(error);
        }

        let wait = policy.wait_time(attempt);
        debug!(operation, attempt, ?wait, ?outcome, "attempt failed, retrying");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::cancelled(operation)),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, NormalizedError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policies() -> Vec<Box<dyn RetryPolicy>> {
        vec![
            Box::new(ExponentialBackoff::new().with_max_retries(3).with_jitter(false)),
            Box::new(FixedDelay::new(Duration::from_millis(5), 3)),
        ]
    }

    fn status_error(status: u16) -> ClientError {
        NormalizedError::new(ErrorKind::from_status(status), Some(status), "failed").into()
    }

    #[test]
    fn test_network_errors_retry_until_cap() {
        let cancel = CancellationToken::new();
        for policy in policies() {
            let retries =
                |attempt| policy.should_retry(attempt, &AttemptOutcome::Transport, &cancel);
            for attempt in 0..policy.max_retries() {
                assert!(retries(attempt), "{}", policy.name());
            }
            for attempt in policy.max_retries()..policy.max_retries() + 3 {
                assert!(!retries(attempt), "{}", policy.name());
            }
        }
        assert!(!NoRetry.should_retry(0, &AttemptOutcome::Transport, &cancel));
    }

    #[test]
    fn test_only_retryable_statuses_retry() {
        let cancel = CancellationToken::new();
        for policy in policies() {
            for status in (200..=599).step_by(1) {
                let expected = matches!(status, 429 | 500 | 502 | 503 | 504);
                assert_eq!(
                    policy.should_retry(0, &AttemptOutcome::Status(status), &cancel),
                    expected,
                    "{} status {}",
                    policy.name(),
                    status
                );
            }
        }
    }

    #[test]
    fn test_cancelled_token_never_retries() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        for policy in policies() {
            assert!(!policy.should_retry(0, &AttemptOutcome::Transport, &cancel));
            assert!(!policy.should_retry(0, &AttemptOutcome::Status(503), &cancel));
        }
    }

    #[test]
    fn test_exponential_wait_times() {
        let policy = ExponentialBackoff::new()
            .with_min_wait(Duration::from_millis(100))
            .with_max_wait(Duration::from_millis(1000))
            .with_factor(2.0)
            .with_jitter(false);

        assert_eq!(policy.wait_time(0), Duration::from_millis(100));
        assert_eq!(policy.wait_time(1), Duration::from_millis(100));
        assert_eq!(policy.wait_time(2), Duration::from_millis(200));
        assert_eq!(policy.wait_time(3), Duration::from_millis(400));
        assert_eq!(policy.wait_time(4), Duration::from_millis(800));
        assert_eq!(policy.wait_time(5), Duration::from_millis(1000));
        assert_eq!(policy.wait_time(u32::MAX), Duration::from_millis(1000));

        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let wait = policy.wait_time(attempt);
            assert!(wait >= previous);
            assert!(wait <= Duration::from_millis(1000));
            assert_eq!(wait, policy.wait_time(attempt));
            previous = wait;
        }
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = ExponentialBackoff::new()
            .with_min_wait(Duration::from_millis(100))
            .with_max_wait(Duration::from_secs(10))
            .with_jitter(true);

        for _ in 0..200 {
            let wait = policy.wait_time(3);
            assert!(wait >= Duration::from_millis(400));
            assert!(wait <= Duration::from_millis(440));
        }
        for _ in 0..50 {
            assert!(policy.wait_time(40) <= Duration::from_secs(10));
        }
    }

    #[test]
    fn test_fixed_and_no_retry_wait_times() {
        let fixed = FixedDelay::new(Duration::from_millis(250), 2);
        for attempt in [0, 1, 5, 100] {
            assert_eq!(fixed.wait_time(attempt), Duration::from_millis(250));
            assert_eq!(NoRetry.wait_time(attempt), Duration::ZERO);
        }
    }

    #[tokio::test]
    async fn test_execute_retries_until_success() {
        let policy = FixedDelay::new(Duration::from_millis(1), 3);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let result = execute(&policy, &cancel, "test", |_| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 4 {
                    Err(status_error(503))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_execute_surfaces_last_error() {
        let policy = FixedDelay::new(Duration::from_millis(1), 2);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let result: ClientResult<()> = execute(&policy, &cancel, "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                // last attempt fails differently so we can tell which error surfaced
                if attempt == 3 {
                    Err(status_error(502))
                } else {
                    Err(status_error(503))
                }
            }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.http_status(), Some(502));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_does_not_retry_terminal_status() {
        let policy = FixedDelay::new(Duration::from_millis(1), 5);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let result: ClientResult<()> = execute(&policy, &cancel, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(status_error(404)) }
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), Some(ErrorKind::NotFound));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_precondition_errors_fail_fast() {
        let policy = FixedDelay::new(Duration::from_millis(1), 5);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let result: ClientResult<()> = execute(&policy, &cancel, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClientError::invalid_argument("id", "empty")) }
        })
        .await;

        assert!(matches!(result, Err(ClientError::InvalidArgument { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_already_cancelled_makes_no_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));

        let result: ClientResult<()> = execute(&NoRetry, &cancel, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_sleep() {
        let policy = FixedDelay::new(Duration::from_secs(3600), 5);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result: ClientResult<()> = execute(&policy, &cancel, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClientError::transport("test", "connection reset")) }
        })
        .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(10),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_after_threshold() {
        let breaker = breaker(3);
        for _ in 0..2 {
            breaker.record_failure("jobs.list");
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_proceed("jobs.list").is_ok());

        breaker.record_failure("jobs.list");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            breaker.can_proceed("jobs.list"),
            Err(ClientError::CircuitOpen { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_success_resets_count() {
        let breaker = breaker(2);
        breaker.record_failure("ping");
        breaker.record_success();
        breaker.record_failure("ping");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_admits_one_trial_after_recovery() {
        let breaker = breaker(1);
        breaker.record_failure("ping");
        assert!(breaker.can_proceed("ping").is_err());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.can_proceed("ping").is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.can_proceed("ping").is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_proceed("ping").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_failed_trial_reopens() {
        let breaker = breaker(1);
        breaker.record_failure("ping");
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.can_proceed("ping").is_ok());

        breaker.record_failure("ping");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.can_proceed("ping").is_err());

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }
}
