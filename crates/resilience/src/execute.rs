use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::breaker::{
    Admission, BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker, Outcome,
};
use crate::error::{Classify, ResilienceError};
use crate::retry::RetryConfig;

pub(crate) const DEFAULT_MAX_CONCURRENT: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Global cap on wrapped operations in flight.
    pub max_concurrent: usize,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Per-call policy for [`Resilience::execute`].
#[derive(Debug, Clone)]
pub struct Policy {
    /// Operation name, used in error context and logs.
    pub operation: String,
    /// Identifier of the thing being operated on, if any.
    pub target: Option<String>,
    pub retryable: bool,
    /// Deadline for each individual attempt.
    pub timeout: Duration,
    pub breaker_key: Option<String>,
}

impl Policy {
    pub fn new(operation: impl Into<String>, timeout: Duration) -> Self {
        Self {
            operation: operation.into(),
            target: None,
            retryable: false,
            timeout,
            breaker_key: None,
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn breaker(mut self, key: impl Into<String>) -> Self {
        self.breaker_key = Some(key.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

type BreakerTable = Arc<Mutex<HashMap<String, CircuitBreaker>>>;

fn lock(table: &BreakerTable) -> MutexGuard<'_, HashMap<String, CircuitBreaker>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared resilience state: the admission semaphore and the breaker table.
///
/// Share via `Arc<Resilience>`; all methods take `&self`.
pub struct Resilience {
    config: ResilienceConfig,
    limiter: Arc<Semaphore>,
    breakers: BreakerTable,
}

impl Resilience {
    pub fn new(config: ResilienceConfig) -> Self {
        let permits = config.max_concurrent.max(1);
        Self {
            limiter: Arc::new(Semaphore::new(permits)),
            breakers: Arc::new(Mutex::new(HashMap::new())),
            config: ResilienceConfig {
                max_concurrent: permits,
                ..config
            },
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Number of wrapped operations currently admitted.
    pub fn in_flight(&self) -> usize {
        self.config
            .max_concurrent
            .saturating_sub(self.limiter.available_permits())
    }

    /// Snapshot of the breaker for `key`, if it has been used.
    pub fn breaker(&self, key: &str) -> Option<BreakerSnapshot> {
        lock(&self.breakers).get(key).map(CircuitBreaker::snapshot)
    }

    /// Force the breaker for `key` back to closed with cleared counters.
    pub fn reset_breaker(&self, key: &str) {
        if let Some(breaker) = lock(&self.breakers).get_mut(key) {
            *breaker = CircuitBreaker::new();
            info!(key, "circuit breaker reset");
        }
    }

    /// Run `op` under `policy`.
    ///
    /// `op` is invoked once per attempt. Errors from the operation are wrapped
    /// in [`ResilienceError::Failed`] with the policy's operation and target.
    pub async fn execute<T, E, F, Fut>(
        &self,
        policy: &Policy,
        mut op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let _permit = Arc::clone(&self.limiter).try_acquire_owned().map_err(|_| {
            debug!(operation = %policy.operation, "rejected by concurrency limiter");
            ResilienceError::ConcurrencyLimitExceeded {
                limit: self.config.max_concurrent,
            }
        })?;

        let mut ticket = match &policy.breaker_key {
            Some(key) => Some(self.admit(key)?),
            None => None,
        };

        let result = self.run_attempts(policy, &mut op).await;

        if let Some(ticket) = ticket.as_mut() {
            ticket.outcome = match &result {
                Ok(_) => Outcome::Success,
                Err(e) if !e.kind().trips_breaker() => Outcome::Released,
                Err(_) => Outcome::Failure,
            };
        }
        result
    }

    fn admit<E>(&self, key: &str) -> Result<Ticket, ResilienceError<E>> {
        let mut table = lock(&self.breakers);
        let breaker = table
            .entry(key.to_string())
            .or_insert_with(CircuitBreaker::new);
        match breaker.admit(&self.config.breaker, Instant::now()) {
            Some(admission) => {
                if admission == Admission::Probe {
                    info!(key, "circuit half-open, admitting probe");
                }
                Ok(Ticket {
                    breakers: Arc::clone(&self.breakers),
                    config: self.config.breaker,
                    key: key.to_string(),
                    admission,
                    outcome: Outcome::Released,
                })
            }
            None => Err(ResilienceError::CircuitOpen {
                key: key.to_string(),
            }),
        }
    }

    async fn run_attempts<T, E, F, Fut>(
        &self,
        policy: &Policy,
        op: &mut F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let max_attempts = if policy.retryable {
            self.config.retry.max_attempts.max(1)
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match tokio::time::timeout(policy.timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(source)) => ResilienceError::Failed {
                    operation: policy.operation.clone(),
                    target: policy.target.clone(),
                    attempts: attempt,
                    source,
                },
                Err(_) => ResilienceError::Timeout {
                    operation: policy.operation.clone(),
                    target: policy.target.clone(),
                    timeout: policy.timeout,
                },
            };

            if attempt >= max_attempts || !err.is_transient() {
                return Err(err);
            }

            let delay = self.config.retry.delay_for(attempt - 1);
            debug!(
                operation = %policy.operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                kind = %err.kind(),
                "transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Breaker admission held for the duration of one `execute` call.
///
/// The outcome is applied on drop, so a cancelled call releases its probe
/// slot instead of wedging the breaker in half-open.
struct Ticket {
    breakers: BreakerTable,
    config: BreakerConfig,
    key: String,
    admission: Admission,
    outcome: Outcome,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut table = lock(&self.breakers);
        let Some(breaker) = table.get_mut(&self.key) else {
            return;
        };
        let changed = breaker.record(self.admission, self.outcome, &self.config, Instant::now());
        match changed {
            Some(BreakerState::Open) => {
                warn!(key = %self.key, failures = breaker.snapshot().failure_count, "circuit opened");
            }
            Some(state) => info!(key = %self.key, %state, "circuit state changed"),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::ErrorKind;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("network unreachable")]
        Network,
        #[error("bad request")]
        BadRequest,
        #[error("handler crashed")]
        Crashed,
    }

    impl Classify for TestError {
        fn kind(&self) -> ErrorKind {
            match self {
                Self::Network => ErrorKind::Transport,
                Self::BadRequest => ErrorKind::Client,
                Self::Crashed => ErrorKind::Execution,
            }
        }
    }

    fn resilience(max_concurrent: usize) -> Resilience {
        Resilience::new(ResilienceConfig {
            max_concurrent,
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 10,
                multiplier: 2.0,
                max_delay_ms: 100,
                jitter: false,
            },
            breaker: BreakerConfig {
                failure_threshold: 3,
                reset_timeout_ms: 1_000,
            },
        })
    }

    fn policy() -> Policy {
        Policy::new("test-op", Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_is_retried_until_success() {
        let r = resilience(4);
        let calls = &AtomicU32::new(0);

        let result = r
            .execute(&policy().retryable(true), || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TestError::Network)
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_error_is_not_retried() {
        let r = resilience(4);
        let calls = &AtomicU32::new(0);

        let err = r
            .execute(&policy().retryable(true), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::BadRequest)
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts(), 1);
        assert_eq!(err.kind(), ErrorKind::Client);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_at_max_attempts() {
        let r = resilience(4);
        let calls = &AtomicU32::new(0);

        let err = r
            .execute(&policy().retryable(true), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::Network)
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_policy_runs_once() {
        let r = resilience(4);
        let calls = &AtomicU32::new(0);

        let _ = r
            .execute(&policy(), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::Network)
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_distinguishable() {
        let r = resilience(4);
        let err = r
            .execute(&Policy::new("slow", Duration::from_millis(50)), || async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, TestError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::Timeout { .. }));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(r.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_skips_operation() {
        let r = resilience(4);
        let calls = &AtomicU32::new(0);
        let p = policy().breaker("proxy");

        for _ in 0..3 {
            let _ = r
                .execute(&p, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError::Network)
                })
                .await;
        }
        assert_eq!(r.breaker("proxy").unwrap().state, BreakerState::Open);

        let err = r
            .execute(&p, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::CircuitOpen { ref key } if key == "proxy"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_after_reset_timeout_closes_circuit() {
        let r = resilience(4);
        let p = policy().breaker("command-exec");
        for _ in 0..3 {
            let _ = r
                .execute(&p, || async move { Err::<(), _>(TestError::Network) })
                .await;
        }
        assert_eq!(r.breaker("command-exec").unwrap().state, BreakerState::Open);

        tokio::time::advance(Duration::from_millis(1_001)).await;

        r.execute(&p, || async move { Ok::<_, TestError>(()) })
            .await
            .unwrap();

        let snap = r.breaker("command-exec").unwrap();
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_do_not_trip_breaker() {
        let r = resilience(4);
        let p = policy().breaker("functions");
        for _ in 0..5 {
            let _ = r
                .execute(&p, || async move { Err::<(), _>(TestError::BadRequest) })
                .await;
        }
        let snap = r.breaker("functions").unwrap();
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn execution_errors_do_not_trip_breaker() {
        let r = resilience(4);
        let p = policy().breaker("function-invoke");
        for _ in 0..5 {
            let err = r
                .execute(&p, || async move { Err::<(), _>(TestError::Crashed) })
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Execution);
        }
        let snap = r.breaker("function-invoke").unwrap();
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_breaker_closes_open_circuit() {
        let r = resilience(4);
        let p = policy().breaker("proxy");
        for _ in 0..3 {
            let _ = r
                .execute(&p, || async move { Err::<(), _>(TestError::Network) })
                .await;
        }
        assert_eq!(r.breaker("proxy").unwrap().state, BreakerState::Open);
        r.reset_breaker("proxy");
        assert_eq!(r.breaker("proxy").unwrap().state, BreakerState::Closed);
        assert!(r.breaker("unknown").is_none());
    }

    #[tokio::test]
    async fn excess_concurrent_calls_are_rejected() {
        let r = Arc::new(resilience(2));
        let gate = Arc::new(tokio::sync::Notify::new());

        let mut handles = Vec::new();
        for _ in 0..2 {
            let r = Arc::clone(&r);
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                r.execute(&policy(), || {
                    let gate = Arc::clone(&gate);
                    async move {
                        gate.notified().await;
                        Ok::<_, TestError>(())
                    }
                })
                .await
            }));
        }

        while r.in_flight() < 2 {
            tokio::task::yield_now().await;
        }

        let err = r
            .execute(&policy(), || async move { Ok::<_, TestError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrencyLimit);

        gate.notify_waiters();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(r.in_flight(), 0);
    }
}
