//! Composed retry + circuit breaker executor.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::circuit::{CallOutcome, CircuitBreaker};
use crate::config::ResilienceConfig;
use crate::error::{ErrorClass, ProviderError, ResilienceError};
use crate::retry::RetryPolicy;

/// Result of a single attempt, before retry decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    Provider(ProviderError),
    CircuitOpen { retry_after: Duration },
    Canceled,
}

/// Run one attempt through the breaker for `key`.
///
/// The attempt future is never polled when the circuit rejects it.
/// Cancellation is not counted as a failure, and neither is dropping the
/// returned future mid-attempt.
pub async fn with_circuit_breaker<T, Fut>(
    breaker: &CircuitBreaker,
    key: &str,
    attempt: Fut,
) -> Result<T, AttemptError>
where
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let permit = breaker
        .acquire(key)
        .map_err(|retry_after| AttemptError::CircuitOpen { retry_after })?;

    let result = attempt.await;
    permit.record(match &result {
        Ok(_) => CallOutcome::Success,
        Err(AttemptError::Provider(_)) => CallOutcome::Failure,
        Err(_) => CallOutcome::Ignored,
    });
    result
}

/// Retry transient failures per `policy`.
///
/// `attempt` receives the 1-indexed attempt number. Cancellation is checked
/// before each attempt and interrupts the backoff sleep.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    key: &str,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T, ResilienceError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let mut attempts = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(ResilienceError::Canceled);
        }
        attempts += 1;

        let err = match attempt(attempts).await {
            Ok(value) => return Ok(value),
            Err(AttemptError::Canceled) => return Err(ResilienceError::Canceled),
            Err(AttemptError::CircuitOpen { retry_after }) => {
                debug!(dependency = key, ?retry_after, "call rejected by open circuit");
                return Err(ResilienceError::CircuitOpen {
                    key: key.to_string(),
                    retry_after,
                });
            }
            Err(AttemptError::Provider(err)) => err,
        };

        if err.class() == ErrorClass::NonTransient {
            warn!(dependency = key, attempt = attempts, error = %err, "non-transient failure");
            return Err(ResilienceError::Rejected(err));
        }
        if !policy.should_retry(attempts) {
            warn!(dependency = key, attempts, error = %err, "retries exhausted");
            return Err(ResilienceError::RetriesExhausted {
                attempts,
                last: err,
            });
        }

        let delay = policy.delay_for_attempt(attempts);
        warn!(
            dependency = key,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(ResilienceError::Canceled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Bound a provider call by the caller's token and an optional timeout.
async fn guarded<T, Fut>(
    call: Fut,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<T, AttemptError>
where
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let bounded = async move {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(format!(
                    "attempt exceeded {}ms",
                    limit.as_millis()
                ))),
            },
            None => call.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AttemptError::Canceled),
        result = bounded => result.map_err(AttemptError::Provider),
    }
}

/// Executes dependency calls through retry (outer) and circuit breaker (inner).
#[derive(Debug)]
pub struct ResiliencePipeline {
    config: ResilienceConfig,
    breaker: CircuitBreaker,
}

impl ResiliencePipeline {
    pub fn new(config: ResilienceConfig) -> Self {
        let breaker = CircuitBreaker::new(config.breaker.clone());
        Self { config, breaker }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Call `operation` under the circuit for `key`, retrying transient failures.
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        mut operation: F,
        cancel: &CancellationToken,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let timeout = self.config.attempt_timeout;
        with_retry(&self.config.retry, key, cancel, |_attempt| {
            let call = guarded(operation(), timeout, cancel);
            with_circuit_breaker(&self.breaker, key, call)
        })
        .await
    }
}

impl Default for ResiliencePipeline {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::circuit::CircuitState;
    use crate::error::ProviderErrorKind;

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    fn transient() -> ProviderError {
        ProviderError::new(ProviderErrorKind::RateLimited, "429 too many requests")
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_until_success() {
        let pipeline = ResiliencePipeline::default();
        let calls = counter();
        let token = CancellationToken::new();

        let c = calls.clone();
        let result = pipeline
            .execute(
                "tts:synthesize",
                move || {
                    let c = c.clone();
                    async move {
                        let n = c.fetch_add(1, Ordering::SeqCst);
                        if n == 0 { Err(transient()) } else { Ok::<_, ProviderError>("audio.wav") }
                    }
                },
                &token,
            )
            .await;

        assert_eq!(result.unwrap(), "audio.wav");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_failure_is_not_retried() {
        let pipeline = ResiliencePipeline::default();
        let calls = counter();
        let token = CancellationToken::new();

        let c = calls.clone();
        let result: Result<(), _> = pipeline
            .execute(
                "tts:synthesize",
                move || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(ProviderError::new(ProviderErrorKind::Unauthorized, "bad key"))
                    }
                },
                &token,
            )
            .await;

        assert!(matches!(result, Err(ResilienceError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempt_budget() {
        let pipeline = ResiliencePipeline::default();
        let calls = counter();
        let token = CancellationToken::new();

        let c = calls.clone();
        let result: Result<(), _> = pipeline
            .execute(
                "llm:generate",
                move || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(transient())
                    }
                },
                &token,
            )
            .await;

        match result {
            Err(ResilienceError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last.kind, ProviderErrorKind::RateLimited);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn canceled_before_call_never_invokes_dependency() {
        let pipeline = ResiliencePipeline::default();
        let calls = counter();
        let token = CancellationToken::new();
        token.cancel();

        let c = calls.clone();
        let result: Result<(), _> = pipeline
            .execute(
                "llm:generate",
                move || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), ProviderError>(())
                    }
                },
                &token,
            )
            .await;

        assert_eq!(result, Err(ResilienceError::Canceled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_retrying() {
        let pipeline = Arc::new(ResiliencePipeline::default());
        let calls = counter();
        let token = CancellationToken::new();

        let task = {
            let pipeline = pipeline.clone();
            let token = token.clone();
            let c = calls.clone();
            tokio::spawn(async move {
                pipeline
                    .execute(
                        "llm:generate",
                        move || {
                            let c = c.clone();
                            async move {
                                c.fetch_add(1, Ordering::SeqCst);
                                Err::<(), _>(transient())
                            }
                        },
                        &token,
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        assert_eq!(task.await.unwrap(), Err(ResilienceError::Canceled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_counts_as_transient() {
        let config = ResilienceConfig::default()
            .with_retry(RetryPolicy::fixed(2, Duration::from_millis(10)))
            .with_attempt_timeout(Some(Duration::from_secs(1)));
        let pipeline = ResiliencePipeline::new(config);
        let calls = counter();
        let token = CancellationToken::new();

        let c = calls.clone();
        let result = pipeline
            .execute(
                "images:generate",
                move || {
                    let c = c.clone();
                    async move {
                        let n = c.fetch_add(1, Ordering::SeqCst);
                        if n == 0 {
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                        Ok::<_, ProviderError>(n)
                    }
                },
                &token,
            )
            .await;

        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_fails_fast_without_calling() {
        let config = ResilienceConfig::default().with_retry(RetryPolicy::no_retry());
        let pipeline = ResiliencePipeline::new(config);
        let calls = counter();
        let token = CancellationToken::new();

        for _ in 0..5 {
            let c = calls.clone();
            let _ = pipeline
                .execute(
                    "tts:synthesize",
                    move || {
                        let c = c.clone();
                        async move {
                            c.fetch_add(1, Ordering::SeqCst);
                            Err::<(), _>(transient())
                        }
                    },
                    &token,
                )
                .await;
        }
        assert_eq!(pipeline.breaker().state("tts:synthesize"), CircuitState::Open);

        let c = calls.clone();
        let result = pipeline
            .execute(
                "tts:synthesize",
                move || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), ProviderError>(())
                    }
                },
                &token,
            )
            .await;

        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_does_not_wedge_the_circuit() {
        let config = ResilienceConfig::default().with_retry(RetryPolicy::no_retry());
        let pipeline = ResiliencePipeline::new(config);
        let token = CancellationToken::new();

        for _ in 0..5 {
            let _ = pipeline
                .execute("render:encode", || async { Err::<(), _>(transient()) }, &token)
                .await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let hung = pipeline.execute(
            "render:encode",
            || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<(), ProviderError>(())
            },
            &token,
        );
        assert!(tokio::time::timeout(Duration::from_millis(10), hung).await.is_err());
        assert_eq!(pipeline.breaker().state("render:encode"), CircuitState::HalfOpen);

        let result = pipeline
            .execute("render:encode", || async { Ok::<_, ProviderError>("out.mp4") }, &token)
            .await;
        assert_eq!(result.unwrap(), "out.mp4");
        assert_eq!(pipeline.breaker().state("render:encode"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_open_mid_retry_is_not_retried() {
        let config = ResilienceConfig::default()
            .with_retry(RetryPolicy::fixed(10, Duration::from_millis(10)));
        let pipeline = ResiliencePipeline::new(config);
        let calls = counter();
        let token = CancellationToken::new();

        let c = calls.clone();
        let result: Result<(), _> = pipeline
            .execute(
                "tts:synthesize",
                move || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(transient())
                    }
                },
                &token,
            )
            .await;

        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
