use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::store::StoreError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fixed-delay retry around a single store operation. Each attempt is bounded
/// by `attempt_timeout`; only transient failures are retried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub attempt_timeout: Duration,
    /// A timed-out attempt may still have committed server side. Non-idempotent
    /// operations turn this off and surface the timeout instead.
    pub retry_timeouts: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            delay: config.retry_delay(),
            attempt_timeout: config.transaction_timeout(),
            retry_timeouts: true,
        }
    }

    pub fn without_timeout_retry(self) -> Self {
        Self {
            retry_timeouts: false,
            ..self
        }
    }

    fn should_retry(&self, err: &StoreError) -> bool {
        match err {
            StoreError::Timeout(_) => self.retry_timeouts,
            other => other.is_transient(),
        }
    }

    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.attempt_timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(self.attempt_timeout)),
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !self.should_retry(&err) || attempt >= max_attempts || cancel.is_cancelled() {
                return Err(PipelineError::Store {
                    attempts: attempt,
                    source: err,
                });
            }
            tracing::debug!(operation, attempt, error = %err, "store operation failed; retrying");

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(PipelineError::Store { attempts: attempt, source: err });
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
            attempt_timeout: Duration::from_millis(200),
            retry_timeouts: true,
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = policy()
            .run("test", &CancellationToken::new(), move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Unavailable("down".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.expect("third attempt succeeds"), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = policy()
            .run("test", &CancellationToken::new(), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Rejected("constraint".to_string()))
            })
            .await;
        assert!(matches!(result, Err(PipelineError::Store { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_attempts_time_out_and_exhaust() {
        let mut policy = policy();
        policy.attempt_timeout = Duration::from_millis(5);
        let result: Result<(), _> = policy
            .run("test", &CancellationToken::new(), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        match result {
            Err(err @ PipelineError::Store { attempts: 3, .. }) => {
                assert!(err.is_transient_store_failure());
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeouts_surface_immediately_when_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let mut policy = policy().without_timeout_retry();
        policy.attempt_timeout = Duration::from_millis(5);
        let result: Result<(), _> = policy
            .run("test", &CancellationToken::new(), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::Store {
                attempts: 1,
                source: StoreError::Timeout(_)
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unavailable_is_still_retried_without_timeout_retry() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = policy()
            .without_timeout_retry()
            .run("test", &CancellationToken::new(), move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StoreError::Unavailable("down".to_string()))
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
