use super::{CallResult, Interceptor, Next, OutboundCall};
use crate::config::ClientConfig;
use crate::retry::RetryConfig;
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// Re-issues calls that fail with a transient status
///
/// `UNAVAILABLE`, `DEADLINE_EXCEEDED` and `RESOURCE_EXHAUSTED` are retried up to
/// `max_retries` times after the initial attempt, waiting
/// `backoff * 2^(n-1)` before the n-th re-issue. Every re-issue runs the
/// inner interceptors again. Any other status is returned as is.
#[derive(Clone, Debug)]
pub struct RetryInterceptor {
    config: RetryConfig,
}

impl RetryInterceptor {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            config: RetryConfig::exponential(max_retries.saturating_add(1), backoff),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.max_retry_attempts,
            Duration::from_millis(config.retry_backoff_ms),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_attempts.saturating_sub(1)
    }
}

#[async_trait]
impl Interceptor for RetryInterceptor {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn intercept(&self, call: OutboundCall, next: Next<'_>) -> CallResult {
        let mut attempt = call.attempt();
        loop {
            match next.run(call.clone().with_attempt(attempt)).await {
                Err(status) if self.config.should_retry(&status, attempt) => {
                    let delay = self.config.delay_for(attempt);
                    warn!(
                        target: "grpc_client",
                        method = call.method(),
                        attempt,
                        max_retries = self.max_retries(),
                        delay_ms = delay.as_millis() as u64,
                        code = ?status.code(),
                        "Retrying gRPC call after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptors::test_support::{Pong, call};
    use crate::interceptors::{CallResult, InboundResponse, InterceptorChain, Transport};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tonic::metadata::MetadataMap;
    use tonic::{Code, Status};

    /// Fails with `code` for the first `failures` calls, then succeeds
    struct Flaky {
        code: Code,
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(code: Code, failures: u32) -> Self {
            Self {
                code,
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for Flaky {
        async fn send(&self, call: OutboundCall) -> CallResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(call.attempt(), n);
            if n <= self.failures {
                Err(Status::new(self.code, format!("failure {n}")))
            } else {
                Ok(InboundResponse::new(MetadataMap::new(), Arc::new(Pong { id: n })))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_reissued() {
        let chain = InterceptorChain::new().wrap(RetryInterceptor::new(3, Duration::from_millis(100)));
        let transport = Flaky::new(Code::Unavailable, 2);

        let started = tokio::time::Instant::now();
        assert!(chain.execute(call("svc/A"), &transport).await.is_ok());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let chain = InterceptorChain::new().wrap(RetryInterceptor::new(2, Duration::from_millis(10)));
        let transport = Flaky::new(Code::DeadlineExceeded, 10);

        let err = chain.execute(call("svc/A"), &transport).await.unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert_eq!(err.message(), "failure 3");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_status_returned_immediately() {
        let chain = InterceptorChain::new().wrap(RetryInterceptor::new(3, Duration::from_millis(10)));
        let transport = Flaky::new(Code::InvalidArgument, 1);

        let err = chain.execute(call("svc/A"), &transport).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_from_config() {
        let config = ClientConfig::new().with_retry(5, 50);
        assert_eq!(RetryInterceptor::from_config(&config).max_retries(), 5);
    }
}
