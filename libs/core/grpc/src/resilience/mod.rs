//! Retry and circuit breaking around arbitrary async operations
//!
//! [`ResilienceManager`] owns one retry configuration (three attempts, fixed
//! one second wait) and one circuit breaker (count window of 10, minimum 5
//! calls, opens above 50% failures, 30s wait, one trial call). The combined
//! form runs the breaker around the retry loop, so an exhausted retry
//! sequence counts as a single failure.
//!
//! ## Example
//!
//! ```rust,ignore
//! use grpc_harness::resilience::ResilienceManager;
//!
//! let resilience = ResilienceManager::new();
//! let campaign = resilience
//!     .execute_with_resilience(|| client.execute_unary(method, request.clone(), get_campaign).into_result())
//!     .await?;
//! ```

pub mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

use crate::error::Classify;
use crate::retry::{RetryConfig, retry_with_backoff};
use std::fmt::Display;
use std::future::Future;
use thiserror::Error;

/// Failure of a resilient execution
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// The breaker rejected the call without running it
    #[error("circuit breaker is open, call not permitted")]
    CircuitOpen,

    /// The operation's own failure (after retries, if any)
    #[error("{0}")]
    Operation(E),
}

impl<E> ResilienceError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen)
    }

    pub fn into_operation_error(self) -> Option<E> {
        match self {
            ResilienceError::Operation(e) => Some(e),
            ResilienceError::CircuitOpen => None,
        }
    }
}

impl From<ResilienceError<tonic::Status>> for tonic::Status {
    fn from(err: ResilienceError<tonic::Status>) -> Self {
        match err {
            ResilienceError::CircuitOpen => tonic::Status::unavailable(err.to_string()),
            ResilienceError::Operation(status) => status,
        }
    }
}

/// Releases an unrecorded breaker permission when the call is dropped mid-flight
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    recorded: bool,
}

impl Permit<'_> {
    fn success(mut self) {
        self.recorded = true;
        self.breaker.record_success();
    }

    fn failure(mut self) {
        self.recorded = true;
        self.breaker.record_failure();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.release_permission();
        }
    }
}

/// Retry and circuit breaker policies for wrapping calls
#[derive(Debug, Default)]
pub struct ResilienceManager {
    retry: RetryConfig,
    circuit_breaker: CircuitBreaker,
}

impl ResilienceManager {
    /// Manager with the default retry and breaker policies
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(retry: RetryConfig, circuit_breaker: CircuitBreakerConfig) -> Self {
        Self {
            retry,
            circuit_breaker: CircuitBreaker::new(circuit_breaker),
        }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    /// Run `operation`, retrying transient failures
    pub async fn execute_with_retry<T, E, F, Fut>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        retry_with_backoff(operation, &self.retry)
            .await
            .map_err(ResilienceError::Operation)
    }

    /// Run `operation` once if the breaker permits it
    ///
    /// Every failure, whatever its category, counts against the breaker.
    pub async fn execute_with_circuit_breaker<T, E, F, Fut>(
        &self,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.circuit_breaker.try_acquire_permission() {
            tracing::debug!(
                target: "grpc_client",
                breaker = self.circuit_breaker.name(),
                "Call rejected by open circuit breaker"
            );
            return Err(ResilienceError::CircuitOpen);
        }
        let permit = Permit {
            breaker: &self.circuit_breaker,
            recorded: false,
        };

        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                permit.failure();
                Err(ResilienceError::Operation(err))
            }
        }
    }

    /// Breaker around retry: the whole retry sequence is one breaker call
    pub async fn execute_with_resilience<T, E, F, Fut>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        self.execute_with_circuit_breaker(|| retry_with_backoff(operation, &self.retry))
            .await
    }
}
