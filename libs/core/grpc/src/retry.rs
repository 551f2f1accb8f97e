//! Retry policy shared by the retry interceptor and the resilience manager

use crate::error::Classify;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How the wait between attempts grows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
  /// Same wait before every retry
  Fixed,
  /// `base_delay * 2^(n-1)` before the n-th retry
  Exponential,
}

/// Retry configuration
///
/// `max_attempts` counts the initial attempt, so `max_attempts = 3` means at
/// most two retries. Only failures classified as transient are retried.
#[derive(Debug, Clone)]
pub struct RetryConfig {
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub backoff: Backoff,
  /// Upper bound on a single wait
  pub max_delay: Option<Duration>,
}

impl Default for RetryConfig {
  /// Three attempts, fixed one second wait
  fn default() -> Self {
    Self::fixed(3, Duration::from_millis(1000))
  }
}

impl RetryConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn fixed(max_attempts: u32, wait: Duration) -> Self {
    Self {
      max_attempts,
      base_delay: wait,
      backoff: Backoff::Fixed,
      max_delay: None,
    }
  }

  pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
    Self {
      max_attempts,
      base_delay,
      backoff: Backoff::Exponential,
      max_delay: None,
    }
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts;
    self
  }

  pub fn with_base_delay(mut self, delay: Duration) -> Self {
    self.base_delay = delay;
    self
  }

  pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
    self.max_delay = Some(max_delay);
    self
  }

  /// Wait before the retry that follows failed attempt `attempt` (1-based)
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let delay = match self.backoff {
      Backoff::Fixed => self.base_delay,
      Backoff::Exponential => {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
      }
    };
    match self.max_delay {
      Some(max) => delay.min(max),
      None => delay,
    }
  }

  /// Whether failed attempt `attempt` should be followed by another one
  pub fn should_retry<E: Classify>(&self, error: &E, attempt: u32) -> bool {
    attempt < self.max_attempts && error.is_transient()
  }
}

/// Retry `operation` with the default configuration
///
/// # Example
/// ```ignore
/// let response = retry(|| {
///     let mut client = client.clone();
///     async move { client.get_campaign(request.clone()).await }
/// })
/// .await?;
/// ```
pub async fn retry<T, E, F, Fut>(operation: F) -> Result<T, E>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
  E: Classify + Display,
{
  retry_with_backoff(operation, &RetryConfig::default()).await
}

/// Retry `operation` while it fails transiently, waiting per `config`
pub async fn retry_with_backoff<T, E, F, Fut>(mut operation: F, config: &RetryConfig) -> Result<T, E>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
  E: Classify + Display,
{
  let mut attempt = 1;
  loop {
    match operation().await {
      Ok(value) => {
        if attempt > 1 {
          debug!(target: "grpc_client", attempt, "Operation succeeded after retry");
        }
        return Ok(value);
      }
      Err(err) if config.should_retry(&err, attempt) => {
        let delay = config.delay_for(attempt);
        warn!(
          target: "grpc_client",
          attempt,
          max_attempts = config.max_attempts,
          delay_ms = delay.as_millis() as u64,
          error = %err,
          "Retry attempt failed with transient error"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      Err(err) => return Err(err),
    }
  }
}
