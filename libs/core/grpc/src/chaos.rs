//! Canned failures for exercising retry and circuit-breaker paths
//!
//! ## Example
//! ```ignore
//! let outage = FailFirst::new(2, Code::Unavailable);
//! let response = client
//!     .execute_unary("campaign.v1.CampaignService/GetCampaign", request, |req| {
//!         let outage = outage.clone();
//!         async move {
//!             outage.check()?;
//!             Ok(tonic::Response::new(campaign()))
//!         }
//!     })
//!     .await;
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tonic::{Code, Status};
use tracing::warn;

/// Constructors for the statuses a flaky dependency typically returns
#[derive(Debug, Clone, Copy)]
pub struct FailureSimulator;

impl FailureSimulator {
  pub fn unavailable() -> Status {
    warn!(target: "grpc_client", "Simulating UNAVAILABLE");
    Status::unavailable("Service temporarily unavailable")
  }

  pub fn deadline_exceeded() -> Status {
    warn!(target: "grpc_client", "Simulating DEADLINE_EXCEEDED");
    Status::deadline_exceeded("Request deadline exceeded")
  }

  pub fn cancelled() -> Status {
    warn!(target: "grpc_client", "Simulating CANCELLED");
    Status::cancelled("Request cancelled by client")
  }

  pub fn resource_exhausted() -> Status {
    warn!(target: "grpc_client", "Simulating RESOURCE_EXHAUSTED");
    Status::resource_exhausted("Server resource exhausted")
  }

  pub fn invalid_argument(message: impl Into<String>) -> Status {
    Status::invalid_argument(message)
  }

  pub fn not_found(id: impl std::fmt::Display) -> Status {
    Status::not_found(format!("Resource not found: {id}"))
  }

  pub fn permission_denied() -> Status {
    Status::permission_denied("Permission denied")
  }

  pub fn unauthenticated() -> Status {
    Status::unauthenticated("Authentication required")
  }

  /// Fails every `fail_every_n`-th call with `UNAVAILABLE`
  pub fn intermittent(call_count: u32, fail_every_n: u32) -> Result<(), Status> {
    if fail_every_n > 0 && call_count % fail_every_n == 0 {
      warn!(target: "grpc_client", call_count, fail_every_n, "Simulating intermittent failure");
      return Err(Self::unavailable());
    }
    Ok(())
  }

  /// Suspend for `latency` before the caller proceeds
  pub async fn network_latency(latency: Duration) {
    warn!(target: "grpc_client", latency_ms = latency.as_millis() as u64, "Simulating network latency");
    tokio::time::sleep(latency).await;
  }
}

/// Fails the first `n` checks with `code`, then succeeds
///
/// Clones share the counter.
#[derive(Debug, Clone)]
pub struct FailFirst {
  failures: u32,
  code: Code,
  calls: Arc<AtomicU32>,
}

impl FailFirst {
  pub fn new(failures: u32, code: Code) -> Self {
    Self {
      failures,
      code,
      calls: Arc::new(AtomicU32::new(0)),
    }
  }

  pub fn check(&self) -> Result<(), Status> {
    let call = self.calls.fetch_add(1, Ordering::SeqCst);
    if call < self.failures {
      warn!(target: "grpc_client", call = call + 1, code = ?self.code, "Simulating failure");
      return Err(Status::new(self.code, format!("simulated failure {} of {}", call + 1, self.failures)));
    }
    Ok(())
  }

  /// Number of checks made so far
  pub fn calls(&self) -> u32 {
    self.calls.load(Ordering::SeqCst)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::{Classify, ErrorCategory};
  use tokio_test::{assert_err, assert_ok};

  #[test]
  fn test_canned_statuses() {
    let unavailable = FailureSimulator::unavailable();
    assert_eq!(unavailable.code(), Code::Unavailable);
    assert_eq!(unavailable.message(), "Service temporarily unavailable");
    assert!(unavailable.is_transient());

    assert_eq!(FailureSimulator::not_found(42).message(), "Resource not found: 42");
    assert_eq!(FailureSimulator::unauthenticated().category(), ErrorCategory::ClientInput);
    assert_eq!(FailureSimulator::cancelled().category(), ErrorCategory::Permanent);
    assert!(FailureSimulator::deadline_exceeded().is_transient());
    assert!(FailureSimulator::resource_exhausted().is_transient());
  }

  #[test]
  fn test_intermittent() {
    let outcomes: Vec<bool> = (1..=6).map(|n| FailureSimulator::intermittent(n, 3).is_ok()).collect();
    assert_eq!(outcomes, [true, true, false, true, true, false]);
    assert_ok!(FailureSimulator::intermittent(5, 0));
  }

  #[test]
  fn test_fail_first() {
    let outage = FailFirst::new(2, Code::ResourceExhausted);
    let shared = outage.clone();

    assert_eq!(outage.check().unwrap_err().code(), Code::ResourceExhausted);
    assert_err!(shared.check());
    assert_ok!(outage.check());
    assert_eq!(shared.calls(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_network_latency_sleeps() {
    let start = tokio::time::Instant::now();
    FailureSimulator::network_latency(Duration::from_millis(300)).await;
    assert!(start.elapsed() >= Duration::from_millis(300));
  }
}
