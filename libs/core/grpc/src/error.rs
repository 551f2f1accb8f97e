//! Error types and failure classification
//!
//! Failures are categorized to decide retry and circuit-breaker behaviour:
//! - **Transient**: `UNAVAILABLE`, `DEADLINE_EXCEEDED`, `RESOURCE_EXHAUSTED`.
//!   Retried with backoff, counted by the circuit breaker.
//! - **ClientInput**: `INVALID_ARGUMENT`, `NOT_FOUND`, `PERMISSION_DENIED`,
//!   `UNAUTHENTICATED`. Never retried, surfaced immediately.
//! - **Permanent**: every other non-OK status. Never retried.
//! - **Fatal**: local failures (bad configuration, malformed address).

use thiserror::Error;
use tonic::Code;

pub type GrpcResult<T> = Result<T, GrpcError>;

/// Errors raised by the harness itself (never by a remote service)
#[derive(Error, Debug)]
pub enum GrpcError {
  /// Invalid URI built from a host/port pair
  #[error("Invalid URI: {0}")]
  InvalidUri(#[from] tonic::transport::Error),

  /// Invalid configuration
  #[error("Invalid configuration: {0}")]
  InvalidConfig(String),

  /// Configuration could not be loaded from the environment
  #[error(transparent)]
  Config(#[from] core_config::ConfigError),

  /// The channel was shut down and no longer accepts calls
  #[error("Channel {0} has been shut down")]
  ChannelClosed(String),
}

// Implement conversion to tonic::Status for use in interceptors
impl From<GrpcError> for tonic::Status {
  fn from(err: GrpcError) -> Self {
    match err {
      GrpcError::InvalidUri(_) | GrpcError::InvalidConfig(_) | GrpcError::Config(_) => {
        tonic::Status::invalid_argument(err.to_string())
      }
      GrpcError::ChannelClosed(_) => tonic::Status::unavailable(err.to_string()),
    }
  }
}

/// Category of a failure for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
  /// Temporary failure, eligible for retry
  Transient,
  /// The caller sent something the server rejected
  ClientInput,
  /// Non-retryable server-side failure
  Permanent,
  /// Local failure inside the client
  Fatal,
}

impl ErrorCategory {
  /// Category for a gRPC status code. `OK` has no meaningful category and is
  /// reported as `Permanent` so it is never retried.
  pub fn from_code(code: Code) -> Self {
    match code {
      Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted => {
        ErrorCategory::Transient
      }
      Code::InvalidArgument
      | Code::NotFound
      | Code::PermissionDenied
      | Code::Unauthenticated => ErrorCategory::ClientInput,
      _ => ErrorCategory::Permanent,
    }
  }

  pub fn is_retryable(&self) -> bool {
    matches!(self, ErrorCategory::Transient)
  }
}

/// Classification of an operation failure
///
/// Implemented for the failure types the resilience layer understands. Custom
/// error types can implement it to opt into retries.
pub trait Classify {
  fn category(&self) -> ErrorCategory;

  fn is_transient(&self) -> bool {
    self.category().is_retryable()
  }
}

impl Classify for tonic::Status {
  fn category(&self) -> ErrorCategory {
    ErrorCategory::from_code(self.code())
  }
}

impl Classify for GrpcError {
  fn category(&self) -> ErrorCategory {
    match self {
      GrpcError::ChannelClosed(_) => ErrorCategory::Transient,
      _ => ErrorCategory::Fatal,
    }
  }
}
