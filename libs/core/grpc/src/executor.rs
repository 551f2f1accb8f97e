//! Run a single unary call and capture its outcome as a [`GrpcResponse`]
//!
//! Failures never escape as errors: a failed call produces an envelope
//! carrying the status code, description and trailers.

use crate::response::GrpcResponse;
use std::future::Future;
use std::time::{Duration, Instant};
use tonic::Status;
use tracing::error;

/// Invoke `callable` once with `request`, timing it
///
/// # Example
/// ```ignore
/// let response = execute_unary(tonic::Request::new(request), |req| {
///     let mut client = client.clone();
///     async move { client.get_campaign(req).await }
/// })
/// .await;
/// ```
pub async fn execute_unary<Req, Resp, F, Fut>(
  request: tonic::Request<Req>,
  callable: F,
) -> GrpcResponse<Resp>
where
  F: FnOnce(tonic::Request<Req>) -> Fut,
  Fut: Future<Output = Result<tonic::Response<Resp>, Status>>,
{
  let start = Instant::now();
  let result = callable(request).await;
  let latency = start.elapsed();

  if let Err(status) = &result {
    error!(
      target: "grpc_client",
      code = ?status.code(),
      description = status.message(),
      latency_ms = latency.as_millis() as u64,
      "gRPC call failed with status"
    );
  }

  GrpcResponse::from_result(result, latency)
}

/// Same as [`execute_unary`] with a per-call deadline
///
/// The deadline travels as `grpc-timeout` metadata, so the transport fails the
/// call with `DEADLINE_EXCEEDED` once it elapses.
pub async fn execute_with_deadline<Req, Resp, F, Fut>(
  mut request: tonic::Request<Req>,
  callable: F,
  timeout: Duration,
) -> GrpcResponse<Resp>
where
  F: FnOnce(tonic::Request<Req>) -> Fut,
  Fut: Future<Output = Result<tonic::Response<Resp>, Status>>,
{
  request.set_timeout(timeout);
  execute_unary(request, callable).await
}
